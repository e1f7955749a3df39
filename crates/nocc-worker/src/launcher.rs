//! Compiler launcher: bounded-parallelism execution of the real compiler,
//! plus the serialized PCH compile path.
//!
//! A session becomes ready when every dependency left the `Uploading` state;
//! readiness sweeps run after each such transition. The compiler starts at
//! most once per session (a CAS claims it), and at most `CompilerQueueSize`
//! compiler processes run at a time so peak load can't over-utilize the box.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;

use nocc_protocol::{fileio, PchInvocation, Sha256Digest};

use crate::clients::{Client, ClientFile, FileState};
use crate::obj_cache::ObjFileCache;
use crate::session::{split_include_args, Session, SessionResult};
use crate::sync::Semaphore;

pub struct CompilerLauncher {
    throttle: Semaphore,
}

impl CompilerLauncher {
    pub fn new(max_parallel_processes: usize) -> Self {
        Self {
            throttle: Semaphore::new(max_parallel_processes.max(1)),
        }
    }

    /// Run the compiler, capture everything. Never errors: a launch failure
    /// becomes exit code 1 with the reason on stderr.
    pub fn exec_compiler(&self, cwd: &Path, compiler_name: &str, args: &[String]) -> SessionResult {
        let _permit = self.throttle.acquire();

        let started = Instant::now();
        let output = Command::new(compiler_name).args(args).current_dir(cwd).output();
        let duration_ms = started.elapsed().as_millis() as i32;

        match output {
            Ok(output) => SessionResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration_ms,
            },
            Err(e) => SessionResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("can't launch {compiler_name}: {e}\n"),
                duration_ms,
            },
        }
    }
}

/// Re-check every session of this client that hasn't started its compiler.
/// Called after uploads complete, after PCH transitions, and after session
/// creation (a session may be ready immediately from the source cache).
pub fn launch_on_ready_sessions(
    launcher: &Arc<CompilerLauncher>,
    obj_cache: &Arc<ObjFileCache>,
    client: &Arc<Client>,
) {
    for session in client.sessions_not_started_compilation() {
        start_compiling_if_possible(launcher, obj_cache, client, &session);
    }
}

/// Launch the session's compiler if every dependency is in place.
pub fn start_compiling_if_possible(
    launcher: &Arc<CompilerLauncher>,
    obj_cache: &Arc<ObjFileCache>,
    client: &Arc<Client>,
    session: &Arc<Session>,
) {
    for file in &session.files {
        if file.state() == FileState::Uploading {
            return;
        }
    }

    let launcher = Arc::clone(launcher);
    let obj_cache = Arc::clone(obj_cache);
    let client = Arc::clone(client);
    let session = Arc::clone(session);
    if session.pch_file.is_some() {
        std::thread::spawn(move || {
            start_compiling_pch_if_possible(&launcher, &obj_cache, &client, &session)
        });
    } else {
        std::thread::spawn(move || {
            launch_compiler_when_possible(&launcher, &obj_cache, &client, &session)
        });
    }
}

/// PCH gate: the sidecar compiles to a real PCH exactly once per client;
/// every dependent session waits on its state.
fn start_compiling_pch_if_possible(
    launcher: &Arc<CompilerLauncher>,
    obj_cache: &Arc<ObjFileCache>,
    client: &Arc<Client>,
    session: &Arc<Session>,
) {
    let Some(pch_file) = session.pch_file.clone() else {
        return;
    };

    match pch_file.state() {
        FileState::PchCompiled => {
            launch_compiler_when_possible(launcher, obj_cache, client, session);
        }
        FileState::PchCompileError => {
            fail_session_on_pch_error(client, session, &pch_file);
        }
        _ => {
            if pch_file.compare_and_swap(FileState::Uploaded, FileState::PchCompiling) {
                tracing::info!("compiling pch file {}", pch_file.server_file_name.display());
                match compile_pch(launcher, obj_cache, client, &pch_file) {
                    Ok(()) => {
                        pch_file.set_state(FileState::PchCompiled);
                        tracing::info!("pch file compiled: {}", pch_file.client_file_name);
                    }
                    Err(e) => {
                        tracing::error!("pch compilation failed: {e}");
                        pch_file.set_state(FileState::PchCompileError);
                    }
                }
                // waiters re-check on this sweep, including this session
                launch_on_ready_sessions(launcher, obj_cache, client);
            }
            // someone else holds PchCompiling: the sweep after their
            // transition picks this session up again
        }
    }
}

fn fail_session_on_pch_error(client: &Arc<Client>, session: &Arc<Session>, pch_file: &ClientFile) {
    if !session.try_start_compilation() {
        return;
    }
    session.set_result(SessionResult {
        exit_code: -1,
        stdout: String::new(),
        stderr: format!(
            "failed to compile precompiled header {} on the worker\n",
            pch_file.client_file_name
        ),
        duration_ms: 0,
    });
    client.push_ready_session(Arc::clone(session));
}

/// Compile the sidecar's real PCH into the client mirror, via the object
/// cache: the sidecar's recorded hash is the cache key, so across clients
/// the PCH compiles once per worker lifetime.
fn compile_pch(
    launcher: &Arc<CompilerLauncher>,
    obj_cache: &Arc<ObjFileCache>,
    client: &Arc<Client>,
    pch_file: &ClientFile,
) -> Result<(), String> {
    let sidecar = PchInvocation::load(&pch_file.server_file_name).map_err(|e| e.to_string())?;
    let cache_key = Sha256Digest::from_long_hex(&sidecar.hash);
    if cache_key.is_empty() {
        return Err(format!("bad hash in pch sidecar {}", pch_file.client_file_name));
    }

    let client_output = client.map_client_path_to_server_abs(&sidecar.output_file);
    fileio::mkdir_for_file(&client_output).map_err(|e| e.to_string())?;

    if let Some(cached) = obj_cache.lookup(&cache_key) {
        tracing::info!("pch already compiled: {}", sidecar.output_file);
        return match std::fs::hard_link(&cached, &client_output) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(format!("can't link cached pch: {e}")),
        };
    }

    let cmd_line = prepare_server_compiler_cmd_line(
        client,
        &sidecar.input_file,
        &client_output,
        &sidecar.args,
    );
    let result = launcher.exec_compiler(&client.working_dir, &sidecar.compiler, &cmd_line);
    if result.exit_code != 0 {
        return Err(format!(
            "could not compile pch {}: compiler exited with code {}\n{}{}",
            sidecar.input_file, result.exit_code, result.stdout, result.stderr
        ));
    }

    if let Ok(meta) = std::fs::metadata(&client_output) {
        let cache_name = client_output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pch".to_string());
        if let Err(e) = obj_cache.save(&client_output, &cache_name, &cache_key, meta.len()) {
            tracing::error!("can't cache compiled pch: {e}");
        }
    }
    Ok(())
}

/// Spawn the real compiler for one session; exactly one caller per session
/// gets past the CAS.
pub fn launch_compiler_when_possible(
    launcher: &Arc<CompilerLauncher>,
    obj_cache: &Arc<ObjFileCache>,
    client: &Arc<Client>,
    session: &Arc<Session>,
) {
    if !session.try_start_compilation() {
        return;
    }

    let output_file = obj_cache.obj_out_path(&client.client_id, session.session_id);
    session.set_output_file(output_file.clone());

    let cmd_line = prepare_server_compiler_cmd_line(
        client,
        &session.input_file,
        &output_file,
        &session.compiler_args,
    );
    tracing::debug!(
        "launch compiler: sessionID {}, clientID {}, {:?}",
        session.session_id,
        client.client_id,
        cmd_line
    );

    let mut result = launcher.exec_compiler(&client.working_dir, &session.compiler_name, &cmd_line);
    if result.duration_ms > 30000 {
        tracing::info!(
            "compiled very heavy file: sessionID {}, {} ms, {}",
            session.session_id,
            result.duration_ms,
            session.input_file
        );
    }

    // the client sees paths as if compilation had been local
    result.stdout = client.map_server_path_to_client(&result.stdout);
    result.stderr = client.map_server_path_to_client(&result.stderr);

    // cache only clean successes: cached warnings would vanish on replay
    if result.exit_code == 0
        && result.stdout.is_empty()
        && result.stderr.is_empty()
        && !session.obj_cache_key.is_empty()
    {
        if let Ok(meta) = std::fs::metadata(&output_file) {
            let base = Path::new(&session.input_file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "in".to_string());
            if let Err(e) = obj_cache.save(
                &output_file,
                &format!("{base}.o"),
                &session.obj_cache_key,
                meta.len(),
            ) {
                tracing::error!("can't cache obj file: {e}");
            }
        }
    } else if result.exit_code != 0 {
        tracing::error!(
            "compiler exited with code {}: sessionID {}, {}",
            result.exit_code,
            session.session_id,
            session.input_file
        );
    }

    session.set_result(result);
    client.push_ready_session(Arc::clone(session));
}

/// Build the worker-side command line: include-path arguments are remapped
/// into the mirror, everything else passes through, `-o` and the input are
/// appended last. An absolute input maps into the mirror; a relative one
/// stays relative (correct `__FILE__` expansion).
pub fn prepare_server_compiler_cmd_line(
    client: &Client,
    input_file: &str,
    output_file: &Path,
    compiler_args: &[String],
) -> Vec<String> {
    let (include_args, rest) = split_include_args(compiler_args);

    let mut cmd_line: Vec<String> = Vec::with_capacity(compiler_args.len() + 3);
    for (prefix, value) in include_args {
        cmd_line.extend(prefix);
        cmd_line.push(
            client
                .map_client_path_to_server_abs(&value)
                .to_string_lossy()
                .into_owned(),
        );
    }
    cmd_line.extend(rest);

    cmd_line.push("-o".to_string());
    cmd_line.push(output_file.to_string_lossy().into_owned());
    if input_file.starts_with('/') {
        cmd_line.push(
            client
                .map_client_path_to_server_abs(input_file)
                .to_string_lossy()
                .into_owned(),
        );
    } else {
        cmd_line.push(input_file.to_string());
    }
    cmd_line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientsStorage;

    fn strs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn test_client(dir: &Path) -> Arc<Client> {
        ClientsStorage::new(&dir.join("clients"), &[], &dir.join("obj"), false)
            .on_client_connected("abc")
            .unwrap()
    }

    #[test]
    fn test_exec_compiler_captures_result() {
        let launcher = CompilerLauncher::new(2);
        let dir = tempfile::tempdir().unwrap();

        let result = launcher.exec_compiler(
            dir.path(),
            "sh",
            &strs(&["-c", "echo out; echo err >&2; exit 2"]),
        );
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn test_exec_compiler_missing_binary() {
        let launcher = CompilerLauncher::new(1);
        let dir = tempfile::tempdir().unwrap();
        let result = launcher.exec_compiler(dir.path(), "/no/such/compiler", &[]);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("can't launch"));
    }

    #[test]
    fn test_prepare_cmd_line_remaps_includes_and_input() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client(dir.path());

        let cmd_line = prepare_server_compiler_cmd_line(
            &client,
            "/home/u/foo.cpp",
            Path::new("/out/foo.o"),
            &strs(&["-Wall", "-I", "/home/u/inc"]),
        );

        let wd = client.working_dir.to_string_lossy().into_owned();
        assert_eq!(cmd_line[0], "-I");
        assert_eq!(cmd_line[1], format!("{wd}/home/u/inc"));
        assert_eq!(cmd_line[2], "-Wall");
        assert_eq!(cmd_line[3], "-o");
        assert_eq!(cmd_line[4], "/out/foo.o");
        assert_eq!(cmd_line[5], format!("{wd}/home/u/foo.cpp"));
    }

    #[test]
    fn test_relative_input_stays_relative() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client(dir.path());
        let cmd_line =
            prepare_server_compiler_cmd_line(&client, "src/foo.cpp", Path::new("/o.o"), &[]);
        assert_eq!(cmd_line.last().map(String::as_str), Some("src/foo.cpp"));
    }
}
