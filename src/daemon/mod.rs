//! Daemon core: invocation registry, worker selection, local fallback and
//! lifecycle.
//!
//! The daemon is spawned by the first wrapper invocation, serves every
//! concurrent wrapper call over a unix socket, keeps one connection per
//! configured worker, and exits by itself once the build stops sending work.

pub mod listener;
pub mod receive;
pub mod remote;
pub mod upload;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use nocc_protocol::{fileio, FileMetadata, PchInvocation, Sha256Digest};

use crate::config::DaemonConfig;
use crate::includes::{collect_dependent_includes, IncludesCache};
use crate::invocation::{Invocation, InvokeType};
use crate::localexec::LocalCompilerLaunch;
use listener::{SockRequest, SockResponse};
use crate::sync::{QuitSignal, Semaphore};
use remote::RemoteConnection;

pub use listener::DaemonUnixSockListener;

/// How often hung invocations are checked.
const TIMEOUT_SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// How often each connected worker is pinged.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(5);

/// Registry of invocations currently in the remote pipeline.
pub struct ActiveInvocations {
    map: RwLock<HashMap<u32, Arc<Invocation>>>,
}

impl ActiveInvocations {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(300)),
        }
    }

    pub fn register(&self, invocation: &Arc<Invocation>) {
        let mut map = self.map.write().unwrap_or_else(|p| p.into_inner());
        map.insert(invocation.session_id, Arc::clone(invocation));
    }

    pub fn unregister(&self, session_id: u32) {
        let mut map = self.map.write().unwrap_or_else(|p| p.into_inner());
        map.remove(&session_id);
    }

    pub fn find(&self, session_id: u32) -> Option<Arc<Invocation>> {
        let map = self.map.read().unwrap_or_else(|p| p.into_inner());
        map.get(&session_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.map.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Force-error every invocation older than `timeout`.
    pub fn interrupt_older_than(&self, timeout: Duration) {
        let map = self.map.read().unwrap_or_else(|p| p.into_inner());
        for invocation in map.values() {
            let age = invocation.created_at.elapsed();
            if age > timeout {
                tracing::error!(
                    "force interrupt sessionID {} ({}) after {} sec timeout",
                    invocation.session_id,
                    invocation.cpp_in_file,
                    age.as_secs()
                );
                invocation.force_interrupt(format!(
                    "interrupt sessionID {} after {} sec timeout",
                    invocation.session_id,
                    age.as_secs()
                ));
            }
        }
    }

    pub fn interrupt_all(&self, reason: &str) {
        let map = self.map.read().unwrap_or_else(|p| p.into_inner());
        for invocation in map.values() {
            invocation.force_interrupt(reason.to_string());
        }
    }
}

impl Default for ActiveInvocations {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Daemon {
    pub client_id: String,
    pub quit: Arc<QuitSignal>,
    pub active_invocations: Arc<ActiveInvocations>,

    remotes: Vec<Arc<RemoteConnection>>,
    local_throttle: Semaphore,
    disable_local_compiler: bool,
    includes_cache: IncludesCache,
    invocation_timeout: Duration,
    total_invocations: AtomicU32,
}

impl Daemon {
    pub fn new(config: &DaemonConfig) -> Arc<Self> {
        let client_id = config.effective_client_id();
        let quit = Arc::new(QuitSignal::new());
        let active_invocations = Arc::new(ActiveInvocations::new());

        let remotes: Vec<Arc<RemoteConnection>> = config
            .servers
            .iter()
            .map(|host_port| {
                RemoteConnection::new(
                    host_port,
                    &client_id,
                    &config.socks_proxy_addr,
                    Duration::from_secs(config.connection_timeout.max(1)),
                    Arc::clone(&active_invocations),
                    Arc::clone(&quit),
                )
            })
            .collect();

        Arc::new(Self {
            client_id,
            quit,
            active_invocations,
            remotes,
            local_throttle: Semaphore::new(config.compiler_queue_size.max(1)),
            disable_local_compiler: config.compiler_queue_size == 0,
            includes_cache: IncludesCache::new(),
            invocation_timeout: Duration::from_secs(config.invocation_timeout.max(1)),
            total_invocations: AtomicU32::new(0),
        })
    }

    /// Connect every worker and spawn the periodic tasks.
    pub fn start(self: &Arc<Self>) {
        for remote in &self.remotes {
            remote.start();
        }

        let daemon = Arc::clone(self);
        std::thread::spawn(move || {
            while !daemon.quit.wait_timeout(TIMEOUT_SWEEP_PERIOD) {
                daemon
                    .active_invocations
                    .interrupt_older_than(daemon.invocation_timeout);
            }
        });

        let daemon = Arc::clone(self);
        std::thread::spawn(move || {
            while !daemon.quit.wait_timeout(KEEP_ALIVE_PERIOD) {
                for remote in &daemon.remotes {
                    remote.keep_alive();
                }
            }
        });
    }

    pub fn quit_gracefully(&self, reason: &str) {
        if self.quit.is_quit() {
            return;
        }
        tracing::info!("daemon quit: {reason}");
        self.quit.quit();

        for remote in &self.remotes {
            remote.send_stop_client();
            remote.clear();
        }
        self.active_invocations
            .interrupt_all(&format!("daemon quit: {reason}"));
    }

    /// Entry point for every wrapper request.
    pub fn handle_invocation(&self, request: SockRequest) -> SockResponse {
        let session_id = self.total_invocations.fetch_add(1, Ordering::SeqCst) + 1;
        let invocation = Arc::new(Invocation::parse(
            session_id,
            request.uid,
            request.gid,
            &request.cwd,
            &request.compiler,
            &request.cmd_line,
        ));

        match invocation.invoke_type {
            InvokeType::Unsupported => {
                let reason = invocation
                    .parse_error
                    .clone()
                    .unwrap_or_else(|| "unexpected invokeType after parsing".to_string());
                self.invoke_local_compilation(&request, Some(reason))
            }
            InvokeType::LocalCompile => self.invoke_local_compilation(&request, None),
            InvokeType::Link => {
                tracing::debug!("fallback to local compiler for linking");
                self.invoke_local_compilation(&request, None)
            }
            InvokeType::CompilePch => {
                tracing::debug!("compiling pch locally: {}", invocation.cpp_in_file);
                self.invoke_pch_compilation(&request, &invocation)
            }
            InvokeType::CompileCpp => {
                tracing::debug!("compiling remotely: {}", invocation.cpp_in_file);
                match self.invoke_remote_compilation(&invocation) {
                    // a non-zero exit code is a C++ error: deliver it as-is,
                    // the compiler would fail the same way locally
                    Ok(response) => response,
                    Err(remote_error) => {
                        let mut response =
                            self.invoke_local_compilation(&request, Some(remote_error));
                        if response.exit_code == 0 {
                            let message = format!(
                                "compiling {} remotely on {} failed, but succeeded locally\n",
                                invocation.cpp_in_file,
                                remote::lock(&invocation.remote_host)
                            );
                            tracing::error!("{}", message.trim_end());
                            response.stderr = message.into_bytes();
                        }
                        response
                    }
                }
            }
        }
    }

    fn invoke_local_compilation(
        &self,
        request: &SockRequest,
        reason: Option<String>,
    ) -> SockResponse {
        if let Some(reason) = reason {
            tracing::error!("compiling locally: {reason}");
        }
        if self.disable_local_compiler {
            return SockResponse {
                exit_code: 1,
                stdout: Vec::new(),
                stderr: b"fallback to local compiler disabled".to_vec(),
            };
        }

        let _guard = self.local_throttle.acquire();
        let result = LocalCompilerLaunch {
            cwd: &request.cwd,
            compiler: &request.compiler,
            cmd_line: &request.cmd_line,
            uid: request.uid,
            gid: request.gid,
        }
        .run();

        SockResponse {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }

    /// PCH generation: compile the real `.gch`/`.pch` locally (the local
    /// fallback uses it), then write the sidecar the collector substitutes
    /// for the header on every dependent TU.
    fn invoke_pch_compilation(
        &self,
        request: &SockRequest,
        invocation: &Invocation,
    ) -> SockResponse {
        let response = self.invoke_local_compilation(request, None);
        if response.exit_code != 0 {
            return response;
        }

        let pch_hash = match Sha256Digest::of_file(Path::new(&invocation.obj_out_file)) {
            Ok((hash, _size)) => hash,
            Err(e) => {
                tracing::error!("can't hash {}: {e}", invocation.obj_out_file);
                return response;
            }
        };

        let sidecar = PchInvocation {
            hash: pch_hash.to_long_hex(),
            compiler: invocation.compiler_name.clone(),
            input_file: invocation.cpp_in_file.clone(),
            output_file: invocation.obj_out_file.clone(),
            args: invocation.compiler_args.clone(),
        };
        let sidecar_path = fileio::replace_file_ext(&invocation.obj_out_file, ".nocc-pch");

        match sidecar.to_json() {
            Ok(bytes) => {
                if let Err(e) = fileio::write_file_atomic(Path::new(&sidecar_path), &bytes) {
                    tracing::error!("can't write {sidecar_path}: {e}");
                } else {
                    let _ = std::os::unix::fs::chown(
                        &sidecar_path,
                        Some(invocation.uid),
                        Some(invocation.gid),
                    );
                    tracing::info!("saved pch sidecar to {sidecar_path}");
                }
            }
            Err(e) => tracing::error!("can't serialize pch sidecar: {e}"),
        }

        response
    }

    fn invoke_remote_compilation(&self, invocation: &Arc<Invocation>) -> Result<SockResponse, String> {
        if self.remotes.is_empty() {
            return Err("no remote hosts configured".to_string());
        }

        let remote = self.choose_remote_for(&invocation.cpp_in_file);
        *remote::lock(&invocation.remote_host) = remote.remote_host.clone();

        if remote.is_unavailable() {
            return Err(format!("remote {} is unavailable", remote.remote_host));
        }

        self.active_invocations.register(invocation);
        let result = self.compile_cpp_remotely(remote, invocation);
        self.active_invocations.unregister(invocation.session_id);
        result
    }

    /// The full remote pipeline: collect dependencies, open a session, upload
    /// missing files, wait for the object.
    fn compile_cpp_remotely(
        &self,
        remote: &Arc<RemoteConnection>,
        invocation: &Arc<Invocation>,
    ) -> Result<SockResponse, String> {
        let started = Instant::now();
        invocation.wg_recv.add(1);

        let deps = collect_dependent_includes(invocation, &self.includes_cache)
            .map_err(|e| format!("failed to collect dependencies: {e}"))?;
        let collected_at = started.elapsed();

        // the depfile is a client-side artifact: emit it in parallel with
        // the remote session, from the discovered include list
        if invocation.dep_flags.should_generate_dep_file() {
            let dep_flags = invocation.dep_flags.clone();
            let cpp_in_file = invocation.cpp_in_file.clone();
            let obj_out_file = invocation.obj_out_file.clone();
            let dep_files = deps.dep_files.clone();
            let (uid, gid) = (invocation.uid, invocation.gid);
            std::thread::spawn(move || {
                match dep_flags.generate_and_save(&cpp_in_file, &obj_out_file, &dep_files) {
                    Ok(dep_file_name) => {
                        let _ = std::os::unix::fs::chown(&dep_file_name, Some(uid), Some(gid));
                        tracing::debug!("saved depfile to {dep_file_name}");
                    }
                    Err(e) => tracing::error!("error generating depfile: {e}"),
                }
            });
        }

        // upload candidates: headers, the input source, then the pch sidecar;
        // the reply indexes into this combined list
        let mut upload_candidates: Vec<FileMetadata> =
            Vec::with_capacity(deps.dep_files.len() + 2);
        for dep in &deps.dep_files {
            upload_candidates.push(dep.to_metadata());
        }
        upload_candidates.push(deps.cpp_file.to_metadata());
        let required_pch_file = deps.pch_file.as_ref().map(|pch| pch.to_metadata());
        let required_files = upload_candidates.clone();
        if let Some(ref pch) = required_pch_file {
            upload_candidates.push(pch.clone());
        }

        let file_indexes_to_upload =
            remote.start_compilation_session(invocation, &required_files, required_pch_file)?;
        tracing::debug!(
            "remote {} sessionID {} waiting {} uploads for {}",
            remote.remote_host,
            invocation.session_id,
            file_indexes_to_upload.len(),
            invocation.cpp_in_file
        );
        let session_at = started.elapsed();

        remote.upload_files(invocation, &upload_candidates, &file_indexes_to_upload)?;
        let uploaded_at = started.elapsed();

        remote.wait_for_compiled_obj(invocation)?;
        let received_at = started.elapsed();

        let result = invocation.result.lock().unwrap_or_else(|p| p.into_inner());
        tracing::info!(
            "sessionID {} {}: {} deps, {} uploads, remote {}; includes {}ms, session {}ms, uploads {}ms, obj {}ms",
            invocation.session_id,
            invocation.cpp_in_file,
            deps.dep_files.len(),
            file_indexes_to_upload.len(),
            remote.remote_host,
            collected_at.as_millis(),
            (session_at - collected_at).as_millis(),
            (uploaded_at - session_at).as_millis(),
            (received_at - uploaded_at).as_millis()
        );

        if result.exit_code != 0 {
            tracing::info!(
                "remote compiler exited with code {} for sessionID {} {}",
                result.exit_code,
                invocation.session_id,
                invocation.cpp_in_file
            );
        }

        Ok(SockResponse {
            exit_code: result.exit_code,
            stdout: result.stdout.clone().into_bytes(),
            stderr: result.stderr.clone().into_bytes(),
        })
    }

    /// Deterministic shard selection: the same basename always lands on the
    /// same worker, across rebuilds, branches and clients, maximizing cache
    /// locality. No load balancing.
    fn choose_remote_for(&self, cpp_in_file: &str) -> &Arc<RemoteConnection> {
        let base = Path::new(cpp_in_file)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let index = fnv1a32(base.as_bytes()) as usize % self.remotes.len();
        &self.remotes[index]
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_known_values() {
        // reference values for the standard FNV-1a 32-bit algorithm
        assert_eq!(fnv1a32(b""), 2166136261);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_shard_selection_is_deterministic() {
        let hash1 = fnv1a32(b"foo.cpp");
        let hash2 = fnv1a32(b"foo.cpp");
        assert_eq!(hash1 % 3, hash2 % 3);
        // different basenames generally spread
        assert_ne!(fnv1a32(b"foo.cpp"), fnv1a32(b"bar.cpp"));
    }

    #[test]
    fn test_active_invocations_registry() {
        let active = ActiveInvocations::new();
        let inv = Arc::new(Invocation::parse(
            5,
            0,
            0,
            "/w",
            "g++",
            &["-c".to_string(), "a.cpp".to_string()],
        ));
        active.register(&inv);
        assert_eq!(active.count(), 1);
        assert!(active.find(5).is_some());
        assert!(active.find(6).is_none());
        active.unregister(5);
        assert_eq!(active.count(), 0);
    }

    #[test]
    fn test_interrupt_older_than_releases_old_invocations() {
        let active = ActiveInvocations::new();
        let inv = Arc::new(Invocation::parse(
            1,
            0,
            0,
            "/w",
            "g++",
            &["-c".to_string(), "a.cpp".to_string()],
        ));
        inv.wg_recv.add(1);
        active.register(&inv);

        active.interrupt_older_than(Duration::from_secs(3600));
        assert!(inv.take_error().is_none());

        active.interrupt_older_than(Duration::ZERO);
        inv.wg_recv.wait();
        assert!(inv.take_error().unwrap().contains("timeout"));
    }
}
