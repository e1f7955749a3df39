//! The `nocc` wrapper: a thin client of the daemon's unix socket.
//!
//! Build systems substitute `nocc` for the compiler (`nocc g++ -c foo.cpp`
//! or a `g++` symlink pointing at nocc). The wrapper forwards the command
//! line to the daemon, spawning the daemon first if none is running, prints
//! the compiler's real stdout/stderr and exits with its real exit code. A
//! few invocation shapes never reach the daemon and run directly.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::{DEFAULT_SOCKET_PATH, SOCKET_PATH_ENV};

/// Delimiter of the socket protocol.
const DELIM: u8 = 0x08;

/// Split argv into the real compiler name and its arguments. Supports both
/// `nocc g++ args...` and a compiler-named symlink to nocc.
pub fn split_compiler_and_args(argv: &[String]) -> (String, Vec<String>) {
    let program = base_name(argv.first().map(String::as_str).unwrap_or_default());
    if program == "nocc" {
        let compiler = argv.get(1).cloned().unwrap_or_default();
        (base_name(&compiler).to_string(), argv[2.min(argv.len())..].to_vec())
    } else {
        (program.to_string(), argv[1.min(argv.len())..].to_vec())
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Stdin-reading, preprocessor-only and non-`-c` invocations are cheaper to
/// run directly than to round-trip through the daemon.
pub fn should_compile_locally(args: &[String]) -> bool {
    args.iter().any(|a| a == "-" || a == "-E") || !args.iter().any(|a| a == "-c")
}

pub fn socket_path() -> String {
    std::env::var(SOCKET_PATH_ENV).unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string())
}

/// Send one request to the daemon and wait for the reply.
pub fn run_via_daemon(
    socket_path: &str,
    cwd: &str,
    compiler: &str,
    args: &[String],
) -> std::io::Result<(i32, Vec<u8>, Vec<u8>)> {
    let mut stream = UnixStream::connect(socket_path)?;

    let mut request = Vec::with_capacity(256);
    request.extend_from_slice(cwd.as_bytes());
    request.push(DELIM);
    request.extend_from_slice(compiler.as_bytes());
    for arg in args {
        request.push(DELIM);
        request.extend_from_slice(arg.as_bytes());
    }
    request.push(0);
    stream.write_all(&request)?;

    let mut reply = Vec::with_capacity(4096);
    let mut reader = BufReader::with_capacity(128 * 1024, &mut stream);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte)? {
            0 => break,
            _ if byte[0] == 0 => break,
            _ => reply.push(byte[0]),
        }
    }

    parse_daemon_reply(&reply)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed reply"))
}

/// `exitCode \x08 stdout \x08 stderr`.
pub fn parse_daemon_reply(reply: &[u8]) -> Option<(i32, Vec<u8>, Vec<u8>)> {
    let first = reply.iter().position(|&b| b == DELIM)?;
    let second = first + 1 + reply[first + 1..].iter().position(|&b| b == DELIM)?;
    let exit_code: i32 = std::str::from_utf8(&reply[..first]).ok()?.parse().ok()?;
    Some((
        exit_code,
        reply[first + 1..second].to_vec(),
        reply[second + 1..].to_vec(),
    ))
}

/// Locate `compiler` in PATH, skipping nocc itself (it may be installed as a
/// compiler-named symlink earlier in PATH).
pub fn find_compiler_in_path(compiler: &str) -> Option<PathBuf> {
    let own_path = std::env::current_exe()
        .ok()
        .and_then(|p| p.canonicalize().ok());
    let path_var = std::env::var("PATH").unwrap_or_default();

    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(compiler);
        let Ok(real) = candidate.canonicalize() else {
            continue;
        };
        if own_path.as_deref() == Some(real.as_path()) {
            continue;
        }
        return Some(candidate);
    }
    None
}

/// Run the compiler directly, inheriting stdio; never returns.
pub fn execute_locally(compiler: &str, args: &[String], note: &str) -> ! {
    if !note.is_empty() {
        eprintln!("[nocc] {note}");
    }

    let Some(compiler_path) = find_compiler_in_path(compiler) else {
        eprintln!("[nocc] compiler {compiler} not found in PATH");
        std::process::exit(1);
    };

    let status = Command::new(&compiler_path)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    match status {
        Ok(status) => std::process::exit(status.code().unwrap_or(1)),
        Err(e) => {
            eprintln!("[nocc] can't launch {}: {e}", compiler_path.display());
            std::process::exit(1);
        }
    }
}

/// Start `nocc-daemon start` and wait for its readiness line ("1") on
/// stdout. The daemon binary is looked up next to the wrapper first, then
/// in PATH.
pub fn spawn_daemon() -> Result<(), String> {
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("nocc-daemon")));
    let program = match sibling {
        Some(p) if p.exists() => p,
        _ => PathBuf::from("nocc-daemon"),
    };

    let mut child = Command::new(&program)
        .arg("start")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("can't spawn {}: {e}", program.display()))?;

    let Some(stdout) = child.stdout.take() else {
        return Err("daemon stdout was not piped".to_string());
    };
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .map_err(|e| format!("daemon didn't report readiness: {e}"))?;

    if line.trim() == "1" {
        Ok(())
    } else {
        Err(format!("daemon not started: {}", line.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_compiler_and_args() {
        let (compiler, args) = split_compiler_and_args(&strs(&["nocc", "g++", "-c", "a.cpp"]));
        assert_eq!(compiler, "g++");
        assert_eq!(args, strs(&["-c", "a.cpp"]));

        let (compiler, args) = split_compiler_and_args(&strs(&["/usr/bin/clang++", "-c", "a.cpp"]));
        assert_eq!(compiler, "clang++");
        assert_eq!(args, strs(&["-c", "a.cpp"]));
    }

    #[test]
    fn test_should_compile_locally() {
        assert!(should_compile_locally(&strs(&["-E", "a.cpp"])));
        assert!(should_compile_locally(&strs(&["-c", "-", "-o", "a.o"])));
        assert!(should_compile_locally(&strs(&["a.o", "-o", "app"]))); // no -c
        assert!(!should_compile_locally(&strs(&["-c", "a.cpp", "-o", "a.o"])));
    }

    #[test]
    fn test_parse_daemon_reply() {
        let (exit_code, stdout, stderr) = parse_daemon_reply(b"0\x08out\x08err").unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(stdout, b"out");
        assert_eq!(stderr, b"err");

        let (exit_code, stdout, stderr) = parse_daemon_reply(b"1\x08\x08").unwrap();
        assert_eq!(exit_code, 1);
        assert!(stdout.is_empty());
        assert!(stderr.is_empty());

        assert!(parse_daemon_reply(b"").is_none());
        assert!(parse_daemon_reply(b"nonsense").is_none());
    }

    #[test]
    fn test_request_reply_against_fake_daemon() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("d.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                conn.read_exact(&mut byte).unwrap();
                if byte[0] == 0 {
                    break;
                }
                buf.push(byte[0]);
            }
            let text = String::from_utf8(buf).unwrap();
            assert!(text.starts_with("/cwd\x08g++\x08-c"));
            conn.write_all(b"0\x08ok\x08\0").unwrap();
        });

        let (exit_code, stdout, _stderr) = run_via_daemon(
            sock.to_str().unwrap(),
            "/cwd",
            "g++",
            &strs(&["-c", "a.cpp"]),
        )
        .unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(stdout, b"ok");
        handle.join().unwrap();
    }
}
