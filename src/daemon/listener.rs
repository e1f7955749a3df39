//! Unix-socket front end between the wrapper and the daemon.
//!
//! Wire format, both directions NUL-terminated and `\x08`-delimited:
//!
//! ```text
//! request:  cwd \x08 compiler \x08 arg1 \x08 arg2 ... \0
//! response: exitCode \x08 stdout \x08 stderr \0
//! ```
//!
//! The peer's uid/gid come from the socket credentials so local fallback
//! runs as the caller. The daemon exits by itself after 15 seconds with no
//! connections at all ("build finished").

use std::io::{BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::daemon::Daemon;

/// Bounded request reader size.
const REQUEST_READER_CAPACITY: usize = 128 * 1024;

/// The daemon assumes the build finished after this long with zero activity.
const IDLE_QUIT_AFTER: Duration = Duration::from_secs(15);

const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// Field delimiter of the socket protocol.
const DELIM: u8 = 0x08;

/// One parsed wrapper request.
#[derive(Debug, Clone)]
pub struct SockRequest {
    pub cwd: String,
    pub compiler: String,
    pub cmd_line: Vec<String>,
    pub uid: u32,
    pub gid: u32,
}

/// The reply sent back to the wrapper.
#[derive(Debug, Clone, Default)]
pub struct SockResponse {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct DaemonUnixSockListener {
    socket_path: PathBuf,
    listener: UnixListener,
    active_connections: AtomicI32,
    last_time_alive: Mutex<Instant>,
}

impl DaemonUnixSockListener {
    /// Bind the socket, replacing a stale file from a dead daemon.
    pub fn bind(socket_path: &str) -> std::io::Result<Arc<Self>> {
        let path = PathBuf::from(socket_path);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Arc::new(Self {
            socket_path: path,
            listener,
            active_connections: AtomicI32::new(0),
            last_time_alive: Mutex::new(Instant::now()),
        }))
    }

    /// Accept wrapper connections until the daemon quits. Runs on the main
    /// thread; the idle monitor runs beside it.
    pub fn serve(self: &Arc<Self>, daemon: &Arc<Daemon>) {
        self.spawn_idle_monitor(daemon);

        for stream in self.listener.incoming() {
            if daemon.quit.is_quit() {
                break;
            }
            match stream {
                Ok(stream) => {
                    self.touch();
                    let listener = Arc::clone(self);
                    let daemon = Arc::clone(daemon);
                    std::thread::spawn(move || listener.on_request(stream, &daemon));
                }
                Err(e) => {
                    if daemon.quit.is_quit() {
                        break;
                    }
                    tracing::error!("daemon accept error: {e}");
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
    }

    /// Wake the accept loop so `serve` observes a quit promptly.
    pub fn interrupt_accept(&self) {
        let _ = UnixStream::connect(&self.socket_path);
    }

    fn spawn_idle_monitor(self: &Arc<Self>, daemon: &Arc<Daemon>) {
        let listener = Arc::clone(self);
        let daemon = Arc::clone(daemon);
        std::thread::spawn(move || {
            while !daemon.quit.wait_timeout(IDLE_CHECK_PERIOD) {
                let n_active = listener.active_connections.load(Ordering::SeqCst);
                let idle_for = listener
                    .last_time_alive
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .elapsed();
                if n_active == 0 && idle_for > IDLE_QUIT_AFTER {
                    daemon.quit_gracefully("no connections receiving anymore");
                    listener.interrupt_accept();
                    return;
                }
            }
            listener.interrupt_accept();
        });
    }

    fn touch(&self) {
        *self
            .last_time_alive
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn on_request(&self, mut stream: UnixStream, daemon: &Arc<Daemon>) {
        let (uid, gid) = peer_credentials(&stream);

        let request = match read_request(&mut stream, uid, gid) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("couldn't read from socket: {e}");
                let _ = stream.write_all(b"\0");
                return;
            }
        };

        self.active_connections.fetch_add(1, Ordering::SeqCst);
        let response = daemon.handle_invocation(request);
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        self.touch();

        let mut reply = Vec::with_capacity(response.stdout.len() + response.stderr.len() + 16);
        reply.extend_from_slice(response.exit_code.to_string().as_bytes());
        reply.push(DELIM);
        reply.extend_from_slice(&response.stdout);
        reply.push(DELIM);
        reply.extend_from_slice(&response.stderr);
        reply.push(0);
        let _ = stream.write_all(&reply);
    }
}

fn read_request(stream: &mut UnixStream, uid: u32, gid: u32) -> Result<SockRequest, String> {
    let mut reader = BufReader::with_capacity(REQUEST_READER_CAPACITY, stream);
    let mut raw = Vec::with_capacity(4096);

    // read up to the NUL terminator
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err("connection closed before request end".to_string()),
            Ok(_) => {
                if byte[0] == 0 {
                    break;
                }
                raw.push(byte[0]);
                if raw.len() > REQUEST_READER_CAPACITY {
                    return Err("request too large".to_string());
                }
            }
            Err(e) => return Err(e.to_string()),
        }
    }

    let text = String::from_utf8_lossy(&raw);
    let mut parts = text.split(DELIM as char);
    let cwd = parts.next().unwrap_or_default().to_string();
    let compiler = parts.next().unwrap_or_default().to_string();
    let cmd_line: Vec<String> = parts.map(|s| s.to_string()).collect();

    if cwd.is_empty() || compiler.is_empty() {
        return Err(format!("malformed request: {text}"));
    }

    Ok(SockRequest {
        cwd,
        compiler,
        cmd_line,
        uid,
        gid,
    })
}

/// uid/gid of the connecting wrapper via SO_PEERCRED.
fn peer_credentials(stream: &UnixStream) -> (u32, u32) {
    use std::os::unix::io::AsRawFd;

    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        (ucred.uid, ucred.gid)
    } else {
        (0, 0)
    }
}
