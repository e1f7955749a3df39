//! Per-worker connection state on the daemon side.
//!
//! One [`RemoteConnection`] per configured worker address. It owns a control
//! connection for unary calls plus two long-lived stream connections (upload
//! and recv), each driven by a dedicated thread that recreates its stream on
//! failure. When recreation fails the worker is marked unavailable, new
//! sessions short-circuit to local compilation, and a bounded reconnect loop
//! tries to bring the worker back.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use nocc_protocol::{
    read_frame, write_frame, ControlReply, ControlRequest, FileMetadata,
    StartCompilationSessionRequest, WireError,
};

use crate::daemon::ActiveInvocations;
use crate::invocation::Invocation;
use crate::sync::QuitSignal;

/// Depth of the per-worker upload queue.
const UPLOAD_QUEUE_DEPTH: usize = 50;

/// Back-off after a failed stream operation before recreating the stream.
pub(crate) const STREAM_RECREATE_DELAY: Duration = Duration::from_millis(100);

/// Reconnect schedule: one quick retry, then a slow period, bounded overall.
const RECONNECT_FIRST_DELAY: Duration = Duration::from_millis(10);
const RECONNECT_PERIOD: Duration = Duration::from_secs(10);
const RECONNECT_GIVE_UP_AFTER: Duration = Duration::from_secs(5 * 60);

/// Deadlines for unary calls.
const START_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
const SHORT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// One queued file upload.
pub(crate) struct FileUploadReq {
    pub invocation: Arc<Invocation>,
    pub file: FileMetadata,
    pub file_index: u32,
}

pub struct RemoteConnection {
    pub remote_host_port: String,
    /// Host without the port, for logs.
    pub remote_host: String,

    pub(crate) client_id: String,
    socks_proxy_addr: String,
    pub(crate) connection_timeout: Duration,

    is_unavailable: AtomicBool,
    control: Mutex<Option<TcpStream>>,

    upload_tx: SyncSender<FileUploadReq>,
    pub(crate) upload_rx: Mutex<Option<Receiver<FileUploadReq>>>,

    pub(crate) active_invocations: Arc<ActiveInvocations>,
    pub(crate) quit: Arc<QuitSignal>,
}

pub fn extract_remote_host(remote_host_port: &str) -> String {
    match remote_host_port.find(':') {
        Some(idx) => remote_host_port[..idx].to_string(),
        None => remote_host_port.to_string(),
    }
}

impl RemoteConnection {
    pub fn new(
        remote_host_port: &str,
        client_id: &str,
        socks_proxy_addr: &str,
        connection_timeout: Duration,
        active_invocations: Arc<ActiveInvocations>,
        quit: Arc<QuitSignal>,
    ) -> Arc<Self> {
        let (upload_tx, upload_rx) = mpsc::sync_channel(UPLOAD_QUEUE_DEPTH);
        Arc::new(Self {
            remote_host_port: remote_host_port.to_string(),
            remote_host: extract_remote_host(remote_host_port),
            client_id: client_id.to_string(),
            socks_proxy_addr: socks_proxy_addr.to_string(),
            connection_timeout,
            is_unavailable: AtomicBool::new(true),
            control: Mutex::new(None),
            upload_tx,
            upload_rx: Mutex::new(Some(upload_rx)),
            active_invocations,
            quit,
        })
    }

    /// Initial connect: set up the control connection and spawn the two
    /// stream threads. On failure the worker starts out unavailable and the
    /// reconnect loop takes over.
    pub fn start(self: &Arc<Self>) {
        match self.setup_connection() {
            Ok(()) => self.is_unavailable.store(false, Ordering::SeqCst),
            Err(e) => {
                tracing::error!("error connecting to {}: {e}", self.remote_host_port);
                self.spawn_reconnect_loop();
            }
        }

        let uploader = Arc::clone(self);
        std::thread::spawn(move || crate::daemon::upload::run_upload_stream(uploader));
        let receiver = Arc::clone(self);
        std::thread::spawn(move || crate::daemon::receive::run_receive_stream(receiver));
    }

    pub fn is_unavailable(&self) -> bool {
        self.is_unavailable.load(Ordering::SeqCst)
    }

    /// Open a TCP connection to the worker, directly or through SOCKS5.
    pub(crate) fn connect_stream(&self) -> std::io::Result<TcpStream> {
        let stream = if self.socks_proxy_addr.is_empty() {
            tcp_connect(&self.remote_host_port, self.connection_timeout)?
        } else {
            socks5_connect(
                &self.socks_proxy_addr,
                &self.remote_host_port,
                self.connection_timeout,
            )?
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// (Re-)establish the control connection and register this client.
    fn setup_connection(&self) -> Result<(), WireError> {
        let stream = self.connect_stream()?;
        {
            let mut control = lock(&self.control);
            *control = Some(stream);
        }
        self.control_call(
            &ControlRequest::StartClient {
                client_id: self.client_id.clone(),
                client_version: crate::VERSION.to_string(),
            },
            START_CLIENT_TIMEOUT,
        )?;
        Ok(())
    }

    /// One unary request/reply on the control connection.
    fn control_call(
        &self,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<ControlReply, WireError> {
        let mut control = lock(&self.control);
        let stream = match control.as_mut() {
            Some(s) => s,
            None => {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no control connection",
                )))
            }
        };

        let result = (|| {
            stream.set_write_timeout(Some(timeout))?;
            stream.set_read_timeout(Some(timeout))?;
            write_frame(stream, request, &[])?;
            let (reply, _body): (ControlReply, Vec<u8>) = read_frame(stream)?;
            Ok(reply)
        })();

        if result.is_err() {
            // a broken control connection is useless; reconnect rebuilds it
            *control = None;
        }
        result
    }

    /// Start a session on the worker: send digests of every dependency, get
    /// back the indexes the worker is missing.
    pub fn start_compilation_session(
        self: &Arc<Self>,
        invocation: &Invocation,
        required_files: &[FileMetadata],
        required_pch_file: Option<FileMetadata>,
    ) -> Result<Vec<u32>, String> {
        if self.is_unavailable() {
            return Err(format!("remote {} is unavailable", self.remote_host));
        }

        let request = ControlRequest::StartCompilationSession {
            session: StartCompilationSessionRequest {
                client_id: self.client_id.clone(),
                session_id: invocation.session_id,
                input_file: invocation.cpp_in_file.clone(),
                compiler: invocation.compiler_name.clone(),
                compiler_args: invocation.compiler_args.clone(),
                required_files: required_files.to_vec(),
                required_pch_file,
            },
        };

        match self.control_call(&request, self.connection_timeout) {
            Ok(reply) if reply.ok => Ok(reply.file_indexes_to_upload),
            Ok(reply) => {
                let error = reply
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "session rejected".to_string());
                Err(error)
            }
            Err(e) => {
                self.on_became_unavailable(&e.to_string());
                Err(e.to_string())
            }
        }
    }

    /// Queue every missing file and block until all uploads finished.
    pub fn upload_files(
        &self,
        invocation: &Arc<Invocation>,
        required_files: &[FileMetadata],
        file_indexes_to_upload: &[u32],
    ) -> Result<(), String> {
        invocation.wg_upload.add(file_indexes_to_upload.len() as i32);

        for &file_index in file_indexes_to_upload {
            let file = match required_files.get(file_index as usize) {
                Some(f) => f.clone(),
                None => {
                    invocation.force_interrupt(format!("bad upload index {file_index}"));
                    break;
                }
            };
            let req = FileUploadReq {
                invocation: Arc::clone(invocation),
                file,
                file_index,
            };
            if self.upload_tx.send(req).is_err() {
                invocation.force_interrupt("upload queue closed");
                break;
            }
        }

        invocation.wg_upload.wait();
        match invocation.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Block until the worker pushed the result for this invocation.
    pub fn wait_for_compiled_obj(&self, invocation: &Invocation) -> Result<(), String> {
        invocation.wg_recv.wait();
        match invocation.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn keep_alive(self: &Arc<Self>) {
        if self.is_unavailable() {
            return;
        }
        let request = ControlRequest::KeepAlive {
            client_id: self.client_id.clone(),
        };
        if let Err(e) = self.control_call(&request, SHORT_CALL_TIMEOUT) {
            tracing::error!("keep alive failed: {e}");
            self.on_became_unavailable(&e.to_string());
        }
    }

    pub fn send_stop_client(&self) {
        if self.is_unavailable() {
            return;
        }
        let request = ControlRequest::StopClient {
            client_id: self.client_id.clone(),
        };
        let _ = self.control_call(&request, SHORT_CALL_TIMEOUT);
    }

    /// Flip to unavailable exactly once and start the reconnect loop.
    pub(crate) fn on_became_unavailable(self: &Arc<Self>, reason: &str) {
        if !self.is_unavailable.swap(true, Ordering::SeqCst) {
            tracing::error!(
                "remote {} became unavailable: {reason}",
                self.remote_host_port
            );
            self.spawn_reconnect_loop();
        }
    }

    fn spawn_reconnect_loop(self: &Arc<Self>) {
        let remote = Arc::clone(self);
        std::thread::spawn(move || {
            let started = Instant::now();
            let mut delay = RECONNECT_FIRST_DELAY;
            loop {
                if remote.quit.wait_timeout(delay) {
                    return;
                }
                match remote.setup_connection() {
                    Ok(()) => {
                        remote.is_unavailable.store(false, Ordering::SeqCst);
                        tracing::info!("remote {} reconnected", remote.remote_host_port);
                        return;
                    }
                    Err(e) => {
                        tracing::error!(
                            "remote {} unable to reconnect: {e}",
                            remote.remote_host_port
                        );
                    }
                }
                if started.elapsed() > RECONNECT_GIVE_UP_AFTER {
                    tracing::error!(
                        "remote {} stayed unreachable, giving up until restart",
                        remote.remote_host_port
                    );
                    return;
                }
                delay = RECONNECT_PERIOD;
            }
        });
    }

    /// Drop the control connection (on daemon shutdown).
    pub fn clear(&self) {
        *lock(&self.control) = None;
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn tcp_connect(host_port: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let addr = host_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "can't resolve address"))?;
    TcpStream::connect_timeout(&addr, timeout)
}

/// Minimal SOCKS5 CONNECT (no auth, domain address type).
fn socks5_connect(
    proxy_addr: &str,
    target_host_port: &str,
    timeout: Duration,
) -> std::io::Result<TcpStream> {
    use std::io::{Error, ErrorKind};

    let (host, port) = match target_host_port.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidInput, "bad port"))?;
            (h, port)
        }
        None => (target_host_port, 43210),
    };
    if host.len() > 255 {
        return Err(Error::new(ErrorKind::InvalidInput, "host name too long"));
    }

    let mut stream = tcp_connect(proxy_addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    // greeting: version 5, one method, no auth
    stream.write_all(&[0x05, 0x01, 0x00])?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply)?;
    if reply != [0x05, 0x00] {
        return Err(Error::new(ErrorKind::Other, "socks5 auth method rejected"));
    }

    // CONNECT with a domain-name address
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if head[1] != 0x00 {
        return Err(Error::new(
            ErrorKind::Other,
            format!("socks5 connect failed with code {}", head[1]),
        ));
    }
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        _ => return Err(Error::new(ErrorKind::Other, "socks5 bad address type")),
    };
    let mut skip = vec![0u8; addr_len + 2];
    stream.read_exact(&mut skip)?;

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    Ok(stream)
}
