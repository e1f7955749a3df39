//! Recv stream thread: accepts compiled objects pushed by one worker.
//!
//! The worker initiates every transfer: a header frame carries exit code,
//! stdout/stderr and object size for a session, then body chunks follow (for
//! zero exit codes only). The object is written to a temp file next to the
//! invocation's target and renamed over it; delivery is signalled through the
//! invocation's recv wait group.

use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nocc_protocol::{fileio, read_frame, write_frame, RecvFrame, StreamHello, StreamKind};

use crate::daemon::remote::{RemoteConnection, STREAM_RECREATE_DELAY};
use crate::invocation::Invocation;

const POLL_TIMEOUT: Duration = Duration::from_millis(300);

pub fn run_receive_stream(remote: Arc<RemoteConnection>) {
    let mut stream: Option<TcpStream> = None;

    while !remote.quit.is_quit() {
        if remote.is_unavailable() {
            stream = None;
            remote.quit.wait_timeout(POLL_TIMEOUT);
            continue;
        }

        if stream.is_none() {
            match open_receive_stream(&remote) {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    remote.on_became_unavailable(&e);
                    continue;
                }
            }
        }

        let run_result = stream
            .as_mut()
            .map(|s| receive_loop(s, &remote))
            .unwrap_or_else(|| Err("no recv stream".to_string()));

        if let Err(e) = run_result {
            if remote.quit.is_quit() {
                return;
            }
            tracing::error!("recreate recv stream: {e}");
            stream = None;
            remote.quit.wait_timeout(STREAM_RECREATE_DELAY);
        }
    }
}

fn open_receive_stream(remote: &Arc<RemoteConnection>) -> Result<TcpStream, String> {
    let mut stream = remote.connect_stream().map_err(|e| e.to_string())?;
    let hello = StreamHello {
        stream: StreamKind::Recv,
        client_id: remote.client_id.clone(),
    };
    write_frame(&mut stream, &hello, &[]).map_err(|e| e.to_string())?;
    Ok(stream)
}

/// Read pushed frames until the stream breaks. Returns Err to trigger
/// stream recreation.
fn receive_loop(stream: &mut TcpStream, remote: &Arc<RemoteConnection>) -> Result<(), String> {
    loop {
        let (frame, _body): (RecvFrame, Vec<u8>) =
            read_frame(stream).map_err(|e| e.to_string())?;

        match frame {
            RecvFrame::ObjHeader {
                session_id,
                compiler_exit_code,
                compiler_stdout,
                compiler_stderr,
                compiler_duration_ms,
                file_size,
            } => {
                let invocation = remote.active_invocations.find(session_id);

                if let Some(ref inv) = invocation {
                    let mut result = inv.result.lock().unwrap_or_else(|p| p.into_inner());
                    result.exit_code = compiler_exit_code;
                    result.stdout = compiler_stdout;
                    result.stderr = compiler_stderr;
                    result.duration_ms = compiler_duration_ms;
                } else {
                    tracing::error!("can't find invocation for obj, sessionID {session_id}");
                }

                // non-zero exit carries no object; it's a C++ error, not ours
                if compiler_exit_code != 0 {
                    if let Some(inv) = invocation {
                        inv.done_recv_obj(None);
                    }
                    continue;
                }

                let outcome =
                    receive_obj_by_chunks(stream, session_id, file_size, invocation.as_deref());
                if let Some(inv) = invocation {
                    inv.done_recv_obj(outcome.error.clone());
                }
                if outcome.stream_broken {
                    return Err(outcome
                        .error
                        .unwrap_or_else(|| "obj stream broken".to_string()));
                }
            }

            RecvFrame::ObjChunk { session_id } => {
                // chunks are consumed inside receive_obj_by_chunks; one here
                // means the stream lost framing
                return Err(format!("stray obj chunk for sessionID {session_id}"));
            }

            RecvFrame::StreamError {
                session_id,
                message,
            } => {
                // worker-side failure; only the named session is affected
                if let Some(session_id) = session_id {
                    if let Some(inv) = remote.active_invocations.find(session_id) {
                        inv.done_recv_obj(Some(message.clone()));
                    }
                }
                return Err(message);
            }
        }
    }
}

struct RecvOutcome {
    error: Option<String>,
    /// True when the transport itself failed (vs a local file-save problem).
    stream_broken: bool,
}

/// Consume body chunks summing to `file_size`, saving into the invocation's
/// object path via temp file + rename. Chunks are consumed even when the
/// invocation is gone so the stream stays consistent.
fn receive_obj_by_chunks(
    stream: &mut TcpStream,
    session_id: u32,
    file_size: i64,
    invocation: Option<&Invocation>,
) -> RecvOutcome {
    let mut temp = invocation.map(|inv| {
        let target = Path::new(&inv.obj_out_file);
        fileio::open_temp_file(target)
    });
    let mut write_error: Option<String> = match temp {
        Some(Err(ref e)) => Some(format!("can't create temp obj file: {e}")),
        _ => None,
    };

    let mut received: i64 = 0;
    while received < file_size {
        let (frame, body): (RecvFrame, Vec<u8>) = match read_frame(stream) {
            Ok(fb) => fb,
            Err(e) => {
                cleanup_temp(temp);
                return RecvOutcome {
                    error: Some(e.to_string()),
                    stream_broken: true,
                };
            }
        };
        match frame {
            RecvFrame::ObjChunk {
                session_id: chunk_session,
            } if chunk_session == session_id => {
                received += body.len() as i64;
                if write_error.is_none() {
                    if let Some(Ok((ref mut file, _))) = temp {
                        if let Err(e) = file.write_all(&body) {
                            write_error = Some(format!("can't write obj file: {e}"));
                        }
                    }
                }
            }
            _ => {
                cleanup_temp(temp);
                return RecvOutcome {
                    error: Some("inconsistent stream, chunks mismatch".to_string()),
                    stream_broken: true,
                };
            }
        }
    }

    match (temp, invocation) {
        (Some(Ok((file, temp_path))), Some(inv)) => {
            drop(file);
            let error = if write_error.is_none() {
                match std::fs::rename(&temp_path, &inv.obj_out_file) {
                    Ok(()) => {
                        let _ = std::os::unix::fs::chown(
                            &inv.obj_out_file,
                            Some(inv.uid),
                            Some(inv.gid),
                        );
                        None
                    }
                    Err(e) => Some(format!("can't save obj file: {e}")),
                }
            } else {
                write_error
            };
            if error.is_some() {
                let _ = std::fs::remove_file(&temp_path);
            }
            RecvOutcome {
                error,
                stream_broken: false,
            }
        }
        (other, _) => {
            cleanup_temp(other);
            RecvOutcome {
                error: write_error,
                stream_broken: false,
            }
        }
    }
}

fn cleanup_temp(temp: Option<std::io::Result<(std::fs::File, std::path::PathBuf)>>) {
    if let Some(Ok((file, path))) = temp {
        drop(file);
        let _ = std::fs::remove_file(path);
    }
}
