//! Upload stream thread: pipes queued dependency files to one worker.
//!
//! A single stream carries files of many invocations, one after another; each
//! chunk is tagged with (sessionID, fileIndex) and the worker acks every
//! completed file. On any error the stream is dropped and recreated after a
//! short back-off; the affected invocation is failed (which the daemon turns
//! into local fallback), never retried remotely.

use std::fs::File;
use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use nocc_protocol::{
    read_frame, write_frame, RpcErrorCode, StreamHello, StreamKind, UploadChunk, UploadReply,
    CHUNK_SIZE,
};

use crate::daemon::remote::{lock, FileUploadReq, RemoteConnection, STREAM_RECREATE_DELAY};

/// How long the queue poll sleeps before re-checking quit/availability.
const POLL_TIMEOUT: Duration = Duration::from_millis(300);

pub fn run_upload_stream(remote: Arc<RemoteConnection>) {
    let rx = match lock(&remote.upload_rx).take() {
        Some(rx) => rx,
        None => return, // already claimed; never happens in practice
    };

    let mut stream: Option<TcpStream> = None;

    while !remote.quit.is_quit() {
        if remote.is_unavailable() {
            stream = None;
            drain_queue_with_error(&remote, &rx);
            remote.quit.wait_timeout(POLL_TIMEOUT);
            continue;
        }

        let req = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(req) => req,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        if stream.is_none() {
            match open_upload_stream(&remote) {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    req.invocation
                        .done_upload_file(Some(format!("can't open upload stream: {e}")));
                    remote.on_became_unavailable(&e);
                    continue;
                }
            }
        }

        let upload_result = stream
            .as_mut()
            .map(|s| upload_file_by_chunks(s, &remote, &req))
            .unwrap_or_else(|| Err("no upload stream".to_string()));

        match upload_result {
            Ok(()) => {
                tracing::debug!(
                    "uploaded {} ({} bytes), sessionID {}",
                    req.file.file_name,
                    req.file.file_size,
                    req.invocation.session_id
                );
                req.invocation.done_upload_file(None);
            }
            Err(e) => {
                // fail only this invocation, then recreate the stream
                req.invocation
                    .done_upload_file(Some(format!("upload of {} failed: {e}", req.file.file_name)));
                tracing::error!("recreate upload stream: {e}");
                stream = None;
                remote.quit.wait_timeout(STREAM_RECREATE_DELAY);
            }
        }
    }
}

/// While the worker is unavailable there is no point keeping invocations
/// blocked on the queue; fail them so they fall back locally.
fn drain_queue_with_error(remote: &Arc<RemoteConnection>, rx: &Receiver<FileUploadReq>) {
    while let Ok(req) = rx.try_recv() {
        req.invocation.done_upload_file(Some(format!(
            "remote {} is unavailable",
            remote.remote_host
        )));
    }
}

fn open_upload_stream(remote: &Arc<RemoteConnection>) -> Result<TcpStream, String> {
    let mut stream = remote.connect_stream().map_err(|e| e.to_string())?;
    let hello = StreamHello {
        stream: StreamKind::Upload,
        client_id: remote.client_id.clone(),
    };
    write_frame(&mut stream, &hello, &[]).map_err(|e| e.to_string())?;
    Ok(stream)
}

/// Send one file as ≤64 KiB chunks and wait for the worker's ack.
/// An empty file is exactly one zero-length chunk.
fn upload_file_by_chunks(
    stream: &mut TcpStream,
    remote: &Arc<RemoteConnection>,
    req: &FileUploadReq,
) -> Result<(), String> {
    let header = UploadChunk {
        client_id: remote.client_id.clone(),
        session_id: req.invocation.session_id,
        file_index: req.file_index,
    };

    let mut file = File::open(&req.file.file_name).map_err(|e| e.to_string())?;
    let mut chunk_buf = vec![0u8; CHUNK_SIZE];
    let mut sent_chunks = 0;

    loop {
        let n = file.read(&mut chunk_buf).map_err(|e| e.to_string())?;
        if n == 0 && sent_chunks != 0 {
            break;
        }
        write_frame(stream, &header, &chunk_buf[..n]).map_err(|e| e.to_string())?;
        sent_chunks += 1;
        if n == 0 {
            break;
        }
    }

    let (reply, _body): (UploadReply, Vec<u8>) =
        read_frame(stream).map_err(|e| e.to_string())?;
    if reply.ok {
        return Ok(());
    }

    let error = reply.error.unwrap_or_else(|| {
        nocc_protocol::RpcError::new(RpcErrorCode::Internal, "upload rejected")
    });
    if error.code == RpcErrorCode::Unauthenticated {
        // the worker restarted and lost this client
        remote.on_became_unavailable(&error.to_string());
    }
    Err(error.to_string())
}
