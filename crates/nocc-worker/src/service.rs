//! CompilationService handlers: control requests, upload reception and
//! object delivery.
//!
//! Every inbound TCP connection starts with one frame that decides its role:
//! a control request makes it a persistent unary request/reply connection; a
//! stream hello turns it into the client's upload or recv stream. Stream
//! chunks carry (sessionID, fileIndex) so one stream serves every concurrent
//! invocation of a client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use nocc_protocol::{
    read_frame, write_frame, ConnectionFrame, ControlReply, ControlRequest, RecvFrame, RpcError,
    RpcErrorCode, StartCompilationSessionRequest, StreamKind, UploadChunk, UploadReply, CHUNK_SIZE,
};

use crate::clients::FileState;
use crate::launcher::launch_on_ready_sessions;
use crate::server::NoccServer;
use crate::session::Session;

/// Poll interval of the delivery loop (also how fast disconnects are seen).
const READY_POLL_TIMEOUT: Duration = Duration::from_millis(300);

pub fn handle_connection(server: Arc<NoccServer>, mut stream: TcpStream) {
    let _ = stream.set_nodelay(true);

    let first: ConnectionFrame = match read_frame(&mut stream) {
        Ok((frame, _body)) => frame,
        Err(e) => {
            tracing::debug!("dropping connection with bad first frame: {e}");
            return;
        }
    };

    match first {
        ConnectionFrame::Control(request) => control_loop(&server, stream, request),
        ConnectionFrame::Hello(hello) => match hello.stream {
            StreamKind::Upload => upload_stream_loop(&server, stream),
            StreamKind::Recv => recv_stream_loop(&server, stream, &hello.client_id),
        },
    }
}

/// Unary request/reply until the daemon hangs up.
fn control_loop(server: &Arc<NoccServer>, mut stream: TcpStream, first: ControlRequest) {
    let mut request = first;
    loop {
        let reply = handle_control_request(server, request);
        if write_frame(&mut stream, &reply, &[]).is_err() {
            return;
        }
        request = match read_frame::<ControlRequest>(&mut stream) {
            Ok((next, _body)) => next,
            Err(_) => return,
        };
    }
}

fn handle_control_request(server: &Arc<NoccServer>, request: ControlRequest) -> ControlReply {
    match request {
        ControlRequest::StartClient {
            client_id,
            client_version,
        } => match server.clients.on_client_connected(&client_id) {
            Ok(_client) => {
                tracing::info!(
                    "new client: clientID {client_id}, version {client_version}; nClients {}",
                    server.clients.active_count()
                );
                ControlReply::ok()
            }
            Err(e) => {
                tracing::error!("can't create client {client_id}: {e}");
                ControlReply::err(RpcError::new(RpcErrorCode::Internal, e))
            }
        },

        ControlRequest::KeepAlive { client_id } => match server.clients.get_client(&client_id) {
            Some(client) => {
                client.touch();
                ControlReply::ok()
            }
            None => ControlReply::err(RpcError::unauthenticated(&client_id)),
        },

        ControlRequest::StartCompilationSession { session } => {
            start_compilation_session(server, session)
        }

        ControlRequest::StopClient { client_id } => {
            if let Some(client) = server.clients.get_client(&client_id) {
                tracing::info!(
                    "client disconnected: clientID {client_id}; nClients {}",
                    server.clients.active_count() - 1
                );
                // removing the working dir can take a while; reply now
                let server = Arc::clone(server);
                std::thread::spawn(move || server.clients.delete_client(&client));
            }
            ControlReply::ok()
        }
    }
}

/// Session creation (the cache-or-upload decision). The reply carries the
/// indexes of files the client must upload, in the combined files+pch index
/// space.
fn start_compilation_session(
    server: &Arc<NoccServer>,
    request: StartCompilationSessionRequest,
) -> ControlReply {
    let Some(client) = server.clients.get_client(&request.client_id) else {
        tracing::error!(
            "unauthenticated client on session start: clientID {}",
            request.client_id
        );
        return ControlReply::err(RpcError::unauthenticated(&request.client_id));
    };
    client.touch();

    let session = match Session::create(&request, &client) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(
                "failed to open session: clientID {}, sessionID {}: {e}",
                client.client_id,
                request.session_id
            );
            return ControlReply::err(e);
        }
    };

    // optimistic path: this exact object was compiled before (possibly by
    // another client); stream it straight from the cache, upload nothing
    if let Some(cached_path) = server.obj_cache.lookup(&session.obj_cache_key) {
        session
            .obj_cache_exists
            .store(true, std::sync::atomic::Ordering::SeqCst);
        session.set_output_file(cached_path);
        session.try_start_compilation(); // no compiler will ever run
        tracing::info!(
            "started: sessionID {}, clientID {}, from obj cache: {}",
            session.session_id,
            client.client_id,
            session.input_file
        );
        client.register_session(&session);
        client.push_ready_session(session);
        return ControlReply::uploads(Vec::new());
    }

    client.mkdir_all_for_session(&session);

    // at most one upload per (client, path): the first session to claim a
    // file uploads it, everyone else waits on its state
    let mut file_indexes_to_upload: Vec<u32> = Vec::with_capacity(session.files.len());
    for (index, file) in session.files.iter().enumerate() {
        if file.compare_and_swap(FileState::JustCreated, FileState::Uploading) {
            file.mark_upload_started();
            if server
                .src_cache
                .try_restore(&file.sha256, &file.server_file_name)
            {
                tracing::debug!(
                    "file {} is in src-cache, no need to upload",
                    file.client_file_name
                );
                file.set_state(FileState::Uploaded);
                continue;
            }
            file_indexes_to_upload.push(index as u32);
        } else if file.state() == FileState::Uploading {
            if file.is_upload_hanging() {
                file.mark_upload_started();
                tracing::error!(
                    "re-requesting hung upload: sessionID {}, {}",
                    session.session_id,
                    file.client_file_name
                );
                file_indexes_to_upload.push(index as u32);
            }
        } else if file.compare_and_swap(FileState::UploadError, FileState::Uploading) {
            file.mark_upload_started();
            tracing::error!(
                "re-requesting failed upload: sessionID {}, {}",
                session.session_id,
                file.client_file_name
            );
            file_indexes_to_upload.push(index as u32);
        }
    }

    tracing::info!(
        "started: sessionID {}, clientID {}, waiting {} uploads: {}",
        session.session_id,
        client.client_id,
        file_indexes_to_upload.len(),
        session.input_file
    );
    client.register_session(&session);
    // sessions waiting only on src-cache restores may be ready already
    launch_on_ready_sessions(&server.launcher, &server.obj_cache, &client);

    ControlReply::uploads(file_indexes_to_upload)
}

/// Upload stream: files of many sessions arrive back to back; chunks of one
/// file arrive strictly in order and any identifier mismatch aborts the
/// stream (the daemon recreates it).
fn upload_stream_loop(server: &Arc<NoccServer>, mut stream: TcpStream) {
    loop {
        let (chunk, body): (UploadChunk, Vec<u8>) = match read_frame(&mut stream) {
            Ok(fb) => fb,
            Err(_) => return,
        };

        let Some(client) = server.clients.get_client(&chunk.client_id) else {
            tracing::error!(
                "unauthenticated client on upload stream: clientID {}",
                chunk.client_id
            );
            let reply = UploadReply {
                ok: false,
                error: Some(RpcError::unauthenticated(&chunk.client_id)),
            };
            let _ = write_frame(&mut stream, &reply, &[]);
            return;
        };
        client.touch();

        let file = client
            .get_session(chunk.session_id)
            .and_then(|s| s.files.get(chunk.file_index as usize).cloned());
        let Some(file) = file else {
            tracing::error!(
                "bad sessionID/fileIndex on upload: clientID {}, sessionID {}",
                client.client_id,
                chunk.session_id
            );
            let reply = UploadReply {
                ok: false,
                error: Some(RpcError::new(
                    RpcErrorCode::BadRequest,
                    format!(
                        "unknown sessionID {} with index {}",
                        chunk.session_id, chunk.file_index
                    ),
                )),
            };
            let _ = write_frame(&mut stream, &reply, &[]);
            return;
        };

        match receive_uploaded_file(server, &mut stream, &chunk, body, &file) {
            Ok(()) => {
                file.set_state(FileState::Uploaded);
                tracing::debug!(
                    "received {} bytes: sessionID {}, {}",
                    file.file_size,
                    chunk.session_id,
                    file.client_file_name
                );
                // other sessions may be waiting on exactly this file
                launch_on_ready_sessions(&server.launcher, &server.obj_cache, &client);
                if write_frame(&mut stream, &UploadReply { ok: true, error: None }, &[]).is_err() {
                    return;
                }
                if let Err(e) = server.src_cache.save(
                    &file.server_file_name,
                    &file.sha256,
                    file.file_size.max(0) as u64,
                ) {
                    tracing::error!("can't save {} to src-cache: {e}", file.client_file_name);
                }
            }
            Err(e) => {
                file.set_state(FileState::UploadError);
                tracing::error!(
                    "can't receive file {}: {e}",
                    file.client_file_name
                );
                let reply = UploadReply {
                    ok: false,
                    error: Some(RpcError::new(RpcErrorCode::Internal, e)),
                };
                let _ = write_frame(&mut stream, &reply, &[]);
                return;
            }
        }
    }
}

/// Append chunks into a temp file until the advertised size arrived, then
/// rename onto the mirrored path (concurrent re-requests can't torn-write).
fn receive_uploaded_file(
    server: &Arc<NoccServer>,
    stream: &mut TcpStream,
    first_chunk: &UploadChunk,
    first_body: Vec<u8>,
    file: &crate::clients::ClientFile,
) -> Result<(), String> {
    let expected_bytes = file.file_size.max(0) as usize;
    let (mut temp_file, temp_path) = server
        .src_cache
        .make_temp_upload_target(&file.server_file_name)
        .map_err(|e| e.to_string())?;

    let result = (|| {
        temp_file
            .write_all(&first_body)
            .map_err(|e| e.to_string())?;
        let mut received_bytes = first_body.len();

        while received_bytes < expected_bytes {
            let (next_chunk, next_body): (UploadChunk, Vec<u8>) =
                read_frame(stream).map_err(|e| e.to_string())?;
            if next_chunk.session_id != first_chunk.session_id
                || next_chunk.file_index != first_chunk.file_index
            {
                return Err("inconsistent stream, chunks mismatch".to_string());
            }
            temp_file
                .write_all(&next_body)
                .map_err(|e| e.to_string())?;
            received_bytes += next_body.len();
        }
        temp_file.flush().map_err(|e| e.to_string())
    })();

    drop(temp_file);
    match result {
        Ok(()) => std::fs::rename(&temp_path, &file.server_file_name).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            e.to_string()
        }),
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

/// Object delivery: push every ready session's result, then its object
/// bytes, over the client's recv stream.
fn recv_stream_loop(server: &Arc<NoccServer>, mut stream: TcpStream, client_id: &str) {
    let Some(client) = server.clients.get_client(client_id) else {
        tracing::error!("unauthenticated client on recv stream: clientID {client_id}");
        let frame = RecvFrame::StreamError {
            session_id: None,
            message: format!("clientID {client_id} not found"),
        };
        let _ = write_frame(&mut stream, &frame, &[]);
        return;
    };

    loop {
        if server.quit.is_quit() || client.is_disconnected() {
            return;
        }
        let Some(session) = client.next_ready_session(READY_POLL_TIMEOUT) else {
            continue;
        };
        client.touch();

        let result = session.result();
        let send_result = if result.exit_code != 0 {
            // only the header travels: there is no object
            let header = RecvFrame::ObjHeader {
                session_id: session.session_id,
                compiler_exit_code: result.exit_code,
                compiler_stdout: result.stdout.clone(),
                compiler_stderr: result.stderr.clone(),
                compiler_duration_ms: result.duration_ms,
                file_size: 0,
            };
            write_frame(&mut stream, &header, &[]).map_err(|e| e.to_string())
        } else {
            tracing::info!(
                "send obj file: sessionID {}, clientID {}, {} ms",
                session.session_id,
                client.client_id,
                result.duration_ms
            );
            send_obj_file_by_chunks(&mut stream, &session)
        };

        if let Err(e) = send_result {
            tracing::error!(
                "can't send obj for sessionID {} clientID {}: {e}",
                session.session_id,
                client.client_id
            );
            // name the session in the trailer so the daemon fails only it
            let frame = RecvFrame::StreamError {
                session_id: Some(session.session_id),
                message: e,
            };
            let _ = write_frame(&mut stream, &frame, &[]);
            return;
        }

        client.close_session(session.session_id);
    }
}

fn send_obj_file_by_chunks(stream: &mut TcpStream, session: &Session) -> Result<(), String> {
    let output_file = session.output_file();
    let mut file = std::fs::File::open(&output_file)
        .map_err(|e| format!("can't open {}: {e}", output_file.display()))?;
    let file_size = file
        .metadata()
        .map_err(|e| e.to_string())?
        .len() as i64;

    let result = session.result();
    let header = RecvFrame::ObjHeader {
        session_id: session.session_id,
        compiler_exit_code: 0,
        compiler_stdout: result.stdout.clone(),
        compiler_stderr: result.stderr.clone(),
        compiler_duration_ms: result.duration_ms,
        file_size,
    };
    write_frame(stream, &header, &[]).map_err(|e| e.to_string())?;

    let chunk_header = RecvFrame::ObjChunk {
        session_id: session.session_id,
    };
    let mut chunk_buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk_buf).map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        write_frame(stream, &chunk_header, &chunk_buf[..n]).map_err(|e| e.to_string())?;
    }
    Ok(())
}
