//! Protocol-level tests: a fake daemon drives a real worker over TCP.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nocc_protocol::{
    read_frame, write_frame, ControlReply, ControlRequest, FileMetadata, PchInvocation, RecvFrame,
    RpcErrorCode, Sha256Digest, StartCompilationSessionRequest, StreamHello, StreamKind,
    UploadChunk, UploadReply,
};
use nocc_worker::server::{test_server, NoccServer};

/// Spawn a worker accepting connections on an ephemeral port.
fn start_worker(root: &Path) -> (Arc<NoccServer>, SocketAddr) {
    let server = test_server(root);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_server = Arc::clone(&server);
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let server = Arc::clone(&accept_server);
            std::thread::spawn(move || nocc_worker::service::handle_connection(server, stream));
        }
    });
    (server, addr)
}

/// A stand-in compiler: copies its input to its output and logs every run.
fn write_stub_compiler(dir: &Path) -> PathBuf {
    let path = dir.join("fakecc");
    let log = dir.join("compile.log");
    let script = format!(
        "#!/bin/sh\n\
         out=\"\"; input=\"\"; prev=\"\"\n\
         for a in \"$@\"; do\n\
           if [ \"$prev\" = \"-o\" ]; then out=\"$a\"; fi\n\
           case \"$a\" in -*) ;; *) input=\"$a\" ;; esac\n\
           prev=\"$a\"\n\
         done\n\
         echo \"$input\" >> {}\n\
         cat \"$input\" > \"$out\"\n",
        log.display()
    );
    std::fs::write(&path, script).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

fn compile_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("compile.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Wait briefly for asynchronous bookkeeping (e.g. the src-cache save that
/// follows the upload ack) to land.
fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("condition not reached within 2s");
}

fn meta(client_path: &str, contents: &[u8]) -> FileMetadata {
    FileMetadata {
        file_name: client_path.to_string(),
        file_size: contents.len() as i64,
        sha256: Sha256Digest::of_bytes(contents),
    }
}

fn rpc(stream: &mut TcpStream, request: &ControlRequest) -> ControlReply {
    write_frame(stream, request, &[]).unwrap();
    let (reply, _body): (ControlReply, Vec<u8>) = read_frame(stream).unwrap();
    reply
}

fn start_client(addr: SocketAddr, client_id: &str) -> TcpStream {
    let mut control = TcpStream::connect(addr).unwrap();
    let reply = rpc(
        &mut control,
        &ControlRequest::StartClient {
            client_id: client_id.to_string(),
            client_version: "test".to_string(),
        },
    );
    assert!(reply.ok);
    control
}

fn open_stream(addr: SocketAddr, client_id: &str, kind: StreamKind) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    let hello = StreamHello {
        stream: kind,
        client_id: client_id.to_string(),
    };
    write_frame(&mut stream, &hello, &[]).unwrap();
    stream
}

fn upload_file(
    stream: &mut TcpStream,
    client_id: &str,
    session_id: u32,
    file_index: u32,
    contents: &[u8],
) {
    let header = UploadChunk {
        client_id: client_id.to_string(),
        session_id,
        file_index,
    };
    // ≤64 KiB chunks; an empty file is one empty chunk
    let mut sent_any = false;
    for chunk in contents.chunks(64 * 1024) {
        write_frame(stream, &header, chunk).unwrap();
        sent_any = true;
    }
    if !sent_any {
        write_frame(stream, &header, &[]).unwrap();
    }
    let (reply, _body): (UploadReply, Vec<u8>) = read_frame(stream).unwrap();
    assert!(reply.ok, "upload rejected: {:?}", reply.error);
}

/// Read one object off the recv stream: (session_id, exit_code, bytes).
fn recv_obj(stream: &mut TcpStream) -> (u32, i32, Vec<u8>) {
    let (frame, _body): (RecvFrame, Vec<u8>) = read_frame(stream).unwrap();
    let RecvFrame::ObjHeader {
        session_id,
        compiler_exit_code,
        file_size,
        ..
    } = frame
    else {
        panic!("expected obj header, got {frame:?}");
    };

    let mut obj = Vec::new();
    while (obj.len() as i64) < file_size {
        let (chunk, body): (RecvFrame, Vec<u8>) = read_frame(stream).unwrap();
        match chunk {
            RecvFrame::ObjChunk {
                session_id: chunk_session,
            } => {
                assert_eq!(chunk_session, session_id);
                obj.extend_from_slice(&body);
            }
            other => panic!("expected obj chunk, got {other:?}"),
        }
    }
    (session_id, compiler_exit_code, obj)
}

fn session_request(
    client_id: &str,
    session_id: u32,
    compiler: &Path,
    files: Vec<FileMetadata>,
    pch: Option<FileMetadata>,
) -> ControlRequest {
    ControlRequest::StartCompilationSession {
        session: StartCompilationSessionRequest {
            client_id: client_id.to_string(),
            session_id,
            input_file: "/proj/foo.cpp".to_string(),
            compiler: compiler.to_string_lossy().into_owned(),
            compiler_args: vec!["-O2".to_string()],
            required_files: files,
            required_pch_file: pch,
        },
    }
}

#[test]
fn test_cold_then_warm_compile() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_worker(dir.path());
    let compiler = write_stub_compiler(dir.path());

    let header = b"#pragma once\n".to_vec();
    let source = b"int main() { return 0; }\n".to_vec();
    let files = vec![meta("/proj/inc/bar.h", &header), meta("/proj/foo.cpp", &source)];

    let mut control = start_client(addr, "c1");
    let mut recv = open_stream(addr, "c1", StreamKind::Recv);

    // cold: the worker knows nothing, both files are requested
    let reply = rpc(
        &mut control,
        &session_request("c1", 1, &compiler, files.clone(), None),
    );
    assert!(reply.ok);
    assert_eq!(reply.file_indexes_to_upload, vec![0, 1]);

    let mut upload = open_stream(addr, "c1", StreamKind::Upload);
    upload_file(&mut upload, "c1", 1, 0, &header);
    upload_file(&mut upload, "c1", 1, 1, &source);

    let (session_id, exit_code, obj) = recv_obj(&mut recv);
    assert_eq!(session_id, 1);
    assert_eq!(exit_code, 0);
    assert_eq!(obj, source); // the stub compiler copies input to output

    wait_until(|| server.src_cache.count() == 2);
    assert_eq!(server.obj_cache.count(), 1);
    assert_eq!(compile_count(dir.path()), 1);

    // warm: same inputs hit the object cache; nothing uploads, nothing runs
    let reply = rpc(&mut control, &session_request("c1", 2, &compiler, files, None));
    assert!(reply.ok);
    assert!(reply.file_indexes_to_upload.is_empty());

    let (session_id, exit_code, obj) = recv_obj(&mut recv);
    assert_eq!(session_id, 2);
    assert_eq!(exit_code, 0);
    assert_eq!(obj, source);
    assert_eq!(compile_count(dir.path()), 1);
    assert_eq!(server.obj_cache.count(), 1);
}

#[test]
fn test_cross_client_share() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_worker(dir.path());
    let compiler = write_stub_compiler(dir.path());

    let source = b"int f();\n".to_vec();
    let files = vec![meta("/proj/foo.cpp", &source)];

    // client A compiles cold
    let mut control_a = start_client(addr, "clientA");
    let mut recv_a = open_stream(addr, "clientA", StreamKind::Recv);
    let reply = rpc(
        &mut control_a,
        &session_request("clientA", 1, &compiler, files.clone(), None),
    );
    assert_eq!(reply.file_indexes_to_upload, vec![0]);
    let mut upload_a = open_stream(addr, "clientA", StreamKind::Upload);
    upload_file(&mut upload_a, "clientA", 1, 0, &source);
    let (_, exit_code, _) = recv_obj(&mut recv_a);
    assert_eq!(exit_code, 0);

    // a different client with the same TU: no upload, no compile
    let mut control_b = start_client(addr, "clientB");
    let mut recv_b = open_stream(addr, "clientB", StreamKind::Recv);
    let reply = rpc(
        &mut control_b,
        &session_request("clientB", 1, &compiler, files, None),
    );
    assert!(reply.file_indexes_to_upload.is_empty());
    let (_, exit_code, obj) = recv_obj(&mut recv_b);
    assert_eq!(exit_code, 0);
    assert_eq!(obj, source);

    assert_eq!(compile_count(dir.path()), 1);
    assert_eq!(server.obj_cache.count(), 1);
}

#[test]
fn test_dependency_reupload_avoidance() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = start_worker(dir.path());
    let compiler = write_stub_compiler(dir.path());

    let header = b"#define X 1\n".to_vec();
    let source_one = b"int one() { return 1; }\n".to_vec();
    let source_two = b"int two() { return 2; }\n".to_vec();

    let mut control = start_client(addr, "c1");
    let mut recv = open_stream(addr, "c1", StreamKind::Recv);
    let mut upload = open_stream(addr, "c1", StreamKind::Upload);

    let reply = rpc(
        &mut control,
        &ControlRequest::StartCompilationSession {
            session: StartCompilationSessionRequest {
                client_id: "c1".to_string(),
                session_id: 1,
                input_file: "/proj/one.cpp".to_string(),
                compiler: compiler.to_string_lossy().into_owned(),
                compiler_args: vec![],
                required_files: vec![meta("/proj/h.h", &header), meta("/proj/one.cpp", &source_one)],
                required_pch_file: None,
            },
        },
    );
    assert_eq!(reply.file_indexes_to_upload, vec![0, 1]);
    upload_file(&mut upload, "c1", 1, 0, &header);
    upload_file(&mut upload, "c1", 1, 1, &source_one);
    let (_, exit_code, _) = recv_obj(&mut recv);
    assert_eq!(exit_code, 0);

    // the shared header is already known: only the new source is requested
    let reply = rpc(
        &mut control,
        &ControlRequest::StartCompilationSession {
            session: StartCompilationSessionRequest {
                client_id: "c1".to_string(),
                session_id: 2,
                input_file: "/proj/two.cpp".to_string(),
                compiler: compiler.to_string_lossy().into_owned(),
                compiler_args: vec![],
                required_files: vec![meta("/proj/h.h", &header), meta("/proj/two.cpp", &source_two)],
                required_pch_file: None,
            },
        },
    );
    assert_eq!(reply.file_indexes_to_upload, vec![1]);
    upload_file(&mut upload, "c1", 2, 1, &source_two);
    let (_, exit_code, _) = recv_obj(&mut recv);
    assert_eq!(exit_code, 0);
}

#[test]
fn test_session_conflict_on_changed_digest() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = start_worker(dir.path());
    let compiler = write_stub_compiler(dir.path());

    let mut control = start_client(addr, "c1");
    let reply = rpc(
        &mut control,
        &session_request("c1", 1, &compiler, vec![meta("/proj/a.h", b"v1")], None),
    );
    assert!(reply.ok);

    // same path advertised with a different digest: rejected
    let reply = rpc(
        &mut control,
        &session_request("c1", 2, &compiler, vec![meta("/proj/a.h", b"v2")], None),
    );
    assert!(!reply.ok);
    assert_eq!(reply.error.unwrap().code, RpcErrorCode::SessionConflict);
}

#[test]
fn test_unknown_client_is_unauthenticated() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = start_worker(dir.path());
    let compiler = write_stub_compiler(dir.path());

    let mut control = TcpStream::connect(addr).unwrap();
    let reply = rpc(
        &mut control,
        &session_request("ghost", 1, &compiler, vec![meta("/proj/a.cpp", b"x")], None),
    );
    assert!(!reply.ok);
    assert_eq!(reply.error.unwrap().code, RpcErrorCode::Unauthenticated);
}

#[test]
fn test_compiler_error_is_delivered_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = start_worker(dir.path());

    // a compiler that always fails with a diagnostic
    let compiler = dir.path().join("badcc");
    std::fs::write(&compiler, "#!/bin/sh\necho 'foo.cpp:1: error: nope' >&2\nexit 1\n").unwrap();
    let mut permissions = std::fs::metadata(&compiler).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&compiler, permissions).unwrap();

    let source = b"int broken(\n".to_vec();
    let mut control = start_client(addr, "c1");
    let mut recv = open_stream(addr, "c1", StreamKind::Recv);
    let reply = rpc(
        &mut control,
        &session_request("c1", 1, &compiler, vec![meta("/proj/foo.cpp", &source)], None),
    );
    assert_eq!(reply.file_indexes_to_upload, vec![0]);
    let mut upload = open_stream(addr, "c1", StreamKind::Upload);
    upload_file(&mut upload, "c1", 1, 0, &source);

    let (frame, _): (RecvFrame, Vec<u8>) = read_frame(&mut recv).unwrap();
    match frame {
        RecvFrame::ObjHeader {
            compiler_exit_code,
            compiler_stderr,
            file_size,
            ..
        } => {
            assert_eq!(compiler_exit_code, 1);
            assert!(compiler_stderr.contains("error: nope"));
            assert_eq!(file_size, 0); // no object travels on failure
        }
        other => panic!("expected obj header, got {other:?}"),
    }
}

#[test]
fn test_pch_compiled_once_and_shared() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_worker(dir.path());
    let compiler = write_stub_compiler(dir.path());

    let header = b"// all the headers\n".to_vec();
    let source = b"int main() {}\n".to_vec();
    let sidecar = PchInvocation {
        hash: Sha256Digest::of_bytes(b"the-pch-identity").to_long_hex(),
        compiler: compiler.to_string_lossy().into_owned(),
        input_file: "/proj/all.h".to_string(),
        output_file: "/proj/all.h.gch".to_string(),
        args: vec![],
    };
    let sidecar_bytes = sidecar.to_json().unwrap();
    let sidecar_meta = FileMetadata {
        file_name: "/proj/all.h.nocc-pch".to_string(),
        file_size: sidecar_bytes.len() as i64,
        sha256: Sha256Digest::from_long_hex(&sidecar.hash),
    };

    let run_client = |client_id: &str| {
        let mut control = start_client(addr, client_id);
        let mut recv = open_stream(addr, client_id, StreamKind::Recv);
        let reply = rpc(
            &mut control,
            &session_request(
                client_id,
                1,
                &compiler,
                vec![meta("/proj/all.h", &header), meta("/proj/foo.cpp", &source)],
                Some(sidecar_meta.clone()),
            ),
        );
        assert!(reply.ok);

        if !reply.file_indexes_to_upload.is_empty() {
            let mut upload = open_stream(addr, client_id, StreamKind::Upload);
            for &index in &reply.file_indexes_to_upload {
                let contents: &[u8] = match index {
                    0 => &header,
                    1 => &source,
                    2 => &sidecar_bytes,
                    other => panic!("unexpected upload index {other}"),
                };
                upload_file(&mut upload, client_id, 1, index, contents);
            }
        }

        let (_, exit_code, obj) = recv_obj(&mut recv);
        assert_eq!(exit_code, 0);
        obj
    };

    let obj_a = run_client("clientA");
    assert_eq!(obj_a, source);
    // the pch (keyed by the sidecar hash) and the object are both cached
    assert_eq!(server.obj_cache.count(), 2);
    // two stub runs: the pch and the TU
    assert_eq!(compile_count(dir.path()), 2);

    // the compiled pch is hard-linked into client A's mirror
    let client_a = server.clients.get_client("clientA").unwrap();
    assert!(client_a
        .map_client_path_to_server_abs("/proj/all.h.gch")
        .exists());

    // another client with the same pch: TU comes from the obj cache,
    // the pch is not recompiled
    let obj_b = run_client("clientB");
    assert_eq!(obj_b, source);
    assert_eq!(compile_count(dir.path()), 2);
    assert_eq!(server.obj_cache.count(), 2);
}
