//! Message types for the CompilationService exchange between daemon and worker.
//!
//! A daemon keeps three connections per worker:
//! - a *control* connection for unary request/reply operations,
//! - an *upload* stream pushing dependency file chunks worker-wards,
//! - a *recv* stream on which the worker pushes compiled objects back.
//!
//! Stream chunks carry identifiers and are demultiplexed by the receiver;
//! no per-file connection is ever created.

use serde::{Deserialize, Serialize};

use crate::digest::Sha256Digest;
use crate::error::RpcError;

/// Identity of one dependency file: client path, size and content digest.
///
/// A size of -1 marks a file that does not exist on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: i64,
    pub sha256: Sha256Digest,
}

/// Opens one compilation session on the worker.
///
/// `required_files` lists every dependency (headers first, then the input
/// source, then the optional PCH sidecar); the reply tells which of them the
/// worker is missing, by index into this list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCompilationSessionRequest {
    pub client_id: String,
    pub session_id: u32,
    pub input_file: String,
    pub compiler: String,
    pub compiler_args: Vec<String>,
    pub required_files: Vec<FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_pch_file: Option<FileMetadata>,
}

/// Unary operations on the control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    StartClient {
        client_id: String,
        client_version: String,
    },
    KeepAlive {
        client_id: String,
    },
    StartCompilationSession {
        #[serde(flatten)]
        session: StartCompilationSessionRequest,
    },
    StopClient {
        client_id: String,
    },
}

/// Reply to any control request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Only meaningful for `start_compilation_session`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_indexes_to_upload: Vec<u32>,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn uploads(file_indexes_to_upload: Vec<u32>) -> Self {
        Self {
            ok: true,
            file_indexes_to_upload,
            ..Default::default()
        }
    }

    pub fn err(error: RpcError) -> Self {
        Self {
            ok: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Which stream a freshly opened connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Upload,
    Recv,
}

/// First frame on an upload or recv connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHello {
    pub stream: StreamKind,
    pub client_id: String,
}

/// Header of one upload chunk; the frame body holds the chunk bytes.
///
/// Chunks of a single (session, file) arrive strictly in order; the worker
/// knows the expected total from session metadata. An empty file is sent as
/// exactly one zero-length chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunk {
    pub client_id: String,
    pub session_id: u32,
    pub file_index: u32,
}

/// Worker acknowledgement after each fully received file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// First frame of any inbound worker connection: either a unary control
/// request (the connection stays a control connection) or a stream hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionFrame {
    Hello(StreamHello),
    Control(ControlRequest),
}

/// Frames pushed by the worker on the recv stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecvFrame {
    /// Per-session result header. If `compiler_exit_code` is non-zero no
    /// body chunks follow; otherwise chunks summing to `file_size` do.
    ObjHeader {
        session_id: u32,
        compiler_exit_code: i32,
        compiler_stdout: String,
        compiler_stderr: String,
        compiler_duration_ms: i32,
        file_size: i64,
    },
    /// One piece of the object file; the frame body holds the bytes.
    ObjChunk { session_id: u32 },
    /// Terminal frame before the worker closes a broken stream, naming the
    /// affected session when known so only that invocation fails.
    StreamError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<u32>,
        message: String,
    },
}
