//! nocc wire protocol and shared primitives.
//!
//! This crate carries everything both sides of a daemon/worker pair must
//! agree on: the four-segment SHA-256 digest, the frame layer, the message
//! set of the CompilationService, the `.nocc-pch` sidecar schema, and the
//! atomic file-write helpers used on both ends of a transfer.

pub mod digest;
pub mod error;
pub mod fileio;
pub mod messages;
pub mod pch;
pub mod wire;

pub use digest::Sha256Digest;
pub use error::{RpcError, RpcErrorCode, WireError};
pub use messages::{
    ConnectionFrame, ControlReply, ControlRequest, FileMetadata, RecvFrame,
    StartCompilationSessionRequest, StreamHello, StreamKind, UploadChunk, UploadReply,
};
pub use pch::{sidecar_path_for, PchInvocation, PCH_SIDECAR_EXT};
pub use wire::{read_frame, write_frame, CHUNK_SIZE};
