//! Protocol error codes shared by daemon and worker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error codes carried in reply envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    /// The clientID is unknown to the worker (e.g. the worker restarted).
    Unauthenticated,
    /// A dependency path was registered earlier with a different digest.
    SessionConflict,
    /// Malformed request or stream chunk.
    BadRequest,
    /// Any other worker-side failure.
    Internal,
}

/// An error reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthenticated(client_id: &str) -> Self {
        Self::new(
            RpcErrorCode::Unauthenticated,
            format!("clientID {client_id} not found; probably, the worker was restarted just now"),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Errors raised by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),

    #[error("connection closed")]
    Closed,
}
