//! Frame layer: length-prefixed JSON headers with an optional raw body.
//!
//! Every message on a nocc connection is one frame:
//!
//! ```text
//! [u32-le header length][header JSON][u32-le body length][body bytes]
//! ```
//!
//! The header is a small serde struct (a request, a reply, or a stream chunk
//! header); the body carries raw file bytes so file contents never pass
//! through JSON. Unary replies and acks use a zero-length body.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WireError;

/// Chunk size for file transfer in both directions.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a frame header (compiler stderr rides in headers).
const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024;

/// Upper bound on a frame body. Bodies are produced in `CHUNK_SIZE` pieces;
/// anything larger indicates a corrupt stream.
const MAX_BODY_LEN: u32 = 1024 * 1024;

/// Write one frame: serialized `header` followed by `body`.
pub fn write_frame<T: Serialize>(
    w: &mut impl Write,
    header: &T,
    body: &[u8],
) -> Result<(), WireError> {
    let header_json = serde_json::to_vec(header)?;
    w.write_all(&(header_json.len() as u32).to_le_bytes())?;
    w.write_all(&header_json)?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    if !body.is_empty() {
        w.write_all(body)?;
    }
    w.flush()?;
    Ok(())
}

/// Read one frame, deserializing the header as `T`.
///
/// Returns [`WireError::Closed`] on a clean EOF at a frame boundary.
pub fn read_frame<T: DeserializeOwned>(r: &mut impl Read) -> Result<(T, Vec<u8>), WireError> {
    let header_len = match read_u32(r) {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
        Err(e) => return Err(WireError::Io(e)),
    };
    if header_len > MAX_HEADER_LEN {
        return Err(WireError::FrameTooLarge(header_len as u64));
    }

    let mut header_buf = vec![0u8; header_len as usize];
    r.read_exact(&mut header_buf)?;
    let header: T = serde_json::from_slice(&header_buf)?;

    let body_len = read_u32(r).map_err(WireError::Io)?;
    if body_len > MAX_BODY_LEN {
        return Err(WireError::FrameTooLarge(body_len as u64));
    }
    let mut body = vec![0u8; body_len as usize];
    if body_len > 0 {
        r.read_exact(&mut body)?;
    }

    Ok((header, body))
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
