//! The `.nocc-pch` sidecar: a small JSON file standing in for a precompiled
//! header.
//!
//! Real `.gch`/`.pch` files are large and worker-specific, so they are never
//! uploaded. Instead, the daemon writes this sidecar next to the locally
//! produced PCH; the dependency collector substitutes it for the header, and
//! each worker compiles the real PCH once from the recorded command line.
//! Given the same inputs, every client produces a byte-identical sidecar, so
//! it participates in the source cache like any other dependency.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// File extension of the sidecar, including the dot.
pub const PCH_SIDECAR_EXT: &str = ".nocc-pch";

/// Contents of a `.nocc-pch` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PchInvocation {
    /// Long hex digest of the locally compiled PCH; doubles as the worker's
    /// object-cache key for the compiled header.
    pub hash: String,
    pub compiler: String,
    pub input_file: String,
    pub output_file: String,
    pub args: Vec<String>,
}

impl PchInvocation {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = fs::read(path)?;
        serde_json::from_slice(&contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupted pch sidecar {}: {e}", path.display()),
            )
        })
    }
}

/// Maps a header path to its sidecar path: `all.h` becomes `all.h.nocc-pch`.
/// A trailing `.pch`/`.gch` extension is stripped first, so probing the
/// sidecar from either the header or the compiled PCH lands on the same file.
pub fn sidecar_path_for(header_path: &str) -> String {
    let base = header_path
        .strip_suffix(".pch")
        .or_else(|| header_path.strip_suffix(".gch"))
        .unwrap_or(header_path);
    format!("{base}{PCH_SIDECAR_EXT}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Sha256Digest;

    fn sample() -> PchInvocation {
        PchInvocation {
            hash: Sha256Digest::of_bytes(b"pch contents").to_long_hex(),
            compiler: "g++".to_string(),
            input_file: "/proj/all.h".to_string(),
            output_file: "/proj/all.h.gch".to_string(),
            args: vec!["-x".to_string(), "c++-header".to_string()],
        }
    }

    #[test]
    fn test_sidecar_schema_field_names() {
        let json = String::from_utf8(sample().to_json().unwrap()).unwrap();
        assert!(json.contains("\"inputFile\""));
        assert!(json.contains("\"outputFile\""));
        assert!(json.contains("\"hash\""));
    }

    #[test]
    fn test_sidecar_is_deterministic() {
        assert_eq!(sample().to_json().unwrap(), sample().to_json().unwrap());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all.h.nocc-pch");
        fs::write(&path, sample().to_json().unwrap()).unwrap();
        assert_eq!(PchInvocation::load(&path).unwrap(), sample());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.nocc-pch");
        fs::write(&path, b"not json").unwrap();
        assert!(PchInvocation::load(&path).is_err());
    }

    #[test]
    fn test_sidecar_path_for() {
        assert_eq!(sidecar_path_for("/p/all.h"), "/p/all.h.nocc-pch");
        assert_eq!(sidecar_path_for("/p/all.h.gch"), "/p/all.h.nocc-pch");
        assert_eq!(sidecar_path_for("/p/all.h.pch"), "/p/all.h.nocc-pch");
    }
}
