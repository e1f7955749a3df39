//! Content digests in four-segment form.
//!
//! A SHA-256 value is carried as four big-endian u64 segments rather than a
//! byte array: the wire encodes it as four fixed-width integers, and the
//! object-cache key folds many digests together with XOR (an order-independent
//! accumulator), which is cheap on this representation.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Read buffer size for file hashing.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// A SHA-256 value split into four big-endian u64 segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Digest {
    pub b0_7: u64,
    pub b8_15: u64,
    pub b16_23: u64,
    pub b24_31: u64,
}

impl Sha256Digest {
    /// An all-zero digest, used as "no digest" marker.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.b0_7 == 0 && self.b8_15 == 0 && self.b16_23 == 0 && self.b24_31 == 0
    }

    /// Fold another digest into this one segment-wise.
    ///
    /// XOR is commutative, so the result does not depend on fold order.
    pub fn xor_with(&mut self, other: &Sha256Digest) {
        self.b0_7 ^= other.b0_7;
        self.b8_15 ^= other.b8_15;
        self.b16_23 ^= other.b16_23;
        self.b24_31 ^= other.b24_31;
    }

    /// Short form: the four segments XOR-ed into one u64, in hex.
    pub fn to_short_hex(&self) -> String {
        format!("{:x}", self.b0_7 ^ self.b8_15 ^ self.b16_23 ^ self.b24_31)
    }

    /// Long form: all four segments, dash-separated hex.
    pub fn to_long_hex(&self) -> String {
        format!(
            "{:x}-{:x}-{:x}-{:x}",
            self.b0_7, self.b8_15, self.b16_23, self.b24_31
        )
    }

    /// Parse the long hex form. An unparsable string yields the empty digest,
    /// which callers detect via [`Sha256Digest::is_empty`].
    pub fn from_long_hex(hex_str: &str) -> Self {
        let mut segments = [0u64; 4];
        let mut count = 0;
        for (i, part) in hex_str.splitn(4, '-').enumerate() {
            match u64::from_str_radix(part, 16) {
                Ok(v) => {
                    segments[i] = v;
                    count += 1;
                }
                Err(_) => return Self::default(),
            }
        }
        if count != 4 {
            return Self::default();
        }
        Self {
            b0_7: segments[0],
            b8_15: segments[1],
            b16_23: segments[2],
            b24_31: segments[3],
        }
    }

    /// Finish a running hasher into segment form.
    pub fn from_hasher(hasher: Sha256) -> Self {
        let bytes = hasher.finalize();
        let seg = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i..i + 8]);
            u64::from_be_bytes(buf)
        };
        Self {
            b0_7: seg(0),
            b8_15: seg(8),
            b16_23: seg(16),
            b24_31: seg(24),
        }
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_hasher(hasher)
    }

    /// Digest of a file's contents, read in fixed-size chunks.
    ///
    /// Returns the digest and the file size in one pass.
    pub fn of_file(path: &Path) -> io::Result<(Self, i64)> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; HASH_BUF_SIZE];
        let mut total: i64 = 0;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as i64;
        }
        Ok((Self::from_hasher(hasher), total))
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_short_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_digest() {
        let d = Sha256Digest::empty();
        assert!(d.is_empty());
        assert!(!Sha256Digest::of_bytes(b"x").is_empty());
    }

    #[test]
    fn test_long_hex_round_trip() {
        let d = Sha256Digest::of_bytes(b"hello world");
        let parsed = Sha256Digest::from_long_hex(&d.to_long_hex());
        assert_eq!(d, parsed);
    }

    #[test]
    fn test_long_hex_rejects_garbage() {
        assert!(Sha256Digest::from_long_hex("not-a-digest").is_empty());
        assert!(Sha256Digest::from_long_hex("12-34").is_empty());
        assert!(Sha256Digest::from_long_hex("").is_empty());
    }

    #[test]
    fn test_xor_is_commutative() {
        let a = Sha256Digest::of_bytes(b"a");
        let b = Sha256Digest::of_bytes(b"b");

        let mut ab = a;
        ab.xor_with(&b);
        let mut ba = b;
        ba.xor_with(&a);
        assert_eq!(ab, ba);

        // folding a digest twice cancels it out
        let mut back = ab;
        back.xor_with(&b);
        assert_eq!(back, a);
    }

    #[test]
    fn test_of_file_matches_of_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let contents = vec![7u8; 200 * 1024]; // spans multiple read chunks
        File::create(&path).unwrap().write_all(&contents).unwrap();

        let (digest, size) = Sha256Digest::of_file(&path).unwrap();
        assert_eq!(size, contents.len() as i64);
        assert_eq!(digest, Sha256Digest::of_bytes(&contents));
    }

    #[test]
    fn test_known_segment_layout() {
        // SHA-256 of the empty string, big-endian segments
        let d = Sha256Digest::of_bytes(b"");
        assert_eq!(d.b0_7, 0xe3b0c44298fc1c14);
        assert_eq!(d.b24_31, 0xa495991b7852b855);
    }
}
