//! Source cache: content-addressed store of uploaded dependency files.
//!
//! Every successfully uploaded (or restored) dependency is hard-linked here
//! under its digest, so the next client needing the same header skips the
//! upload entirely.

use std::fs::File;
use std::path::{Path, PathBuf};

use nocc_protocol::Sha256Digest;

use crate::file_cache::{CacheError, FileCache};

pub struct SrcFileCache {
    cache: FileCache,
}

impl SrcFileCache {
    pub fn new(cache_dir: &Path, limit_bytes: u64) -> Result<Self, CacheError> {
        Ok(Self {
            cache: FileCache::new(cache_dir, limit_bytes)?,
        })
    }

    /// Hard-link a cached source to `target_path` if the digest is known.
    pub fn try_restore(&self, sha256: &Sha256Digest, target_path: &Path) -> bool {
        self.cache.try_restore(sha256, target_path)
    }

    /// Link a freshly uploaded file into the cache.
    pub fn save(
        &self,
        uploaded_path: &Path,
        sha256: &Sha256Digest,
        file_size: u64,
    ) -> Result<(), CacheError> {
        let file_name = uploaded_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "src".to_string());
        self.cache.save(uploaded_path, &file_name, sha256, file_size)
    }

    /// Temp file for an in-flight upload; renamed onto the mirror path when
    /// all chunks arrived.
    pub fn make_temp_upload_target(&self, final_path: &Path) -> std::io::Result<(File, PathBuf)> {
        self.cache.make_temp_upload_target(final_path)
    }

    pub fn enforce_limit(&self) -> usize {
        self.cache.enforce_limit()
    }

    pub fn total_bytes(&self) -> u64 {
        self.cache.total_bytes()
    }

    pub fn count(&self) -> usize {
        self.cache.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_upload_then_cross_client_restore() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SrcFileCache::new(&dir.path().join("src-cache"), 1 << 20).unwrap();

        // client A's upload lands in its mirror and is saved to the cache
        let uploaded = dir.path().join("clientA_foo.h");
        File::create(&uploaded).unwrap().write_all(b"foo").unwrap();
        let sha = Sha256Digest::of_bytes(b"foo");
        cache.save(&uploaded, &sha, 3).unwrap();

        // client B's identical dependency restores without an upload
        let restored = dir.path().join("clientB_foo.h");
        assert!(cache.try_restore(&sha, &restored));
        assert_eq!(std::fs::read(&restored).unwrap(), b"foo");
        assert_eq!(cache.count(), 1);
    }
}
