//! Content-addressed on-disk cache with LRU eviction.
//!
//! Backing store for both the source cache and the object cache. Files are
//! keyed by their digest and laid out with a two-level fan-out:
//! `<cache_dir>/<2-hex-prefix>/<long-hex>/<file-name>`.
//!
//! Restoring a hit hard-links the cache copy to the consumer's path; the
//! cache file is never overwritten in place. Eviction unlinks only the cache
//! copy, so consumers already holding a link keep their data. The whole
//! directory is wiped at worker start, so LRU bookkeeping lives in memory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nocc_protocol::{fileio, Sha256Digest};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct CacheEntry {
    path: PathBuf,
    size: u64,
    last_used: u64,
}

struct CacheState {
    table: HashMap<Sha256Digest, CacheEntry>,
    total_bytes: u64,
    /// Monotonic use counter; cheaper than timestamps for LRU ordering.
    clock: u64,
}

pub struct FileCache {
    cache_dir: PathBuf,
    limit_bytes: u64,
    state: Mutex<CacheState>,
}

impl FileCache {
    pub fn new(cache_dir: &Path, limit_bytes: u64) -> Result<Self, CacheError> {
        fs::create_dir_all(cache_dir)?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            limit_bytes,
            state: Mutex::new(CacheState {
                table: HashMap::with_capacity(1024),
                total_bytes: 0,
                clock: 0,
            }),
        })
    }

    fn entry_dir(&self, sha256: &Sha256Digest) -> PathBuf {
        let long_hex = sha256.to_long_hex();
        let prefix = &long_hex[..2.min(long_hex.len())];
        self.cache_dir.join(prefix).join(long_hex)
    }

    /// Whether this digest is cached; touches LRU on hit.
    pub fn exists(&self, sha256: &Sha256Digest) -> bool {
        let mut state = self.lock_state();
        state.clock += 1;
        let clock = state.clock;
        match state.table.get_mut(sha256) {
            Some(entry) => {
                entry.last_used = clock;
                true
            }
            None => false,
        }
    }

    /// The backing file path for a cached digest; touches LRU.
    pub fn lookup_path(&self, sha256: &Sha256Digest) -> Option<PathBuf> {
        let mut state = self.lock_state();
        state.clock += 1;
        let clock = state.clock;
        state.table.get_mut(sha256).map(|entry| {
            entry.last_used = clock;
            entry.path.clone()
        })
    }

    /// Hard-link the cache copy to `target_path`. Returns false on miss.
    /// An already-existing target is treated as restored (a concurrent
    /// session linked it first).
    pub fn try_restore(&self, sha256: &Sha256Digest, target_path: &Path) -> bool {
        let Some(cached_path) = self.lookup_path(sha256) else {
            return false;
        };
        match fs::hard_link(&cached_path, target_path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => true,
            Err(e) => {
                tracing::error!(
                    "can't link {} from cache: {e}",
                    target_path.display()
                );
                false
            }
        }
    }

    /// Hard-link `source_path` into the cache under `sha256`; no-op if the
    /// digest is already cached.
    pub fn save(
        &self,
        source_path: &Path,
        file_name_in_cache: &str,
        sha256: &Sha256Digest,
        file_size: u64,
    ) -> Result<(), CacheError> {
        if self.exists(sha256) {
            return Ok(());
        }

        let entry_dir = self.entry_dir(sha256);
        fs::create_dir_all(&entry_dir)?;
        let cached_path = entry_dir.join(file_name_in_cache);
        match fs::hard_link(source_path, &cached_path) {
            Ok(()) => {}
            // a concurrent save of the same content wins the race; fine
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(CacheError::Io(e)),
        }

        let mut state = self.lock_state();
        state.clock += 1;
        let clock = state.clock;
        if state
            .table
            .insert(
                *sha256,
                CacheEntry {
                    path: cached_path,
                    size: file_size,
                    last_used: clock,
                },
            )
            .is_none()
        {
            state.total_bytes += file_size;
        }
        Ok(())
    }

    /// An opened temp file inside the cache directory; the caller writes the
    /// upload there and renames it onto the mirrored path.
    pub fn make_temp_upload_target(
        &self,
        final_path: &Path,
    ) -> std::io::Result<(File, PathBuf)> {
        let temp_dir = self.cache_dir.join(".tmp");
        fs::create_dir_all(&temp_dir)?;
        let base = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        fileio::open_temp_file(&temp_dir.join(base))
    }

    /// Evict least-recently-used entries until total bytes fit the limit.
    /// Only the cache copies are unlinked; hard links stay live.
    pub fn enforce_limit(&self) -> usize {
        let mut evicted_paths: Vec<PathBuf> = Vec::new();
        {
            let mut state = self.lock_state();
            if state.total_bytes <= self.limit_bytes {
                return 0;
            }

            let mut by_age: Vec<(Sha256Digest, u64, u64)> = state
                .table
                .iter()
                .map(|(sha, entry)| (*sha, entry.last_used, entry.size))
                .collect();
            by_age.sort_by_key(|&(_, last_used, _)| last_used);

            for (sha, _, size) in by_age {
                if state.total_bytes <= self.limit_bytes {
                    break;
                }
                if let Some(entry) = state.table.remove(&sha) {
                    state.total_bytes -= size.min(state.total_bytes);
                    evicted_paths.push(entry.path);
                }
            }
        }

        let evicted = evicted_paths.len();
        for path in evicted_paths {
            let _ = fs::remove_file(&path);
            if let Some(dir) = path.parent() {
                let _ = fs::remove_dir(dir); // only if empty
            }
        }
        evicted
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock_state().total_bytes
    }

    pub fn count(&self) -> usize {
        self.lock_state().table.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Wipe `dir` fast at worker start: rename it to a sibling and delete that
/// in the background, then recreate it empty.
pub fn prepare_empty_dir(parent_dir: &Path, subdir: &str) -> std::io::Result<PathBuf> {
    let dir = parent_dir.join(subdir);
    if dir.exists() {
        let old = parent_dir.join(format!(
            "{subdir}.old.{}.{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        ));
        fs::rename(&dir, &old)?;
        std::thread::spawn(move || {
            let _ = fs::remove_dir_all(&old);
        });
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
