//! Object cache: compiled artifacts keyed by everything that determines
//! their bytes.
//!
//! The key folds the compiler name, the argument list *without* include-path
//! arguments, the input's basename, and every dependency digest, so two
//! clients (or two checkouts of the same branch) compiling the same TU with
//! the same flags hit the same entry even though their `-I` paths differ.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use nocc_protocol::Sha256Digest;

use crate::file_cache::{CacheError, FileCache};

pub struct ObjFileCache {
    cache: FileCache,
    /// Scratch directory where the compiler writes fresh objects before they
    /// are linked into the cache.
    obj_tmp_dir: PathBuf,
}

impl ObjFileCache {
    pub fn new(
        cache_dir: &Path,
        obj_tmp_dir: &Path,
        limit_bytes: u64,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(obj_tmp_dir)?;
        Ok(Self {
            cache: FileCache::new(cache_dir, limit_bytes)?,
            obj_tmp_dir: obj_tmp_dir.to_path_buf(),
        })
    }

    /// The cache path for a key, if compiled before; the object is streamed
    /// straight from this file.
    pub fn lookup(&self, key: &Sha256Digest) -> Option<PathBuf> {
        self.cache.lookup_path(key)
    }

    /// Link a freshly compiled object (or PCH) into the cache.
    pub fn save(
        &self,
        compiled_path: &Path,
        file_name_in_cache: &str,
        key: &Sha256Digest,
        file_size: u64,
    ) -> Result<(), CacheError> {
        self.cache.save(compiled_path, file_name_in_cache, key, file_size)
    }

    /// Where the compiler writes the object for one session.
    pub fn obj_out_path(&self, client_id: &str, session_id: u32) -> PathBuf {
        self.obj_tmp_dir
            .join(format!("{client_id}.{session_id}.o"))
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

/// Compute the object-cache key for one session.
///
/// `compiler_args` must already have include-path arguments filtered out
/// (see [`crate::session::split_include_args`]); `deps` carries
/// (digest, size) of every session file, in any order thanks to XOR.
pub fn make_obj_cache_key(
    compiler_name: &str,
    compiler_args: &[String],
    deps: &[(Sha256Digest, i64)],
    input_file: &str,
) -> Sha256Digest {
    let input_base = Path::new(input_file)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(compiler_name.as_bytes());
    for arg in compiler_args {
        hasher.update(arg.as_bytes());
    }
    // basename, not the full path: it varies between clients
    hasher.update(input_base.as_bytes());

    let mut key = Sha256Digest::from_hasher(hasher);
    key.b8_15 ^= compiler_args.len() as u64;
    key.b16_23 ^= deps.len() as u64;
    for (sha256, file_size) in deps {
        key.xor_with(sha256);
        key.b0_7 ^= *file_size as u64;
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(contents: &[u8]) -> (Sha256Digest, i64) {
        (Sha256Digest::of_bytes(contents), contents.len() as i64)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_is_path_insensitive_for_input_dir() {
        let deps = [dep(b"header"), dep(b"source")];
        let key_a = make_obj_cache_key("g++", &args(&["-O2"]), &deps, "/home/alice/proj/foo.cpp");
        let key_b = make_obj_cache_key("g++", &args(&["-O2"]), &deps, "/home/bob/work/foo.cpp");
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_key_is_dep_order_independent() {
        let d1 = dep(b"one");
        let d2 = dep(b"two");
        let key_a = make_obj_cache_key("g++", &[], &[d1, d2], "foo.cpp");
        let key_b = make_obj_cache_key("g++", &[], &[d2, d1], "foo.cpp");
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_key_changes_with_content_args_and_counts() {
        let deps = [dep(b"header")];
        let base = make_obj_cache_key("g++", &args(&["-O2"]), &deps, "foo.cpp");

        assert_ne!(
            base,
            make_obj_cache_key("g++", &args(&["-O3"]), &deps, "foo.cpp")
        );
        assert_ne!(
            base,
            make_obj_cache_key("clang++", &args(&["-O2"]), &deps, "foo.cpp")
        );
        assert_ne!(
            base,
            make_obj_cache_key("g++", &args(&["-O2"]), &[dep(b"changed")], "foo.cpp")
        );
        assert_ne!(
            base,
            make_obj_cache_key("g++", &args(&["-O2"]), &deps, "bar.cpp")
        );
        // dep count is folded in even when digests XOR out
        let d = dep(b"x");
        assert_ne!(
            make_obj_cache_key("g++", &[], &[d, d], "foo.cpp"),
            make_obj_cache_key("g++", &[], &[], "foo.cpp")
        );
    }

    #[test]
    fn test_save_and_lookup_round_trip() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let cache = ObjFileCache::new(
            &dir.path().join("obj-cache"),
            &dir.path().join("compiler-out"),
            1 << 20,
        )
        .unwrap();

        let out = cache.obj_out_path("clientA", 7);
        std::fs::File::create(&out)
            .unwrap()
            .write_all(b"ELF object")
            .unwrap();

        let key = make_obj_cache_key("g++", &[], &[dep(b"src")], "foo.cpp");
        assert!(cache.lookup(&key).is_none());
        cache.save(&out, "foo.cpp.o", &key, 10).unwrap();

        let hit = cache.lookup(&key).unwrap();
        assert_eq!(std::fs::read(hit).unwrap(), b"ELF object");
    }
}
