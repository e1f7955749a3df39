//! Small filesystem helpers shared by daemon and worker.
//!
//! Destination files are never opened for write in place: writers get a temp
//! file with a unique suffix next to the target and rename it over when done.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create all parent directories of `file_path`.
pub fn mkdir_for_file(file_path: &Path) -> io::Result<()> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Open a fresh temp file next to `final_path`, named with a unique suffix.
/// The caller writes to it and renames it onto `final_path`.
pub fn open_temp_file(final_path: &Path) -> io::Result<(File, PathBuf)> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = PathBuf::from(format!(
        "{}.{}.{}.{}",
        final_path.display(),
        std::process::id(),
        nanos,
        unique
    ));
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;
    Ok((file, temp_path))
}

/// Write `data` to `path` via a temp file and atomic rename.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let (mut file, temp_path) = open_temp_file(path)?;
    let result = file.write_all(data).and_then(|_| file.flush());
    drop(file);
    match result {
        Ok(()) => fs::rename(&temp_path, path),
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

/// Replace the extension of `file_name` (everything after the last dot) with
/// `new_ext`, which should include the leading dot.
pub fn replace_file_ext(file_name: &str, new_ext: &str) -> String {
    match file_name.rfind('.') {
        Some(dot) if !file_name[dot..].contains('/') => {
            format!("{}{}", &file_name[..dot], new_ext)
        }
        _ => format!("{file_name}{new_ext}"),
    }
}
