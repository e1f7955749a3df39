//! Bind-mount sandboxing of client mirror directories.
//!
//! The compiler runs with its cwd inside a client's mirror; bind mounts make
//! system libraries and the toolchain visible there read-only, and the
//! object-cache directory read-write. Mounts are established at client
//! creation and removed at teardown.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Directories every compilation needs, mounted read-only. `/bin` and `/lib`
/// are assumed to be the usual symlinks into `/usr`.
const DEFAULT_RO_DIRS: [&str; 3] = ["/lib", "/bin", "/etc"];

pub struct MountSet {
    paths: Vec<PathBuf>,
    options: &'static str,
}

pub fn default_ro_mounts(compiler_dirs: &[PathBuf]) -> MountSet {
    let mut paths: Vec<PathBuf> = DEFAULT_RO_DIRS.iter().map(PathBuf::from).collect();
    paths.extend(compiler_dirs.iter().cloned());
    MountSet {
        paths,
        options: "ro",
    }
}

impl MountSet {
    pub fn read_write(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            options: "rw",
        }
    }

    /// Bind every source path to `<working_dir>/<source>`. On failure the
    /// already established mounts are rolled back.
    pub fn bind_into(&self, working_dir: &Path) -> Result<(), String> {
        let mut mounted: Vec<PathBuf> = Vec::with_capacity(self.paths.len());
        for source in &self.paths {
            let target = join_under(working_dir, source);
            if let Err(e) = std::fs::create_dir_all(&target) {
                unmount_all(working_dir, &mounted);
                return Err(format!("failed to create mount directory {}: {e}", target.display()));
            }
            if let Err(e) = bind_mount(source, &target, self.options) {
                unmount_all(working_dir, &mounted);
                return Err(e);
            }
            mounted.push(source.clone());
        }
        Ok(())
    }

    pub fn unbind_from(&self, working_dir: &Path) {
        unmount_all(working_dir, &self.paths);
    }
}

fn join_under(working_dir: &Path, source: &Path) -> PathBuf {
    working_dir.join(
        source
            .to_string_lossy()
            .trim_start_matches('/'),
    )
}

fn bind_mount(source: &Path, target: &Path, options: &str) -> Result<(), String> {
    let status = Command::new("mount")
        .arg("--bind")
        .arg("-o")
        .arg(options)
        .arg(source)
        .arg(target)
        .status()
        .map_err(|e| format!("can't run mount: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!(
            "failed to bind mount {} on {}",
            source.display(),
            target.display()
        ))
    }
}

fn unmount_all(working_dir: &Path, sources: &[PathBuf]) {
    for source in sources {
        let target = join_under(working_dir, source);
        let status = Command::new("umount").arg(&target).status();
        match status {
            Ok(s) if s.success() => {}
            _ => tracing::error!("failed to unmount {}", target.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ro_set_includes_compiler_dirs() {
        let set = default_ro_mounts(&[PathBuf::from("/usr/lib/gcc")]);
        assert_eq!(set.options, "ro");
        assert!(set.paths.contains(&PathBuf::from("/etc")));
        assert!(set.paths.contains(&PathBuf::from("/usr/lib/gcc")));
    }

    #[test]
    fn test_join_under_strips_leading_slash() {
        let target = join_under(Path::new("/clients/abc"), Path::new("/usr/lib"));
        assert_eq!(target, PathBuf::from("/clients/abc/usr/lib"));
    }
}
