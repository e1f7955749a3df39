//! Worker configuration.
//!
//! Read from a TOML file (default `/etc/nocc/server.conf`); every key has a
//! default so a missing file at the default path still starts a local worker.

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// TCP listen address, `host:port`.
    #[serde(alias = "ListenAddr")]
    pub listen_addr: String,
    /// Parent directory for uploaded sources: `<dir>/src-cache` plus
    /// `<dir>/clients` (the per-client mirrors). Wiped on start.
    #[serde(alias = "SrcCacheDir")]
    pub src_cache_dir: PathBuf,
    /// Parent directory for compiled objects: `<dir>/obj-cache` plus
    /// `<dir>/compiler-out` (the scratch dir). Wiped on start.
    #[serde(alias = "ObjCacheDir")]
    pub obj_cache_dir: PathBuf,
    /// Source cache limit in bytes.
    #[serde(alias = "SrcCacheSize")]
    pub src_cache_size: u64,
    /// Object cache limit in bytes.
    #[serde(alias = "ObjCacheSize")]
    pub obj_cache_size: u64,
    /// Max parallel compiler processes.
    #[serde(alias = "CompilerQueueSize")]
    pub compiler_queue_size: usize,
    /// Toolchain directories bind-mounted read-only into client mirrors.
    #[serde(alias = "CompilerDirs")]
    pub compiler_dirs: Vec<PathBuf>,
    #[serde(alias = "LogFileName")]
    pub log_file_name: String,
    #[serde(alias = "LogLevel")]
    pub log_level: i32,
    /// Bind-mount sandboxing of client mirrors; disable for unprivileged
    /// runs and tests.
    #[serde(alias = "SandboxMounts")]
    pub sandbox_mounts: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:43210".to_string(),
            src_cache_dir: PathBuf::from("/var/tmp/nocc/cpp"),
            obj_cache_dir: PathBuf::from("/var/tmp/nocc/obj"),
            src_cache_size: 8 * 1024 * 1024 * 1024,
            obj_cache_size: 4 * 1024 * 1024 * 1024,
            compiler_queue_size: num_cpus(),
            compiler_dirs: Vec::new(),
            log_file_name: "stderr".to_string(),
            log_level: 0,
            sandbox_mounts: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("can't parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl WorkerConfig {
    pub fn load(path: &Path, require: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !require => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}
