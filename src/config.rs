//! Daemon configuration.
//!
//! Read from a TOML file (default `/etc/nocc/daemon.conf`). Every key has a
//! default, so a missing file at the default path yields a usable local
//! configuration; an explicitly passed path must exist.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

/// Number of CPUs, used as the default compiler queue depth.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Client identity presented to workers; empty means "generate one per
    /// daemon launch" (a fresh daemon is a fresh client to every worker).
    #[serde(alias = "ClientID")]
    pub client_id: String,
    /// Optional SOCKS5 proxy `host:port` for all worker connections.
    #[serde(alias = "SocksProxyAddr")]
    pub socks_proxy_addr: String,
    /// Parallel local compiler processes; 0 disables local fallback.
    #[serde(alias = "CompilerQueueSize")]
    pub compiler_queue_size: usize,
    /// Worker addresses, `host:port`.
    #[serde(alias = "Servers")]
    pub servers: Vec<String>,
    #[serde(alias = "LogFileName")]
    pub log_file_name: String,
    #[serde(alias = "LogLevel")]
    pub log_level: i32,
    /// Seconds before an in-flight invocation is force-errored.
    #[serde(alias = "InvocationTimeout")]
    pub invocation_timeout: u64,
    /// Seconds allowed for connection setup and unary session calls.
    #[serde(alias = "ConnectionTimeout")]
    pub connection_timeout: u64,
    /// Unix socket the wrapper connects to.
    #[serde(alias = "SocketPath")]
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            socks_proxy_addr: String::new(),
            compiler_queue_size: num_cpus(),
            servers: vec!["localhost:43210".to_string()],
            log_file_name: "stderr".to_string(),
            log_level: 0,
            invocation_timeout: 10 * 60,
            connection_timeout: 15,
            socket_path: "/tmp/nocc-daemon.sock".to_string(),
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

impl DaemonConfig {
    /// Load from `path`. When `require` is false a missing file falls back
    /// to defaults (the default config path is optional; an explicit
    /// `--config` is not).
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

    /// The clientID for this launch: the configured one, or a random 8-char
    /// string so a restarted daemon registers as a new client.
    pub fn effective_client_id(&self) -> String {
        if !self.client_id.is_empty() {
            return self.client_id.clone();
        }
        generate_client_id()
    }
}

fn generate_client_id() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
        ^ ((std::process::id() as u64) << 32);

    let mut id = String::with_capacity(8);
    for _ in 0..8 {
        // xorshift64 keeps this dependency-free and good enough for an ID
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        id.push(LETTERS[(seed % LETTERS.len() as u64) as usize] as char);
    }
    id
}
