//! nocc: distributed C/C++ compilation cache and dispatcher, client side.
//!
//! A thin wrapper (`nocc`) replaces the compiler in a build system and pipes
//! every invocation to a long-running local daemon (`nocc-daemon`) over a
//! unix socket. The daemon classifies each command line, discovers
//! dependencies, and ships eligible compilations to remote workers that keep
//! content-addressed caches, so identical inputs compile at most once
//! globally. Anything it can't ship runs locally behind a bounded queue.

pub mod config;
pub mod daemon;
pub mod depfile;
pub mod includes;
pub mod invocation;
pub mod localexec;
pub mod logging;
pub mod sync;
pub mod wrapper;

pub use config::DaemonConfig;
pub use daemon::{Daemon, DaemonUnixSockListener};
pub use depfile::DepCmdFlags;
pub use includes::{CollectedDeps, IncludedFile, IncludesCache};
pub use invocation::{Invocation, InvokeType};

/// Version reported by `-version` and sent to workers on StartClient.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable overriding the daemon socket path (wrapper side).
pub const SOCKET_PATH_ENV: &str = "NOCC_SOCKET";

/// Default unix socket path, matching the daemon's config default.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/nocc-daemon.sock";
