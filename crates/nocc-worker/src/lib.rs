//! nocc worker (`nocc-server`): serves compilation sessions for many
//! daemons.
//!
//! Per client it mirrors the advertised file tree, restores known files from
//! the content-addressed source cache, runs the real compiler behind a
//! bounded throttle inside a bind-mount sandbox, and keys compiled objects
//! so that identical inputs (across clients, branches and rebuilds) compile
//! at most once per worker lifetime. Nothing persists across a restart:
//! both caches are wiped at start.

pub mod clients;
pub mod config;
pub mod cron;
pub mod file_cache;
pub mod launcher;
pub mod logging;
pub mod mounts;
pub mod obj_cache;
pub mod server;
pub mod service;
pub mod session;
pub mod src_cache;
pub mod sync;

pub use clients::{Client, ClientFile, ClientsStorage, FileState};
pub use config::WorkerConfig;
pub use file_cache::FileCache;
pub use launcher::CompilerLauncher;
pub use obj_cache::{make_obj_cache_key, ObjFileCache};
pub use server::NoccServer;
pub use session::{Session, SessionResult};
pub use src_cache::SrcFileCache;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
