//! Worker server state and TCP accept loop.

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;

use crate::clients::ClientsStorage;
use crate::config::WorkerConfig;
use crate::file_cache::prepare_empty_dir;
use crate::launcher::CompilerLauncher;
use crate::obj_cache::ObjFileCache;
use crate::src_cache::SrcFileCache;
use crate::sync::QuitSignal;

/// Everything one worker process owns. In production one such process runs
/// per physical node (a shard); daemons pick the shard by input basename.
pub struct NoccServer {
    pub clients: ClientsStorage,
    pub launcher: Arc<CompilerLauncher>,
    pub src_cache: SrcFileCache,
    pub obj_cache: Arc<ObjFileCache>,
    pub quit: Arc<QuitSignal>,
    listen_addr: String,
}

impl NoccServer {
    /// Build the server: wipe and recreate the cache directories (no cache
    /// survives a restart), then wire up the components.
    pub fn new(config: &WorkerConfig) -> Result<Arc<Self>, String> {
        let clients_dir = prepare_empty_dir(&config.src_cache_dir, "clients")
            .map_err(|e| format!("can't prepare clients dir: {e}"))?;
        let src_cache_dir = prepare_empty_dir(&config.src_cache_dir, "src-cache")
            .map_err(|e| format!("can't prepare src-cache dir: {e}"))?;
        let obj_cache_dir = prepare_empty_dir(&config.obj_cache_dir, "obj-cache")
            .map_err(|e| format!("can't prepare obj-cache dir: {e}"))?;
        let obj_tmp_dir = prepare_empty_dir(&config.obj_cache_dir, "compiler-out")
            .map_err(|e| format!("can't prepare compiler-out dir: {e}"))?;

        let src_cache = SrcFileCache::new(&src_cache_dir, config.src_cache_size)
            .map_err(|e| format!("can't init src cache: {e}"))?;
        let obj_cache = ObjFileCache::new(&obj_cache_dir, &obj_tmp_dir, config.obj_cache_size)
            .map_err(|e| format!("can't init obj cache: {e}"))?;

        Ok(Arc::new(Self {
            clients: ClientsStorage::new(
                &clients_dir,
                &config.compiler_dirs,
                &obj_cache_dir,
                config.sandbox_mounts,
            ),
            launcher: Arc::new(CompilerLauncher::new(config.compiler_queue_size)),
            src_cache,
            obj_cache: Arc::new(obj_cache),
            quit: Arc::new(QuitSignal::new()),
            listen_addr: config.listen_addr.clone(),
        }))
    }

    /// Bind and serve until quit. Each connection gets its own thread; the
    /// role of a connection (control/upload/recv) is decided by its first
    /// frame.
    pub fn start_listening(self: &Arc<Self>) -> Result<(), String> {
        let listener = TcpListener::bind(&self.listen_addr)
            .map_err(|e| format!("can't listen on {}: {e}", self.listen_addr))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("can't read listen address: {e}"))?;

        // wake the accept loop when quit is signalled
        {
            let server = Arc::clone(self);
            std::thread::spawn(move || {
                while !server.quit.wait_timeout(std::time::Duration::from_secs(3600)) {}
                let _ = TcpStream::connect(local_addr);
            });
        }

        tracing::info!("nocc-server started on {}", self.listen_addr);

        for stream in listener.incoming() {
            if self.quit.is_quit() {
                break;
            }
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(self);
                    std::thread::spawn(move || crate::service::handle_connection(server, stream));
                }
                Err(e) => tracing::error!("accept error: {e}"),
            }
        }
        Ok(())
    }

    /// Stop accepting, cancel all clients. Cache directories stay; the next
    /// start wipes them.
    pub fn quit_gracefully(&self) {
        if self.quit.is_quit() {
            return;
        }
        tracing::info!("graceful stop...");
        self.quit.quit();
        self.clients.stop_all_clients();
    }

    pub fn stats_line(&self) -> String {
        format!(
            "clients {}, sessions {}, src-cache {} files / {} bytes, obj-cache {} files / {} bytes",
            self.clients.active_count(),
            self.clients.active_sessions_count(),
            self.src_cache.count(),
            self.src_cache.total_bytes(),
            self.obj_cache.count(),
            self.obj_cache.total_bytes()
        )
    }
}

/// Test-oriented constructor: everything under one temp root, no sandbox.
pub fn test_server(root: &Path) -> Arc<NoccServer> {
    let config = WorkerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        src_cache_dir: root.join("cpp"),
        obj_cache_dir: root.join("obj"),
        sandbox_mounts: false,
        ..Default::default()
    };
    match NoccServer::new(&config) {
        Ok(server) => server,
        Err(e) => panic!("can't build test server: {e}"),
    }
}
