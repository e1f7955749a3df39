//! Per-client state on the worker: the mirrored file tree and the file-state
//! machine.
//!
//! One [`Client`] per connected daemon, identified by an opaque clientID.
//! Each dependency the client ever advertised becomes a [`ClientFile`] with a
//! CAS-driven state machine; a path is unique per client and its digest may
//! never change (a mismatch is a build invariant violation and rejects the
//! session). Idle clients are purged by cron.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use nocc_protocol::{FileMetadata, RpcError, RpcErrorCode, Sha256Digest};

use crate::mounts::{self, MountSet};
use crate::session::Session;

/// Buffered capacity of the ready-sessions queue.
const READY_SESSIONS_DEPTH: usize = 200;

/// Clients idle longer than this are purged.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Base allowance for upload-hang detection, plus time per byte at the
/// slowest supported bandwidth (100 KiB/s).
const UPLOAD_HANG_BASE: Duration = Duration::from_secs(5);
const UPLOAD_HANG_BYTES_PER_SEC: u64 = 100 * 1024;

/// State machine of one mirrored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileState {
    JustCreated = 0,
    Uploading = 1,
    Uploaded = 2,
    UploadError = 3,
    PchCompiling = 4,
    PchCompiled = 5,
    PchCompileError = 6,
}

impl FileState {
    fn from_u32(value: u32) -> FileState {
        match value {
            0 => FileState::JustCreated,
            1 => FileState::Uploading,
            2 => FileState::Uploaded,
            3 => FileState::UploadError,
            4 => FileState::PchCompiling,
            5 => FileState::PchCompiled,
            _ => FileState::PchCompileError,
        }
    }
}

/// One dependency file inside a client's mirror directory.
#[derive(Debug)]
pub struct ClientFile {
    /// The path as the client sees it (absolute on the client).
    pub client_file_name: String,
    /// Where it lives in the mirror.
    pub server_file_name: PathBuf,
    pub file_size: i64,
    pub sha256: Sha256Digest,
    state: AtomicU32,
    upload_started_at: Mutex<Instant>,
}

impl ClientFile {
    pub fn state(&self) -> FileState {
        FileState::from_u32(self.state.load(Ordering::SeqCst))
    }

    /// Atomic transition; every waiter observes it on the next sweep.
    pub fn compare_and_swap(&self, from: FileState, to: FileState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn set_state(&self, to: FileState) {
        self.state.store(to as u32, Ordering::SeqCst);
    }

    pub fn mark_upload_started(&self) {
        *self
            .upload_started_at
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    /// An upload stuck longer than its size warrants is re-requested by the
    /// next session needing this file.
    pub fn is_upload_hanging(&self) -> bool {
        if self.state() != FileState::Uploading {
            return false;
        }
        let started = *self
            .upload_started_at
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let allowance = UPLOAD_HANG_BASE
            + Duration::from_secs(self.file_size.max(0) as u64 / UPLOAD_HANG_BYTES_PER_SEC);
        started.elapsed() > allowance
    }
}

pub struct Client {
    pub client_id: String,
    /// Mirror root; client path `/a/b.h` lives at `<working_dir>/a/b.h`.
    pub working_dir: PathBuf,

    last_seen: Mutex<Instant>,
    files: Mutex<HashMap<String, Arc<ClientFile>>>,
    /// Mirror subdirectories already created, to skip redundant mkdirs.
    dirs: Mutex<HashSet<PathBuf>>,
    sessions: Mutex<HashMap<u32, Arc<Session>>>,

    ready_tx: SyncSender<Arc<Session>>,
    ready_rx: Mutex<Receiver<Arc<Session>>>,
    disconnected: AtomicBool,
}

impl Client {
    fn new(client_id: &str, working_dir: PathBuf) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::sync_channel(READY_SESSIONS_DEPTH);
        Arc::new(Self {
            client_id: client_id.to_string(),
            working_dir,
            last_seen: Mutex::new(Instant::now()),
            files: Mutex::new(HashMap::with_capacity(1024)),
            dirs: Mutex::new(HashSet::with_capacity(100)),
            sessions: Mutex::new(HashMap::with_capacity(20)),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn map_client_path_to_server_abs(&self, client_path: &str) -> PathBuf {
        self.working_dir.join(client_path.trim_start_matches('/'))
    }

    /// Strip the mirror prefix for client-facing output.
    pub fn map_server_path_to_client(&self, text: &str) -> String {
        text.replace(&self.working_dir.to_string_lossy().into_owned(), "")
    }

    /// Register one advertised dependency, or return the already known file.
    /// A digest mismatch on a known path rejects the session.
    pub fn start_using_file(&self, meta: &FileMetadata) -> Result<Arc<ClientFile>, RpcError> {
        let mut files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = files.get(&meta.file_name) {
            if existing.sha256 != meta.sha256 {
                return Err(RpcError::new(
                    RpcErrorCode::SessionConflict,
                    format!(
                        "file {} was registered with a different sha256; \
                         a file may not change while a client is alive",
                        meta.file_name
                    ),
                ));
            }
            return Ok(Arc::clone(existing));
        }

        let file = Arc::new(ClientFile {
            client_file_name: meta.file_name.clone(),
            server_file_name: self.map_client_path_to_server_abs(&meta.file_name),
            file_size: meta.file_size,
            sha256: meta.sha256,
            state: AtomicU32::new(FileState::JustCreated as u32),
            upload_started_at: Mutex::new(Instant::now()),
        });
        files.insert(meta.file_name.clone(), Arc::clone(&file));
        Ok(file)
    }

    /// Create the mirror directory skeleton for every session file.
    pub fn mkdir_all_for_session(&self, session: &Session) {
        let mut dirs = self.dirs.lock().unwrap_or_else(|p| p.into_inner());
        for file in &session.files {
            if let Some(parent) = file.server_file_name.parent() {
                if dirs.insert(parent.to_path_buf()) {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::error!("can't create mirror dir {}: {e}", parent.display());
                    }
                }
            }
        }
    }

    pub fn register_session(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.insert(session.session_id, Arc::clone(session));
    }

    pub fn get_session(&self, session_id: u32) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.get(&session_id).cloned()
    }

    pub fn close_session(&self, session_id: u32) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.remove(&session_id);
    }

    /// Sessions that have not started their compiler yet; readiness sweeps
    /// re-check exactly these.
    pub fn sessions_not_started_compilation(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions
            .values()
            .filter(|s| !s.compilation_started())
            .cloned()
            .collect()
    }

    /// Queue a finished (or cache-hit) session for object delivery.
    pub fn push_ready_session(&self, session: Arc<Session>) {
        if self.ready_tx.send(session).is_err() {
            // receiver dropped only on client teardown
        }
    }

    /// Wait briefly for the next session ready for delivery.
    pub fn next_ready_session(&self, timeout: Duration) -> Option<Arc<Session>> {
        let ready_rx = self.ready_rx.lock().unwrap_or_else(|p| p.into_inner());
        ready_rx.recv_timeout(timeout).ok()
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn files_count(&self) -> usize {
        self.files.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn active_sessions_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// All active clients plus the mount/mirror plumbing they share.
pub struct ClientsStorage {
    table: RwLock<HashMap<String, Arc<Client>>>,
    clients_dir: PathBuf,
    ro_mounts: MountSet,
    rw_mounts: MountSet,
    sandbox_mounts: bool,
    last_purge: Mutex<Instant>,
}

impl ClientsStorage {
    pub fn new(
        clients_dir: &Path,
        compiler_dirs: &[PathBuf],
        obj_cache_dir: &Path,
        sandbox_mounts: bool,
    ) -> Self {
        Self {
            table: RwLock::new(HashMap::with_capacity(1024)),
            clients_dir: clients_dir.to_path_buf(),
            ro_mounts: mounts::default_ro_mounts(compiler_dirs),
            rw_mounts: MountSet::read_write(vec![obj_cache_dir.to_path_buf()]),
            sandbox_mounts,
            last_purge: Mutex::new(Instant::now()),
        }
    }

    pub fn get_client(&self, client_id: &str) -> Option<Arc<Client>> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.get(client_id).cloned()
    }

    /// StartClient: create the mirror. A duplicate ID means an interrupted
    /// daemon relaunched; the stale client is torn down first.
    pub fn on_client_connected(&self, client_id: &str) -> Result<Arc<Client>, String> {
        if let Some(stale) = self.get_client(client_id) {
            tracing::info!("client reconnected, re-creating: clientID {client_id}");
            self.delete_client(&stale);
        }

        let working_dir = self.clients_dir.join(client_id);
        std::fs::create_dir_all(&working_dir)
            .map_err(|e| format!("can't create client working directory: {e}"))?;

        if self.sandbox_mounts {
            self.ro_mounts.bind_into(&working_dir)?;
            self.rw_mounts.bind_into(&working_dir)?;
        }

        let client = Client::new(client_id, working_dir);
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        table.insert(client_id.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Tear down one client: drop it from the table, cancel its pending
    /// work, unmount and remove the mirror.
    pub fn delete_client(&self, client: &Arc<Client>) {
        {
            let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
            table.remove(&client.client_id);
        }
        client.mark_disconnected();

        if self.sandbox_mounts {
            self.ro_mounts.unbind_from(&client.working_dir);
            self.rw_mounts.unbind_from(&client.working_dir);
        }
        if let Err(e) = std::fs::remove_dir_all(&client.working_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(
                    "can't remove working dir {}: {e}",
                    client.working_dir.display()
                );
            }
        }
    }

    /// Cron task: purge clients idle beyond the timeout. Runs at most once
    /// a minute.
    pub fn delete_inactive_clients(&self) {
        {
            let mut last_purge = self.last_purge.lock().unwrap_or_else(|p| p.into_inner());
            if last_purge.elapsed() < Duration::from_secs(60) {
                return;
            }
            *last_purge = Instant::now();
        }

        loop {
            let inactive = {
                let table = self.table.read().unwrap_or_else(|p| p.into_inner());
                table
                    .values()
                    .find(|c| c.idle_for() > CLIENT_IDLE_TIMEOUT)
                    .cloned()
            };
            let Some(client) = inactive else { break };
            tracing::info!(
                "delete inactive client: clientID {}, {} files",
                client.client_id,
                client.files_count()
            );
            self.delete_client(&client);
        }
    }

    /// Graceful stop: cancel everything, keep mirrors on disk (the process
    /// is exiting anyway, and start wipes them).
    pub fn stop_all_clients(&self) {
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        for client in table.values() {
            client.mark_disconnected();
        }
        table.clear();
    }

    pub fn active_count(&self) -> usize {
        self.table.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn active_sessions_count(&self) -> usize {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.values().map(|c| c.active_sessions_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path) -> ClientsStorage {
        ClientsStorage::new(&dir.join("clients"), &[], &dir.join("obj-cache"), false)
    }

    fn meta(name: &str, contents: &[u8]) -> FileMetadata {
        FileMetadata {
            file_name: name.to_string(),
            file_size: contents.len() as i64,
            sha256: Sha256Digest::of_bytes(contents),
        }
    }

    #[test]
    fn test_client_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let client = storage.on_client_connected("abc").unwrap();
        assert!(client.working_dir.exists());
        assert_eq!(storage.active_count(), 1);

        storage.delete_client(&client);
        assert_eq!(storage.active_count(), 0);
        assert!(!client.working_dir.exists());
        assert!(client.is_disconnected());
    }

    #[test]
    fn test_duplicate_client_id_replaces_old() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let old = storage.on_client_connected("abc").unwrap();
        let new = storage.on_client_connected("abc").unwrap();
        assert!(old.is_disconnected());
        assert!(!new.is_disconnected());
        assert_eq!(storage.active_count(), 1);
    }

    #[test]
    fn test_file_registration_is_unique_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let client = storage.on_client_connected("abc").unwrap();

        let first = client.start_using_file(&meta("/home/u/a.h", b"v1")).unwrap();
        let again = client.start_using_file(&meta("/home/u/a.h", b"v1")).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(client.files_count(), 1);

        // same path, new digest: build invariant violation
        let conflict = client.start_using_file(&meta("/home/u/a.h", b"v2"));
        assert_eq!(conflict.unwrap_err().code, RpcErrorCode::SessionConflict);
    }

    #[test]
    fn test_client_path_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let client = storage.on_client_connected("abc").unwrap();

        let mapped = client.map_client_path_to_server_abs("/home/u/proj/foo.cpp");
        assert!(mapped.starts_with(&client.working_dir));
        assert!(mapped.ends_with("home/u/proj/foo.cpp"));

        let output = format!("{}/home/u/proj/foo.cpp:3: error", client.working_dir.display());
        assert_eq!(
            client.map_server_path_to_client(&output),
            "/home/u/proj/foo.cpp:3: error"
        );
    }

    #[test]
    fn test_file_state_cas() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let client = storage.on_client_connected("abc").unwrap();
        let file = client.start_using_file(&meta("/a.h", b"x")).unwrap();

        assert_eq!(file.state(), FileState::JustCreated);
        assert!(file.compare_and_swap(FileState::JustCreated, FileState::Uploading));
        // second CAS from the same state loses
        assert!(!file.compare_and_swap(FileState::JustCreated, FileState::Uploading));
        file.set_state(FileState::Uploaded);
        assert_eq!(file.state(), FileState::Uploaded);
    }

    #[test]
    fn test_upload_hang_detection() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let client = storage.on_client_connected("abc").unwrap();
        let file = client.start_using_file(&meta("/a.h", b"x")).unwrap();

        file.set_state(FileState::Uploading);
        file.mark_upload_started();
        // fresh upload of a small file is within its allowance
        assert!(!file.is_upload_hanging());

        // a non-uploading file never hangs
        file.set_state(FileState::Uploaded);
        assert!(!file.is_upload_hanging());
    }
}
