//! Worker-side session: one remote invocation, from dependency registration
//! to object delivery.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nocc_protocol::{RpcError, Sha256Digest, StartCompilationSessionRequest};

use crate::clients::{Client, ClientFile};
use crate::obj_cache::make_obj_cache_key;

/// Flags whose file/dir argument is a client path the worker must remap
/// into the mirror (and exclude from the object-cache key).
const INCLUDE_ARG_KEYS: [&str; 5] = ["-I", "-iquote", "-isystem", "-include-pch", "-include"];

/// Mirrored result of the compiler run (or of the cache hit).
#[derive(Debug, Clone, Default)]
pub struct SessionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i32,
}

pub struct Session {
    pub session_id: u32,
    /// Input file as sent by the client (absolute client path).
    pub input_file: String,
    /// Where the object lives: the scratch dir after a compile, or directly
    /// inside the object cache on a hit.
    pub output_file: Mutex<PathBuf>,
    pub compiler_name: String,
    /// Full canonicalized argument list as received (include args and all).
    pub compiler_args: Vec<String>,

    /// Every dependency, in request order; the PCH sidecar (when present) is
    /// the last entry, so upload indexes cover it too.
    pub files: Vec<Arc<ClientFile>>,
    pub pch_file: Option<Arc<ClientFile>>,

    pub obj_cache_key: Sha256Digest,
    pub obj_cache_exists: AtomicBool,
    compilation_started: AtomicBool,

    pub result: Mutex<SessionResult>,
}

impl Session {
    /// Register every dependency with the client and compute the cache key.
    /// The only failure is a digest conflict on a known path.
    pub fn create(
        request: &StartCompilationSessionRequest,
        client: &Client,
    ) -> Result<Arc<Session>, RpcError> {
        let mut files = Vec::with_capacity(request.required_files.len() + 1);
        for meta in &request.required_files {
            files.push(client.start_using_file(meta)?);
        }
        let pch_file = match &request.required_pch_file {
            Some(meta) => {
                let file = client.start_using_file(meta)?;
                files.push(Arc::clone(&file));
                Some(file)
            }
            None => None,
        };

        let (_include_args, key_args) = split_include_args(&request.compiler_args);
        let deps: Vec<(Sha256Digest, i64)> =
            files.iter().map(|f| (f.sha256, f.file_size)).collect();
        let obj_cache_key =
            make_obj_cache_key(&request.compiler, &key_args, &deps, &request.input_file);

        Ok(Arc::new(Session {
            session_id: request.session_id,
            input_file: request.input_file.clone(),
            output_file: Mutex::new(PathBuf::new()),
            compiler_name: request.compiler.clone(),
            compiler_args: request.compiler_args.clone(),
            files,
            pch_file,
            obj_cache_key,
            obj_cache_exists: AtomicBool::new(false),
            compilation_started: AtomicBool::new(false),
            result: Mutex::new(SessionResult::default()),
        }))
    }

    /// Claim the right to run the compiler; at most one caller wins, ever.
    pub fn try_start_compilation(&self) -> bool {
        !self.compilation_started.swap(true, Ordering::SeqCst)
    }

    pub fn compilation_started(&self) -> bool {
        self.compilation_started.load(Ordering::SeqCst)
    }

    pub fn set_output_file(&self, path: PathBuf) {
        *self.output_file.lock().unwrap_or_else(|p| p.into_inner()) = path;
    }

    pub fn output_file(&self) -> PathBuf {
        self.output_file
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_result(&self, result: SessionResult) {
        *self.result.lock().unwrap_or_else(|p| p.into_inner()) = result;
    }

    pub fn result(&self) -> SessionResult {
        self.result.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Split the canonicalized argument list into include-path pairs and the
/// rest. Include args arrive in the guaranteed `flag value` (optionally
/// `flag -Xclang value`) form the daemon produces; the pairs are remapped
/// into the mirror for execution and excluded from the object-cache key.
pub fn split_include_args(compiler_args: &[String]) -> (Vec<(Vec<String>, String)>, Vec<String>) {
    let mut include_args: Vec<(Vec<String>, String)> = Vec::new();
    let mut rest: Vec<String> = Vec::with_capacity(compiler_args.len());

    let mut i = 0;
    while i < compiler_args.len() {
        let arg = &compiler_args[i];
        if INCLUDE_ARG_KEYS.contains(&arg.as_str()) {
            let mut prefix = vec![arg.clone()];
            let mut j = i + 1;
            if compiler_args.get(j).map(String::as_str) == Some("-Xclang") {
                prefix.push("-Xclang".to_string());
                j += 1;
            }
            match compiler_args.get(j) {
                Some(value) => {
                    include_args.push((prefix, value.clone()));
                    i = j + 1;
                }
                None => {
                    // malformed tail; keep it verbatim
                    rest.push(arg.clone());
                    i += 1;
                }
            }
        } else {
            rest.push(arg.clone());
            i += 1;
        }
    }

    (include_args, rest)
}
