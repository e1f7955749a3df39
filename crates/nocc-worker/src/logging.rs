//! Worker logging setup.
//!
//! Same shape as the daemon's, plus SIGUSR1-driven log reopening for
//! external rotation: the writer holds the file behind a mutex and swaps it
//! when `reopen` is called (the cron task checks the signal flag).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Set by the SIGUSR1 handler, consumed by cron.
static REOPEN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn level_filter(log_level: i32) -> LevelFilter {
    match log_level {
        i32::MIN..=-1 => LevelFilter::WARN,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

enum LogSink {
    Stderr,
    File { file: File, path: PathBuf },
}

/// A `MakeWriter` whose file target can be reopened at runtime.
#[derive(Clone)]
pub struct LogWriter {
    sink: Arc<Mutex<LogSink>>,
}

impl LogWriter {
    fn stderr() -> Self {
        Self {
            sink: Arc::new(Mutex::new(LogSink::Stderr)),
        }
    }

    fn file(path: PathBuf) -> io::Result<Self> {
        let file = open_log_file(&path)?;
        Ok(Self {
            sink: Arc::new(Mutex::new(LogSink::File { file, path })),
        })
    }

    /// Reopen the log file (no-op for stderr). Called after log rotation.
    pub fn reopen(&self) {
        let mut sink = self.sink.lock().unwrap_or_else(|p| p.into_inner());
        if let LogSink::File { file, path } = &mut *sink {
            match open_log_file(path) {
                Ok(new_file) => *file = new_file,
                Err(e) => eprintln!("can't reopen log file {}: {e}", path.display()),
            }
        }
    }
}

fn open_log_file(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct LogHandle {
    sink: Arc<Mutex<LogSink>>,
}

impl Write for LogHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sink = self.sink.lock().unwrap_or_else(|p| p.into_inner());
        match &mut *sink {
            LogSink::Stderr => io::stderr().write(buf),
            LogSink::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(|p| p.into_inner());
        match &mut *sink {
            LogSink::Stderr => io::stderr().flush(),
            LogSink::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogHandle;

    fn make_writer(&'a self) -> Self::Writer {
        LogHandle {
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Install the global subscriber; returns the writer handle for reopening.
pub fn init(log_file_name: &str, log_level: i32) -> io::Result<LogWriter> {
    let writer = if log_file_name.is_empty() || log_file_name == "stderr" {
        LogWriter::stderr()
    } else {
        LogWriter::file(PathBuf::from(log_file_name))?
    };

    tracing_subscriber::fmt()
        .with_max_level(level_filter(log_level))
        .with_writer(writer.clone())
        .with_ansi(false)
        .with_target(false)
        .init();

    Ok(writer)
}

/// Install the SIGUSR1 handler that requests a log reopen.
pub fn install_sigusr1_handler() {
    unsafe {
        libc::signal(libc::SIGUSR1, handle_sigusr1 as libc::sighandler_t);
    }
}

extern "C" fn handle_sigusr1(_sig: libc::c_int) {
    REOPEN_REQUESTED.store(true, Ordering::SeqCst);
}

/// True once per SIGUSR1 delivery.
pub fn take_reopen_request() -> bool {
    REOPEN_REQUESTED.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_swaps_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.log");
        let writer = LogWriter::file(path.clone()).unwrap();

        let mut handle = writer.make_writer();
        handle.write_all(b"before rotation\n").unwrap();

        // simulate rotation: move the file away, then reopen
        std::fs::rename(&path, dir.path().join("worker.log.1")).unwrap();
        writer.reopen();
        let mut handle = writer.make_writer();
        handle.write_all(b"after rotation\n").unwrap();

        let rotated = std::fs::read_to_string(dir.path().join("worker.log.1")).unwrap();
        let fresh = std::fs::read_to_string(&path).unwrap();
        assert!(rotated.contains("before"));
        assert!(fresh.contains("after"));
    }

    #[test]
    fn test_reopen_request_flag() {
        assert!(!take_reopen_request());
        REOPEN_REQUESTED.store(true, Ordering::SeqCst);
        assert!(take_reopen_request());
        assert!(!take_reopen_request());
    }
}
