//! Worker-side concurrency primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore: the compiler throttle. The worker never runs more
/// than `permits` compiler processes at once; excess sessions queue here.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().unwrap_or_else(|p| p.into_inner());
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap_or_else(|p| p.into_inner());
        }
        *permits -= 1;
        SemaphoreGuard { sem: self }
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut permits = self.sem.permits.lock().unwrap_or_else(|p| p.into_inner());
        *permits += 1;
        self.sem.cond.notify_one();
    }
}

/// Broadcast shutdown flag observed by the accept loop, stream handlers and
/// cron.
pub struct QuitSignal {
    flag: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn quit(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn is_quit(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`; returns true if quit was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_quit() {
            return true;
        }
        let guard = self.mutex.lock().unwrap_or_else(|p| p.into_inner());
        let _ = self
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|p| p.into_inner());
        self.is_quit()
    }
}

impl Default for QuitSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_semaphore_blocks_at_zero() {
        let sem = Arc::new(Semaphore::new(1));
        let guard = sem.acquire();

        let sem2 = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || {
            let _guard = sem2.acquire();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn test_quit_signal() {
        let quit = Arc::new(QuitSignal::new());
        assert!(!quit.wait_timeout(Duration::from_millis(1)));
        quit.quit();
        assert!(quit.wait_timeout(Duration::from_secs(60)));
    }
}
