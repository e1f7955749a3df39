//! Concurrency primitives for the daemon and its connections.
//!
//! The daemon is a plain multi-threaded system: one thread per wrapper
//! connection, one per stream, a few periodic tasks. These small primitives
//! cover the coordination patterns used throughout: a counting semaphore for
//! compiler throttles, a countdown latch for upload/receive completion, and a
//! broadcast quit signal observed by every long-lived loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore sized at construction. `acquire` blocks while no
/// permit is free; the returned guard releases on drop.
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
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *permits -= 1;
        SemaphoreGuard { sem: self }
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut permits = self
            .sem
            .permits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *permits += 1;
        self.sem.cond.notify_one();
    }
}

/// Countdown latch: `add` raises the count, `done` lowers it, `wait` blocks
/// until it reaches zero. `force_release` zeroes the count so every waiter
/// returns (used when an invocation is force-interrupted).
pub struct WaitGroup {
    count: Mutex<i32>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn add(&self, n: i32) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *count += n;
    }

    pub fn done(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn force_release(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *count = 0;
        self.cond.notify_all();
    }

    pub fn pending(&self) -> i32 {
        *self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn wait(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *count > 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast shutdown flag. Periodic tasks sleep on `wait_timeout` so a quit
/// wakes them promptly instead of at the next tick.
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
        let guard = self
            .mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = self
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.is_quit()
    }
}

impl Default for QuitSignal {
    fn default() -> Self {
        Self::new()
    }
}
