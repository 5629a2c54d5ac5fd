//! "Record added" wake-up shared between the cache write path and the evictor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::util::lock;

/// Work-pending flag guarded by a mutex, with a condition variable to wake
/// the eviction thread.
///
/// Writers only hold the flag's mutex for the store + notify, never while
/// holding a cache entry lock, so they cannot deadlock against the evictor.
#[derive(Debug, Default)]
pub struct RecordAddedSignal {
    pending: Mutex<bool>,
    cond:    Condvar,
}

impl RecordAddedSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark work as pending and wake the waiter.
    pub fn notify(&self) {
        let mut pending = lock(&self.pending);
        *pending = true;
        self.cond.notify_all();
    }

    /// Wake the waiter without marking work as pending (used on shutdown).
    pub fn wake(&self) {
        let _guard = lock(&self.pending);
        self.cond.notify_all();
    }

    /// Block until work is pending or `shutdown` is raised, then clear the
    /// pending flag. Bursts of writes collapse into a single wake-up.
    pub fn wait(&self, shutdown: &AtomicBool) {
        let mut pending = lock(&self.pending);
        while !*pending && !shutdown.load(Ordering::SeqCst) {
            pending = self.cond.wait(pending).unwrap_or_else(PoisonError::into_inner);
        }
        *pending = false;
    }
}
