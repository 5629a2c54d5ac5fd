//! Clock access and shutdown-aware sleeping.
//!
//! Every parked wait in the agent goes through a [`ShutdownSignal`] so a
//! shutdown request wakes it immediately instead of waiting out the timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::util::lock;

/// Cooperative shutdown flag plus a condition variable to wake sleepers.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    lock:      Mutex<()>,
    cond:      Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Raise the flag and wake every thread parked in [`ShutdownSignal::wait_timeout`].
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _guard = lock(&self.lock);
        self.cond.notify_all();
    }

    /// Park for `timeout` or until shutdown is requested.
    ///
    /// Returns `true` if the full timeout elapsed, `false` if cut short.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.lock);
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            guard = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Source of wall-clock timestamps and interruptible sleeps.
pub trait TimingProvider: Send + Sync {
    /// Current timestamp in milliseconds since the Unix epoch.
    fn current_timestamp(&self) -> i64;

    /// Sleep for `duration`, waking early when `shutdown` is raised.
    ///
    /// Returns `false` if the sleep was cut short by shutdown.
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool;
}

/// [`TimingProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTiming;

impl TimingProvider for SystemTiming {
    fn current_timestamp(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        shutdown.wait_timeout(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_runs_to_completion_without_shutdown() {
        let signal = ShutdownSignal::new();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn shutdown_wakes_a_sleeper() {
        let signal = Arc::new(ShutdownSignal::new());
        let sleeper = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || SystemTiming.sleep(Duration::from_secs(30), &signal))
        };
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        signal.request();
        assert!(!sleeper.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn already_requested_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.request();
        assert!(!signal.wait_timeout(Duration::from_secs(30)));
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemTiming.current_timestamp() > 1_577_836_800_000);
    }
}
