//! Miscellaneous utilities: lock helpers, query encoding, thread ids.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use url::form_urlencoded;

// ── Locks ─────────────────────────────────────────────────────────────────────

/// Lock `m`, recovering the guard if another thread panicked while holding it.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Percent-encode a value for use inside a beacon record.
pub fn encode_value(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

// ── Threads ───────────────────────────────────────────────────────────────────

static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1);

thread_local! {
    static THREAD_ID: i32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small, stable per-thread number reported as the beacon's `it` field.
pub fn thread_id() -> i32 {
    THREAD_ID.with(|id| *id)
}

/// Convert a millisecond count that may be negative into a [`Duration`].
pub fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}
