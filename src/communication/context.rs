//! State shared between the sending state machine and the public API.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info};

use super::settings::ServerSettings;
use crate::protocol::{HttpClient, StatusResponse};
use crate::session::{Session, SessionRegistry};
use crate::timing::{ShutdownSignal, TimingProvider};
use crate::util::lock;

/// Interval between two time syncs while capturing.
pub const TIME_SYNC_INTERVAL_MS: i64 = 2 * 60 * 60 * 1000;

pub struct SendingContext {
    http:     Arc<dyn HttpClient>,
    timing:   Arc<dyn TimingProvider>,
    settings: Arc<ServerSettings>,
    sessions: Arc<SessionRegistry>,
    shutdown: ShutdownSignal,

    // ── Init completion ───────────────────────────────────────────────────────
    init:      Mutex<Option<bool>>,
    init_cond: Condvar,

    // ── Timestamps (ms) ───────────────────────────────────────────────────────
    last_status_check:      AtomicI64,
    last_open_session_send: AtomicI64,
    last_time_sync:         AtomicI64,

    current_state: Mutex<&'static str>,
}

impl SendingContext {
    pub fn new(
        http:     Arc<dyn HttpClient>,
        timing:   Arc<dyn TimingProvider>,
        settings: Arc<ServerSettings>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        SendingContext {
            http,
            timing,
            settings,
            sessions,
            shutdown:               ShutdownSignal::new(),
            init:                   Mutex::new(None),
            init_cond:              Condvar::new(),
            last_status_check:      AtomicI64::new(0),
            last_open_session_send: AtomicI64::new(0),
            last_time_sync:         AtomicI64::new(-1),
            current_state:          Mutex::new("Init"),
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    /// Sleep through the timing provider. `false` if shutdown cut it short.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.timing.sleep(duration, &self.shutdown)
    }

    pub fn current_timestamp(&self) -> i64 {
        self.timing.current_timestamp()
    }

    // ── Init completion ───────────────────────────────────────────────────────

    /// Record the outcome of initialization and wake all waiters.
    /// Only the first call has an effect.
    pub fn init_completed(&self, success: bool) {
        let mut init = lock(&self.init);
        if init.is_none() {
            *init = Some(success);
            info!("initialization completed, success={success}");
            self.init_cond.notify_all();
        }
    }

    /// Block until initialization completed or `timeout` elapsed.
    /// `None` waits indefinitely. Returns `true` only on successful init.
    pub fn wait_for_init(&self, timeout: Option<Duration>) -> bool {
        let mut init = lock(&self.init);
        let deadline = timeout.map(|t| Instant::now() + t);
        while init.is_none() {
            init = match deadline {
                None => self.init_cond.wait(init).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.init_cond
                        .wait_timeout(init, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        init.unwrap_or(false)
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.init).unwrap_or(false)
    }

    // ── Backend ───────────────────────────────────────────────────────────────

    pub fn http(&self) -> &dyn HttpClient {
        self.http.as_ref()
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn server_id(&self) -> i32 {
        self.settings.server_id()
    }

    pub fn is_capture_on(&self) -> bool {
        self.settings.is_capture_on()
    }

    /// Take over the backend's settings; drop all session data once the
    /// backend no longer wants it.
    pub fn handle_status_response(&self, resp: &StatusResponse) {
        self.settings.update(resp);
        if !self.is_capture_on() {
            self.clear_all_session_data();
        }
    }

    pub fn disable_capture(&self) {
        self.settings.set_capture(false);
        self.clear_all_session_data();
    }

    /// Delete cached data of every session and forget finished sessions.
    pub fn clear_all_session_data(&self) {
        for session in self.sessions.open_sessions() {
            session.beacon().clear_data();
        }
        for session in self.sessions.take_finished() {
            session.beacon().clear_data();
        }
        debug!("cleared all session data");
    }

    // ── Timestamps ────────────────────────────────────────────────────────────

    pub fn last_status_check_time(&self) -> i64 {
        self.last_status_check.load(Ordering::SeqCst)
    }

    pub fn set_last_status_check_time(&self, ts: i64) {
        self.last_status_check.store(ts, Ordering::SeqCst);
    }

    pub fn last_open_session_send_time(&self) -> i64 {
        self.last_open_session_send.load(Ordering::SeqCst)
    }

    pub fn set_last_open_session_send_time(&self, ts: i64) {
        self.last_open_session_send.store(ts, Ordering::SeqCst);
    }

    pub fn last_time_sync_time(&self) -> i64 {
        self.last_time_sync.load(Ordering::SeqCst)
    }

    pub fn set_last_time_sync_time(&self, ts: i64) {
        self.last_time_sync.store(ts, Ordering::SeqCst);
    }

    pub fn is_time_sync_required(&self) -> bool {
        let last = self.last_time_sync_time();
        last < 0 || self.current_timestamp() - last >= TIME_SYNC_INTERVAL_MS
    }

    pub fn send_interval_ms(&self) -> i64 {
        self.settings.send_interval_ms()
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn open_sessions(&self) -> Vec<Session> {
        self.sessions.open_sessions()
    }

    pub fn finished_sessions(&self) -> Vec<Session> {
        self.sessions.finished_sessions()
    }

    /// Drop a finished session together with whatever it still has cached.
    pub fn forget_finished_session(&self, session: &Session) {
        session.beacon().clear_data();
        self.sessions.remove_finished(session);
    }

    /// Push the session's cached records to the backend.
    pub fn send_session(&self, session: &Session) -> Option<StatusResponse> {
        session.beacon().send(self.http())
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    pub fn set_current_state(&self, name: &'static str) {
        *lock(&self.current_state) = name;
    }

    pub fn current_state(&self) -> &'static str {
        *lock(&self.current_state)
    }
}
