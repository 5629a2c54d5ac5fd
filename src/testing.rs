//! Deterministic stand-ins for the clock and the backend, used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::protocol::{HttpClient, StatusResponse, TimeSyncResponse};
use crate::timing::{ShutdownSignal, TimingProvider};
use crate::util::lock;

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Manually driven clock. Sleeping advances the clock instead of blocking.
#[derive(Debug, Default)]
pub struct ManualTiming {
    now:            AtomicI64,
    sleeps:         Mutex<Vec<Duration>>,
    /// Request shutdown on this (1-based) sleep call; 0 never does.
    shutdown_after: AtomicUsize,
}

impl ManualTiming {
    pub fn new(now: i64) -> Self {
        ManualTiming { now: AtomicI64::new(now), ..Default::default() }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Every sleep requested so far, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }

    /// Make the `n`-th sleep raise the shutdown signal and report interruption.
    pub fn shutdown_on_sleep(&self, n: usize) {
        self.shutdown_after.store(n, Ordering::SeqCst);
    }
}

impl TimingProvider for ManualTiming {
    fn current_timestamp(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        let count = {
            let mut sleeps = lock(&self.sleeps);
            sleeps.push(duration);
            sleeps.len()
        };
        if count == self.shutdown_after.load(Ordering::SeqCst) {
            shutdown.request();
        }
        if shutdown.is_requested() {
            return false;
        }
        self.advance(duration.as_millis() as i64);
        true
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

/// Backend returning queued responses. An exhausted queue yields the
/// fallback (`None` unless set), which reads as a failed request.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    status:           Mutex<VecDeque<Option<StatusResponse>>>,
    status_fallback:  Mutex<Option<StatusResponse>>,
    time_sync:        Mutex<VecDeque<Option<TimeSyncResponse>>>,
    beacon:           Mutex<VecDeque<Option<StatusResponse>>>,
    beacon_fallback:  Mutex<Option<StatusResponse>>,
    status_requests:  AtomicUsize,
    time_requests:    AtomicUsize,
    beacons:          Mutex<Vec<(i32, String, String)>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend answering every request with `capture on` defaults.
    pub fn always_ok() -> Self {
        let client = Self::default();
        *lock(&client.status_fallback) = Some(StatusResponse::default());
        *lock(&client.beacon_fallback) = Some(StatusResponse::default());
        client
    }

    pub fn push_status(&self, resp: Option<StatusResponse>) {
        lock(&self.status).push_back(resp);
    }

    pub fn push_time_sync(&self, resp: Option<TimeSyncResponse>) {
        lock(&self.time_sync).push_back(resp);
    }

    pub fn push_beacon(&self, resp: Option<StatusResponse>) {
        lock(&self.beacon).push_back(resp);
    }

    pub fn status_requests(&self) -> usize {
        self.status_requests.load(Ordering::SeqCst)
    }

    pub fn time_sync_requests(&self) -> usize {
        self.time_requests.load(Ordering::SeqCst)
    }

    /// `(server id, client ip, body)` of every beacon request, successful or not.
    pub fn beacons(&self) -> Vec<(i32, String, String)> {
        lock(&self.beacons).clone()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn send_status_request(&self, _server_id: i32) -> Option<StatusResponse> {
        self.status_requests.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.status).pop_front();
        scripted.unwrap_or_else(|| lock(&self.status_fallback).clone())
    }

    fn send_time_sync_request(&self, _server_id: i32) -> Option<TimeSyncResponse> {
        self.time_requests.fetch_add(1, Ordering::SeqCst);
        lock(&self.time_sync).pop_front().flatten()
    }

    fn send_beacon_request(
        &self,
        server_id: i32,
        client_ip: &str,
        data:      &[u8],
    ) -> Option<StatusResponse> {
        let body = String::from_utf8_lossy(data).into_owned();
        lock(&self.beacons).push((server_id, client_ip.to_string(), body));
        let scripted = lock(&self.beacon).pop_front();
        scripted.unwrap_or_else(|| lock(&self.beacon_fallback).clone())
    }
}
