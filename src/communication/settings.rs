//! Backend-controlled settings shared by the sender thread and every beacon.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};

use log::debug;

use crate::protocol::StatusResponse;

/// Send interval for open sessions until the backend sends its own.
pub const DEFAULT_SEND_INTERVAL_MS: i64 = 2 * 60 * 1000;
/// Maximum beacon size until the backend sends its own.
pub const DEFAULT_MAX_BEACON_SIZE:  usize = 30 * 1024;

/// Settings last received from the backend.
///
/// Written only by the sending thread; read lock-free from application
/// threads when recording data.
#[derive(Debug)]
pub struct ServerSettings {
    capture:             AtomicBool,
    capture_errors:      AtomicBool,
    capture_crashes:     AtomicBool,
    multiplicity:        AtomicI32,
    server_id:           AtomicI32,
    send_interval_ms:    AtomicI64,
    max_beacon_size:     AtomicUsize,
    cluster_time_offset: AtomicI64,
}

impl ServerSettings {
    /// Capturing is on until the backend says otherwise.
    pub fn new(server_id: i32) -> Self {
        ServerSettings {
            capture:             AtomicBool::new(true),
            capture_errors:      AtomicBool::new(true),
            capture_crashes:     AtomicBool::new(true),
            multiplicity:        AtomicI32::new(1),
            server_id:           AtomicI32::new(server_id),
            send_interval_ms:    AtomicI64::new(DEFAULT_SEND_INTERVAL_MS),
            max_beacon_size:     AtomicUsize::new(DEFAULT_MAX_BEACON_SIZE),
            cluster_time_offset: AtomicI64::new(0),
        }
    }

    pub fn is_capture_on(&self) -> bool {
        self.capture.load(Ordering::SeqCst)
    }

    pub fn set_capture(&self, capture: bool) {
        self.capture.store(capture, Ordering::SeqCst);
    }

    pub fn is_capture_errors(&self) -> bool {
        self.capture_errors.load(Ordering::SeqCst)
    }

    pub fn is_capture_crashes(&self) -> bool {
        self.capture_crashes.load(Ordering::SeqCst)
    }

    pub fn multiplicity(&self) -> i32 {
        self.multiplicity.load(Ordering::SeqCst)
    }

    pub fn server_id(&self) -> i32 {
        self.server_id.load(Ordering::SeqCst)
    }

    pub fn send_interval_ms(&self) -> i64 {
        self.send_interval_ms.load(Ordering::SeqCst)
    }

    pub fn max_beacon_size(&self) -> usize {
        self.max_beacon_size.load(Ordering::SeqCst)
    }

    pub fn cluster_time_offset(&self) -> i64 {
        self.cluster_time_offset.load(Ordering::SeqCst)
    }

    pub fn set_cluster_time_offset(&self, offset: i64) {
        self.cluster_time_offset.store(offset, Ordering::SeqCst);
    }

    /// Convert a local timestamp into backend cluster time.
    pub fn to_cluster_time(&self, local: i64) -> i64 {
        local.saturating_add(self.cluster_time_offset())
    }

    /// Apply a status response. A multiplicity of zero switches capturing off;
    /// the remaining values are only taken over while capturing is on.
    pub fn update(&self, resp: &StatusResponse) {
        let capture = resp.capture && resp.multiplicity > 0;
        self.capture.store(capture, Ordering::SeqCst);
        self.multiplicity.store(resp.multiplicity, Ordering::SeqCst);

        if capture {
            if let Some(id) = resp.server_id {
                self.server_id.store(id, Ordering::SeqCst);
            }
            if let Some(interval) = resp.send_interval_ms.filter(|i| *i > 0) {
                self.send_interval_ms.store(interval, Ordering::SeqCst);
            }
            if let Some(size) = resp.max_beacon_size.filter(|s| *s > 0) {
                self.max_beacon_size.store(size, Ordering::SeqCst);
            }
            self.capture_errors.store(resp.capture_errors, Ordering::SeqCst);
            self.capture_crashes.store(resp.capture_crashes, Ordering::SeqCst);
        }

        debug!(
            "server settings: capture={capture} server_id={} multiplicity={} send_interval={}ms",
            self.server_id(),
            resp.multiplicity,
            self.send_interval_ms(),
        );
    }
}
