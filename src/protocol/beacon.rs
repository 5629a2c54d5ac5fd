//! Per-session serializer turning user actions and events into beacon
//! records, and pushing the session's cached records to the backend.
//!
//! A chunk sent to the backend is the session prefix followed by records:
//!
//! ```text
//! vv=3&va=1.0&ap=app-1&an=Shop&pt=1&tt=okrust&vi=7&sn=7&ip=10.0.0.1&os=linux&mf=&md=&tx=..&tv=..&mp=1
//!   &et=1&na=checkout&it=2&ca=1&pa=0&s0=1&t0=12&s1=4&t1=80
//!   &et=19&it=2&pa=0&s0=5&t0=95
//! ```

use std::fmt::{Display, Write as _};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::debug;

use super::http_client::{HttpClient, AGENT_TECHNOLOGY_TYPE};
use super::StatusResponse;
use crate::cache::BeaconCache;
use crate::communication::ServerSettings;
use crate::config::AgentConfig;
use crate::timing::TimingProvider;
use crate::util::{encode_value, thread_id};

/// Separator between prefix and records, and between two records.
pub const BEACON_DELIMITER: char = '&';

const PROTOCOL_VERSION:      i32 = 3;
const PLATFORM_TYPE_OPENKIT: i32 = 1;
/// Headroom kept below the backend's maximum beacon size.
const RESERVED_BEACON_BYTES: usize = 1024;

/// Record kinds, reported as `et`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Action      = 1,
    NamedEvent  = 10,
    ValueString = 11,
    ValueInt    = 12,
    ValueDouble = 13,
    SessionEnd  = 19,
    Error       = 40,
    Crash       = 50,
}

/// Timing of a finished action, as recorded when it is left.
#[derive(Debug, Clone, Copy)]
pub struct ActionRecord<'a> {
    pub id:             i32,
    pub parent_id:      i32,
    pub name:           &'a str,
    pub start_time:     i64,
    pub end_time:       i64,
    pub start_sequence: i32,
    pub end_sequence:   i32,
}

pub struct Beacon {
    session_number: i32,
    client_ip:      String,
    session_start:  i64,
    sequence:       AtomicI32,
    next_id:        AtomicI32,
    config:         Arc<AgentConfig>,
    cache:          Arc<BeaconCache>,
    settings:       Arc<ServerSettings>,
    timing:         Arc<dyn TimingProvider>,
}

impl Beacon {
    pub fn new(
        session_number: i32,
        client_ip:      &str,
        config:         Arc<AgentConfig>,
        cache:          Arc<BeaconCache>,
        settings:       Arc<ServerSettings>,
        timing:         Arc<dyn TimingProvider>,
    ) -> Self {
        let session_start = timing.current_timestamp();
        Beacon {
            session_number,
            client_ip: client_ip.to_string(),
            session_start,
            sequence: AtomicI32::new(0),
            next_id: AtomicI32::new(0),
            config,
            cache,
            settings,
            timing,
        }
    }

    pub fn session_number(&self) -> i32 {
        self.session_number
    }

    pub fn current_timestamp(&self) -> i64 {
        self.timing.current_timestamp()
    }

    /// Next action id within this session, starting at 1.
    pub fn create_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Next sequence number within this session, starting at 1.
    pub fn create_sequence_number(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn capturing(&self) -> bool {
        self.settings.is_capture_on()
    }

    // ── Recording ─────────────────────────────────────────────────────────────

    pub fn add_action(&self, action: &ActionRecord<'_>) {
        if !self.capturing() {
            return;
        }
        let mut data = self.base_data(EventType::Action, Some(action.name));
        append(&mut data, "ca", action.id);
        append(&mut data, "pa", action.parent_id);
        append(&mut data, "s0", action.start_sequence);
        append(&mut data, "t0", action.start_time - self.session_start);
        append(&mut data, "s1", action.end_sequence);
        append(&mut data, "t1", action.end_time - action.start_time);
        self.cache.add_action_data(self.session_number, action.start_time, data);
    }

    pub fn end_session(&self) {
        if !self.capturing() {
            return;
        }
        let timestamp = self.current_timestamp();
        let mut data = self.base_data(EventType::SessionEnd, None);
        self.append_event_position(&mut data, 0, timestamp);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    pub fn report_event(&self, parent_id: i32, name: &str) {
        self.add_event(EventType::NamedEvent, parent_id, name, |_| {});
    }

    pub fn report_value_int(&self, parent_id: i32, name: &str, value: i64) {
        self.add_event(EventType::ValueInt, parent_id, name, |d| append(d, "vl", value));
    }

    pub fn report_value_double(&self, parent_id: i32, name: &str, value: f64) {
        self.add_event(EventType::ValueDouble, parent_id, name, |d| append(d, "vl", value));
    }

    pub fn report_value_string(&self, parent_id: i32, name: &str, value: &str) {
        self.add_event(EventType::ValueString, parent_id, name, |d| {
            append(d, "vl", encode_value(value))
        });
    }

    pub fn report_error(&self, parent_id: i32, name: &str, code: i32, reason: &str) {
        if !self.settings.is_capture_errors() {
            return;
        }
        self.add_event(EventType::Error, parent_id, name, |d| {
            append(d, "ev", code);
            append(d, "rs", encode_value(reason));
        });
    }

    pub fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        if !self.settings.is_capture_crashes() {
            return;
        }
        self.add_event(EventType::Crash, 0, name, |d| {
            append(d, "rs", encode_value(reason));
            append(d, "st", encode_value(stacktrace));
        });
    }

    fn add_event(&self, event: EventType, parent_id: i32, name: &str, extra: impl FnOnce(&mut String)) {
        if !self.capturing() {
            return;
        }
        let timestamp = self.current_timestamp();
        let mut data = self.base_data(event, Some(name));
        self.append_event_position(&mut data, parent_id, timestamp);
        extra(&mut data);
        self.cache.add_event_data(self.session_number, timestamp, data);
    }

    fn base_data(&self, event: EventType, name: Option<&str>) -> String {
        let mut data = String::with_capacity(96);
        append(&mut data, "et", event as i32);
        if let Some(name) = name {
            append(&mut data, "na", encode_value(name));
        }
        append(&mut data, "it", thread_id());
        data
    }

    fn append_event_position(&self, data: &mut String, parent_id: i32, timestamp: i64) {
        append(data, "pa", parent_id);
        append(data, "s0", self.create_sequence_number());
        append(data, "t0", timestamp - self.session_start);
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Session and device data heading every chunk.
    pub fn chunk_prefix(&self) -> String {
        let device = self.config.device_config();
        let mut prefix = String::with_capacity(256);
        append(&mut prefix, "vv", PROTOCOL_VERSION);
        append(&mut prefix, "va", encode_value(&self.config.application_version));
        append(&mut prefix, "ap", encode_value(&self.config.application_id));
        append(&mut prefix, "an", encode_value(&self.config.application_name));
        append(&mut prefix, "pt", PLATFORM_TYPE_OPENKIT);
        append(&mut prefix, "tt", AGENT_TECHNOLOGY_TYPE);
        append(&mut prefix, "vi", self.session_number);
        append(&mut prefix, "sn", self.session_number);
        append(&mut prefix, "ip", encode_value(&self.client_ip));
        append(&mut prefix, "os", encode_value(&device.operating_system));
        append(&mut prefix, "mf", encode_value(&device.manufacturer));
        append(&mut prefix, "md", encode_value(&device.model));
        append(&mut prefix, "tx", self.settings.to_cluster_time(self.current_timestamp()));
        append(&mut prefix, "tv", self.settings.to_cluster_time(self.session_start));
        append(&mut prefix, "mp", self.settings.multiplicity());
        prefix
    }

    /// Send every cached record of this session, chunk by chunk.
    ///
    /// Acknowledged chunks are dropped from the cache; on the first failed
    /// request the chunk is released for a later attempt and sending stops.
    /// Returns the last status response received, if any.
    pub fn send(&self, http: &dyn HttpClient) -> Option<StatusResponse> {
        let prefix = self.chunk_prefix();
        let max_size = self.settings.max_beacon_size().saturating_sub(RESERVED_BEACON_BYTES);
        let mut response = None;

        loop {
            let chunk = match self.cache.next_chunk(self.session_number, &prefix, max_size, BEACON_DELIMITER) {
                Some(chunk) if !chunk.is_empty() => chunk,
                _ => return response,
            };

            match http.send_beacon_request(self.settings.server_id(), &self.client_ip, chunk.as_bytes()) {
                Some(resp) => {
                    self.cache.acknowledge_chunk(self.session_number);
                    response = Some(resp);
                }
                None => {
                    debug!("beacon {}: sending chunk failed, keeping data", self.session_number);
                    self.cache.release_chunk(self.session_number);
                    return response;
                }
            }
        }
    }

    /// Drop everything cached for this session.
    pub fn clear_data(&self) {
        self.cache.delete_entry(self.session_number);
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty(self.session_number)
    }
}

fn append(buf: &mut String, key: &str, value: impl Display) {
    if !buf.is_empty() {
        buf.push(BEACON_DELIMITER);
    }
    // writing into a String cannot fail
    let _ = write!(buf, "{key}={value}");
}
