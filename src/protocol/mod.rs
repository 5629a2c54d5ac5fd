//! Beacon protocol: backend responses, HTTP transport and beacon serialization.
//!
//! Responses are flat `key=value` pairs joined by `&`:
//!
//! ```text
//! type=m&cp=1&id=5&mp=1&si=120&bl=30
//! type=mts&t1=1700000000123&t2=1700000000125
//! ```

pub mod beacon;
pub mod http_client;

use std::collections::HashMap;

pub use beacon::Beacon;
pub use http_client::{HttpClient, ReqwestHttpClient};

/// Parsed `type=m` response to a status or beacon request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    /// `cp`: whether the backend wants data at all.
    pub capture:          bool,
    /// `id`: server id to address in subsequent requests.
    pub server_id:        Option<i32>,
    /// `mp`: sampling divisor; `0` switches capturing off.
    pub multiplicity:     i32,
    /// `si`: send interval for open sessions, in milliseconds.
    pub send_interval_ms: Option<i64>,
    /// `bl`: maximum beacon size, in bytes.
    pub max_beacon_size:  Option<usize>,
    /// `er`
    pub capture_errors:   bool,
    /// `cr`
    pub capture_crashes:  bool,
    /// `bn`
    pub monitor_name:     Option<String>,
}

impl Default for StatusResponse {
    fn default() -> Self {
        StatusResponse {
            capture:          true,
            server_id:        None,
            multiplicity:     1,
            send_interval_ms: None,
            max_beacon_size:  None,
            capture_errors:   true,
            capture_crashes:  true,
            monitor_name:     None,
        }
    }
}

impl StatusResponse {
    /// Parse a status response body. Returns `None` for anything malformed,
    /// which callers treat exactly like a failed request.
    pub fn parse(body: &str) -> Option<Self> {
        let pairs = parse_pairs(body, "m")?;
        let mut resp = StatusResponse::default();

        for (key, val) in pairs {
            match key {
                "cp" => resp.capture          = parse_flag(val)?,
                "id" => resp.server_id        = Some(val.parse().ok()?),
                "mp" => resp.multiplicity     = val.parse().ok()?,
                "si" => resp.send_interval_ms = Some(val.parse::<i64>().ok()?.checked_mul(1000)?),
                "bl" => resp.max_beacon_size  = Some(val.parse::<usize>().ok()?.checked_mul(1024)?),
                "er" => resp.capture_errors   = parse_flag(val)?,
                "cr" => resp.capture_crashes  = parse_flag(val)?,
                "bn" => resp.monitor_name     = Some(val.to_string()),
                _ => {}
            }
        }
        Some(resp)
    }
}

/// Parsed `type=mts` response to a time sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncResponse {
    /// `t1`: server time when the request was received.
    pub request_receive_time: i64,
    /// `t2`: server time when the response was sent.
    pub response_send_time:   i64,
}

impl TimeSyncResponse {
    pub fn parse(body: &str) -> Option<Self> {
        let pairs: HashMap<&str, &str> = parse_pairs(body, "mts")?.into_iter().collect();
        let t1 = pairs.get("t1")?.parse().ok()?;
        let t2 = pairs.get("t2")?.parse().ok()?;
        if t1 < 0 || t2 < 0 {
            return None;
        }
        Some(TimeSyncResponse { request_receive_time: t1, response_send_time: t2 })
    }
}

/// Split `type=<kind>&k=v&...`, checking the leading type marker.
fn parse_pairs<'a>(body: &'a str, kind: &str) -> Option<Vec<(&'a str, &'a str)>> {
    let mut pairs = Vec::new();
    for part in body.trim().split('&').filter(|p| !p.is_empty()) {
        let (key, val) = part.split_once('=')?;
        pairs.push((key, val));
    }
    match pairs.first() {
        Some(("type", t)) if *t == kind => Some(pairs.split_off(1)),
        _ => None,
    }
}

fn parse_flag(val: &str) -> Option<bool> {
    match val {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}
