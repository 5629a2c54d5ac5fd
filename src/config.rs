//! Agent configuration file parser.
//!
//! Parses a flat `key = value` file, e.g. `/etc/openkit/agent.conf`:
//!
//! ```text
//! base_url       = https://tenant.example.com/mbeacon
//! application_id = 8b7d9d2e-1e51-4b67-a5a4-0b7c7bb1e2f3
//! server_id      = 1
//! verbose        = yes
//! ```

use std::fs;
use std::path::Path;

use crate::error::{AgentError, Result};

// Default cache bounds
const MAX_RECORD_AGE_MS:  i64 = 105 * 60 * 1000;
const LOWER_BOUND_BYTES:  i64 = 80 * 1024 * 1024;
const UPPER_BOUND_BYTES:  i64 = 100 * 1024 * 1024;
const SERVER_ID:          i32 = 1;

/// Full agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    // ── Backend ───────────────────────────────────────────────────────────────
    /// Beacon endpoint, e.g. `https://tenant.example.com/mbeacon`.
    pub base_url: String,
    /// Server id used for the very first request; replaced by the backend's.
    pub server_id: i32,
    // ── Application identity ──────────────────────────────────────────────────
    pub application_id:      String,
    pub application_name:    String,
    pub application_version: String,
    // ── Device ────────────────────────────────────────────────────────────────
    pub device_os:           String,
    pub device_manufacturer: String,
    pub device_model:        String,
    // ── Beacon cache ──────────────────────────────────────────────────────────
    /// Maximum record age in milliseconds; `<= 0` disables time eviction.
    pub max_record_age_ms: i64,
    /// Minimum pause between two time eviction passes; `<= 0` uses the record age.
    pub time_eviction_interval_ms: i64,
    pub cache_lower_bound: i64,
    pub cache_upper_bound: i64,
    // ── Logging ───────────────────────────────────────────────────────────────
    pub verbose:    bool,
    pub log_syslog: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url:                  String::new(),
            server_id:                 SERVER_ID,
            application_id:            String::new(),
            application_name:          String::new(),
            application_version:       env!("CARGO_PKG_VERSION").to_string(),
            device_os:                 std::env::consts::OS.to_string(),
            device_manufacturer:       String::new(),
            device_model:              String::new(),
            max_record_age_ms:         MAX_RECORD_AGE_MS,
            time_eviction_interval_ms: 0,
            cache_lower_bound:         LOWER_BOUND_BYTES,
            cache_upper_bound:         UPPER_BOUND_BYTES,
            verbose:                   false,
            log_syslog:                false,
        }
    }
}

/// HTTP client value object handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    pub base_url:       String,
    pub server_id:      i32,
    pub application_id: String,
    pub verbose:        bool,
}

/// Eviction bounds for the beacon cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_record_age:         i64,
    pub time_eviction_interval: i64,
    pub lower_bound:            i64,
    pub upper_bound:            i64,
}

impl CacheConfig {
    pub fn new(max_record_age: i64, lower_bound: i64, upper_bound: i64) -> Self {
        CacheConfig {
            max_record_age,
            time_eviction_interval: max_record_age,
            lower_bound,
            upper_bound,
        }
    }

    pub fn time_eviction_enabled(&self) -> bool {
        self.max_record_age > 0
    }

    pub fn space_eviction_enabled(&self) -> bool {
        self.lower_bound > 0 && self.upper_bound > 0 && self.lower_bound < self.upper_bound
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::new(MAX_RECORD_AGE_MS, LOWER_BOUND_BYTES, UPPER_BOUND_BYTES)
    }
}

/// Device metadata reported in every beacon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub operating_system: String,
    pub manufacturer:     String,
    pub model:            String,
}

impl AgentConfig {
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url:       self.base_url.clone(),
            server_id:      self.server_id,
            application_id: self.application_id.clone(),
            verbose:        self.verbose,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        let interval = if self.time_eviction_interval_ms > 0 {
            self.time_eviction_interval_ms
        } else {
            self.max_record_age_ms
        };
        CacheConfig {
            max_record_age:         self.max_record_age_ms,
            time_eviction_interval: interval,
            lower_bound:            self.cache_lower_bound,
            upper_bound:            self.cache_upper_bound,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            operating_system: self.device_os.clone(),
            manufacturer:     self.device_manufacturer.clone(),
            model:            self.device_model.clone(),
        }
    }
}

fn parse_flag(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

/// Load and parse the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

/// Parse `key = value` lines into an [`AgentConfig`].
///
/// Unknown keys are ignored and unparsable numbers keep their default.
pub fn parse_config(content: &str) -> AgentConfig {
    let mut cfg = AgentConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().to_string();
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "base_url"                  => cfg.base_url            = val,
            "server_id"                 => cfg.server_id           = val.parse().unwrap_or(SERVER_ID),
            "application_id"            => cfg.application_id      = val,
            "application_name"          => cfg.application_name    = val,
            "application_version"       => cfg.application_version = val,
            "device_os"                 => cfg.device_os           = val,
            "device_manufacturer"       => cfg.device_manufacturer = val,
            "device_model"              => cfg.device_model        = val,
            "max_record_age_ms"         => cfg.max_record_age_ms   = val.parse().unwrap_or(MAX_RECORD_AGE_MS),
            "time_eviction_interval_ms" => cfg.time_eviction_interval_ms = val.parse().unwrap_or(0),
            "cache_lower_bound"         => cfg.cache_lower_bound   = val.parse().unwrap_or(LOWER_BOUND_BYTES),
            "cache_upper_bound"         => cfg.cache_upper_bound   = val.parse().unwrap_or(UPPER_BOUND_BYTES),
            "verbose"                   => cfg.verbose             = parse_flag(&val),
            "log_syslog"                => cfg.log_syslog          = parse_flag(&val),
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

/// Validate that required fields are populated.
pub fn validate_config(cfg: &AgentConfig) -> Result<()> {
    if cfg.base_url.is_empty() {
        return Err(AgentError::Config("base_url is required".into()));
    }
    url::Url::parse(&cfg.base_url)
        .map_err(|e| AgentError::Config(format!("base_url {}: {e}", cfg.base_url)))?;
    if cfg.application_id.is_empty() {
        return Err(AgentError::Config("application_id is required".into()));
    }
    if cfg.cache_lower_bound > 0
        && cfg.cache_upper_bound > 0
        && cfg.cache_lower_bound >= cfg.cache_upper_bound
    {
        return Err(AgentError::Config(
            "cache_lower_bound must be smaller than cache_upper_bound".into(),
        ));
    }
    Ok(())
}
