//! HTTP transport for status, time sync and beacon requests.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::blocking::{Client, RequestBuilder};
use url::Url;

use super::{StatusResponse, TimeSyncResponse};
use crate::config::HttpClientConfig;
use crate::error::Result;

/// Value reported as the `tt` (technology type) query parameter.
pub const AGENT_TECHNOLOGY_TYPE: &str = "okrust";

const REQUEST_TYPE_MOBILE:    &str = "m";
const REQUEST_TYPE_TIME_SYNC: &str = "mts";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request/response contract the sending state machine consumes.
///
/// Every method returns `None` on any failure: network error, non-success
/// status or an unparsable body.
pub trait HttpClient: Send + Sync {
    fn send_status_request(&self, server_id: i32) -> Option<StatusResponse>;

    fn send_time_sync_request(&self, server_id: i32) -> Option<TimeSyncResponse>;

    fn send_beacon_request(
        &self,
        server_id: i32,
        client_ip: &str,
        data:      &[u8],
    ) -> Option<StatusResponse>;
}

/// Build the monitor URL `base?type=..&srvid=..&app=..&va=..&pt=1&tt=okrust`.
pub fn monitor_url(
    base_url:       &str,
    request_type:   &str,
    server_id:      i32,
    application_id: &str,
) -> Result<Url> {
    let url = Url::parse_with_params(
        base_url,
        &[
            ("type",  request_type),
            ("srvid", &server_id.to_string()),
            ("app",   application_id),
            ("va",    env!("CARGO_PKG_VERSION")),
            ("pt",    "1"),
            ("tt",    AGENT_TECHNOLOGY_TYPE),
        ],
    )?;
    Ok(url)
}

/// [`HttpClient`] backed by a blocking `reqwest` client.
///
/// Must be created outside of any async runtime.
pub struct ReqwestHttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl ReqwestHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ReqwestHttpClient { client, config })
    }

    fn url(&self, request_type: &str, server_id: i32) -> Option<Url> {
        match monitor_url(&self.config.base_url, request_type, server_id, &self.config.application_id) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("cannot build monitor URL from {}: {e}", self.config.base_url);
                None
            }
        }
    }

    /// Send `request` and return the body of a successful response.
    fn execute(&self, what: &str, request: RequestBuilder) -> Option<String> {
        match request.send() {
            Ok(resp) if resp.status().is_success() => match resp.text() {
                Ok(body) => {
                    if self.config.verbose {
                        info!("HTTP {what} response: {body}");
                    }
                    Some(body)
                }
                Err(e) => {
                    warn!("HTTP {what}: reading body failed: {e}");
                    None
                }
            },
            Ok(resp) => {
                warn!("HTTP {what}: status {}", resp.status());
                None
            }
            Err(e) => {
                debug!("HTTP {what} failed: {e}");
                None
            }
        }
    }
}

impl HttpClient for ReqwestHttpClient {
    fn send_status_request(&self, server_id: i32) -> Option<StatusResponse> {
        let url = self.url(REQUEST_TYPE_MOBILE, server_id)?;
        debug!("HTTP status request: {url}");
        let body = self.execute("status", self.client.get(url))?;
        StatusResponse::parse(&body)
    }

    fn send_time_sync_request(&self, server_id: i32) -> Option<TimeSyncResponse> {
        let url = self.url(REQUEST_TYPE_TIME_SYNC, server_id)?;
        debug!("HTTP time sync request: {url}");
        let body = self.execute("time sync", self.client.get(url))?;
        TimeSyncResponse::parse(&body)
    }

    fn send_beacon_request(
        &self,
        server_id: i32,
        client_ip: &str,
        data:      &[u8],
    ) -> Option<StatusResponse> {
        let url = self.url(REQUEST_TYPE_MOBILE, server_id)?;
        debug!("HTTP beacon request: {url} ({} bytes)", data.len());
        let mut request = self.client.post(url).body(data.to_vec());
        if !client_ip.is_empty() {
            request = request.header("X-Client-IP", client_ip);
        }
        let body = self.execute("beacon", request)?;
        StatusResponse::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_url_carries_identifiers() {
        let url = monitor_url("https://example.com/mbeacon", "m", 7, "my app").unwrap();
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/mbeacon");
        assert!(query.contains(&("type".into(), "m".into())));
        assert!(query.contains(&("srvid".into(), "7".into())));
        assert!(query.contains(&("app".into(), "my app".into())));
        assert!(query.contains(&("tt".into(), AGENT_TECHNOLOGY_TYPE.into())));
    }

    #[test]
    fn monitor_url_rejects_garbage() {
        assert!(monitor_url("not a url", "m", 1, "app").is_err());
    }
}
