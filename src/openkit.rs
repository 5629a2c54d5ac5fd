//! Entry point tying the cache, the evictor and the sender together.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::cache::{BeaconCache, CacheEvictor};
use crate::communication::{BeaconSender, SendingContext, ServerSettings};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::protocol::{Beacon, HttpClient, ReqwestHttpClient};
use crate::session::{Session, SessionRegistry};
use crate::timing::{SystemTiming, TimingProvider};

pub struct OpenKit {
    config:              Arc<AgentConfig>,
    cache:               Arc<BeaconCache>,
    settings:            Arc<ServerSettings>,
    sessions:            Arc<SessionRegistry>,
    timing:              Arc<dyn TimingProvider>,
    evictor:             CacheEvictor,
    sender:              BeaconSender,
    next_session_number: AtomicI32,
    shut_down:           AtomicBool,
}

impl OpenKit {
    /// Agent talking to `config.base_url` over HTTP, using the system clock.
    ///
    /// Must be called outside of any async runtime.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let http = ReqwestHttpClient::new(config.http_client_config())?;
        Ok(Self::with_providers(config, Arc::new(http), Arc::new(SystemTiming)))
    }

    pub fn with_providers(
        config: AgentConfig,
        http:   Arc<dyn HttpClient>,
        timing: Arc<dyn TimingProvider>,
    ) -> Self {
        let config   = Arc::new(config);
        let cache    = Arc::new(BeaconCache::new());
        let settings = Arc::new(ServerSettings::new(config.server_id));
        let sessions = Arc::new(SessionRegistry::new());

        let evictor = CacheEvictor::new(Arc::clone(&cache), config.cache_config(), Arc::clone(&timing));
        let context = SendingContext::new(http, Arc::clone(&timing), Arc::clone(&settings), Arc::clone(&sessions));

        OpenKit {
            config,
            cache,
            settings,
            sessions,
            timing,
            evictor,
            sender: BeaconSender::new(Arc::new(context)),
            next_session_number: AtomicI32::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start the eviction and sender threads.
    pub fn initialize(&self) -> Result<()> {
        self.evictor.start()?;
        self.sender.initialize()?;
        info!(
            "OpenKit initialized for application {} ({})",
            self.config.application_id, self.config.base_url
        );
        Ok(())
    }

    /// Block until the first backend configuration arrived or `timeout`
    /// elapsed; `None` waits indefinitely. `false` if init failed.
    pub fn wait_for_init_completion(&self, timeout: Option<Duration>) -> bool {
        self.sender.wait_for_init(timeout)
    }

    pub fn is_initialized(&self) -> bool {
        self.sender.is_initialized()
    }

    pub fn cache(&self) -> &Arc<BeaconCache> {
        &self.cache
    }

    /// Open a new session for the client at `client_ip`.
    ///
    /// Returns `None` once the agent was shut down.
    pub fn create_session(&self, client_ip: &str) -> Option<Session> {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("create_session called after shutdown");
            return None;
        }
        let number = self.next_session_number.fetch_add(1, Ordering::SeqCst) + 1;
        let beacon = Beacon::new(
            number,
            client_ip,
            Arc::clone(&self.config),
            Arc::clone(&self.cache),
            Arc::clone(&self.settings),
            Arc::clone(&self.timing),
        );
        Some(Session::new(Arc::new(beacon), &self.sessions))
    }

    /// Flush open sessions and stop both threads. Returns `true` if both
    /// terminated in time; later calls return `false`.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("OpenKit shutting down");
        let sender_stopped  = self.sender.shutdown();
        let evictor_stopped = self.evictor.stop();
        sender_stopped && evictor_stopped
    }
}

impl Drop for OpenKit {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TimeSyncResponse;
    use crate::testing::ScriptedHttpClient;

    fn config() -> AgentConfig {
        AgentConfig {
            base_url:       "https://example.com/mbeacon".into(),
            application_id: "app-1".into(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn session_data_is_flushed_on_shutdown() {
        let http = Arc::new(ScriptedHttpClient::always_ok());
        for _ in 0..5 {
            http.push_time_sync(Some(TimeSyncResponse { request_receive_time: 1, response_send_time: 1 }));
        }
        let openkit = OpenKit::with_providers(config(), http.clone(), Arc::new(SystemTiming));
        openkit.initialize().unwrap();
        assert!(openkit.wait_for_init_completion(Some(Duration::from_secs(5))));
        assert!(openkit.is_initialized());

        let session = openkit.create_session("192.168.0.7").unwrap();
        let action = session.enter_action("checkout");
        action.report_value_int("items", 3);

        assert!(openkit.shutdown());
        assert!(!openkit.shutdown());
        assert!(openkit.create_session("192.168.0.7").is_none());

        let sent = http.beacons();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "192.168.0.7");
        assert!(sent[0].2.starts_with("vv=3&va="));
        assert!(sent[0].2.contains("&ap=app-1&"));
        assert!(sent[0].2.contains("et=12&na=items"));
        assert!(sent[0].2.contains("et=1&na=checkout"));
        assert!(sent[0].2.contains("et=19"));
        assert_eq!(openkit.cache().num_bytes(), 0);
    }

    #[test]
    fn session_numbers_are_unique() {
        let openkit = OpenKit::with_providers(
            config(),
            Arc::new(ScriptedHttpClient::new()),
            Arc::new(SystemTiming),
        );
        let a = openkit.create_session("").unwrap();
        let b = openkit.create_session("").unwrap();
        assert_eq!(a.session_number(), 1);
        assert_eq!(b.session_number(), 2);
    }

    #[test]
    fn unreachable_backend_fails_init_on_shutdown() {
        let openkit = OpenKit::with_providers(
            config(),
            Arc::new(ScriptedHttpClient::new()),
            Arc::new(SystemTiming),
        );
        openkit.initialize().unwrap();
        assert!(!openkit.wait_for_init_completion(Some(Duration::from_millis(50))));
        assert!(openkit.shutdown());
        assert!(!openkit.wait_for_init_completion(None));
    }
}
