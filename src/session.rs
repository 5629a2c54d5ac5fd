//! User sessions and the registry the sender thread works from.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::action::Action;
use crate::protocol::Beacon;
use crate::util::lock;

/// Open and finished sessions, in creation/finish order.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    open:     Mutex<Vec<Session>>,
    finished: Mutex<Vec<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, session: &Session) {
        lock(&self.open).push(session.clone());
    }

    /// Move `session` from the open to the finished list.
    fn finish(&self, session: &Session) {
        lock(&self.open).retain(|s| !s.same_as(session));
        lock(&self.finished).push(session.clone());
    }

    pub fn open_sessions(&self) -> Vec<Session> {
        lock(&self.open).clone()
    }

    pub fn finished_sessions(&self) -> Vec<Session> {
        lock(&self.finished).clone()
    }

    pub fn remove_finished(&self, session: &Session) {
        lock(&self.finished).retain(|s| !s.same_as(session));
    }

    /// Remove and return every finished session.
    pub fn take_finished(&self) -> Vec<Session> {
        std::mem::take(&mut *lock(&self.finished))
    }
}

struct SessionInner {
    beacon:       Arc<Beacon>,
    registry:     Weak<SessionRegistry>,
    open_actions: Arc<Mutex<Vec<Action>>>,
    ended:        AtomicBool,
}

/// Handle to a user session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session and register it as open.
    pub fn new(beacon: Arc<Beacon>, registry: &Arc<SessionRegistry>) -> Session {
        let session = Session {
            inner: Arc::new(SessionInner {
                beacon,
                registry:     Arc::downgrade(registry),
                open_actions: Arc::new(Mutex::new(Vec::new())),
                ended:        AtomicBool::new(false),
            }),
        };
        registry.register(&session);
        debug!("session {} created", session.session_number());
        session
    }

    pub fn session_number(&self) -> i32 {
        self.inner.beacon.session_number()
    }

    pub fn beacon(&self) -> &Arc<Beacon> {
        &self.inner.beacon
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Start a root action. On an ended session the action records nothing.
    pub fn enter_action(&self, name: &str) -> Action {
        if self.is_ended() {
            return Action::detached(Arc::clone(&self.inner.beacon), name);
        }
        Action::new(Arc::clone(&self.inner.beacon), name, 0, &self.inner.open_actions)
    }

    pub fn report_crash(&self, error_name: &str, reason: &str, stacktrace: &str) {
        if self.is_ended() {
            return;
        }
        self.inner.beacon.report_crash(error_name, reason, stacktrace);
    }

    /// Leave every open action, record the session end and hand the session
    /// over for sending. Later calls are no-ops.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        let actions = std::mem::take(&mut *lock(&self.inner.open_actions));
        for action in actions {
            action.leave_action();
        }
        self.inner.beacon.end_session();

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.finish(self);
        }
        debug!("session {} ended", self.session_number());
    }

    fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_number", &self.session_number())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BeaconCache;
    use crate::communication::ServerSettings;
    use crate::config::AgentConfig;
    use crate::protocol::beacon::BEACON_DELIMITER;
    use crate::testing::ManualTiming;

    fn session(cache: &Arc<BeaconCache>, registry: &Arc<SessionRegistry>) -> Session {
        let beacon = Beacon::new(
            3,
            "",
            Arc::new(AgentConfig::default()),
            Arc::clone(cache),
            Arc::new(ServerSettings::new(1)),
            Arc::new(ManualTiming::new(0)),
        );
        Session::new(Arc::new(beacon), registry)
    }

    #[test]
    fn end_moves_session_to_finished_once() {
        let cache = Arc::new(BeaconCache::new());
        let registry = Arc::new(SessionRegistry::new());
        let s = session(&cache, &registry);
        assert_eq!(registry.open_sessions().len(), 1);

        s.end();
        s.end();
        assert!(registry.open_sessions().is_empty());
        assert_eq!(registry.finished_sessions().len(), 1);

        let data = cache.next_chunk(3, "", usize::MAX, BEACON_DELIMITER).unwrap();
        assert_eq!(data.matches("et=19").count(), 1);
    }

    #[test]
    fn end_leaves_open_actions_first() {
        let cache = Arc::new(BeaconCache::new());
        let registry = Arc::new(SessionRegistry::new());
        let s = session(&cache, &registry);
        let outer = s.enter_action("outer");
        let inner = outer.enter_action("inner");

        s.end();
        assert!(outer.is_left());
        assert!(inner.is_left());

        let data = cache.next_chunk(3, "", usize::MAX, BEACON_DELIMITER).unwrap();
        let inner_at = data.find("na=inner").unwrap();
        let outer_at = data.find("na=outer").unwrap();
        let end_at   = data.find("et=19").unwrap();
        assert!(inner_at < outer_at && outer_at < end_at, "{data}");
    }

    #[test]
    fn ended_session_records_nothing_more() {
        let cache = Arc::new(BeaconCache::new());
        let registry = Arc::new(SessionRegistry::new());
        let s = session(&cache, &registry);
        s.end();
        cache.delete_entry(3);

        s.enter_action("late").report_event("tap").leave_action();
        s.report_crash("boom", "", "");
        assert!(cache.is_empty(3));
    }

    #[test]
    fn take_finished_empties_the_list() {
        let cache = Arc::new(BeaconCache::new());
        let registry = Arc::new(SessionRegistry::new());
        session(&cache, &registry).end();
        assert_eq!(registry.take_finished().len(), 1);
        assert!(registry.finished_sessions().is_empty());
    }
}
