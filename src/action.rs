//! Timed, nestable user actions.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::protocol::beacon::ActionRecord;
use crate::protocol::Beacon;
use crate::util::lock;

struct ActionInner {
    id:             i32,
    parent_id:      i32,
    name:           String,
    start_time:     i64,
    start_sequence: i32,
    beacon:         Arc<Beacon>,
    children:       Arc<Mutex<Vec<Action>>>,
    /// List this action is registered in: the session's or the parent's.
    siblings:       Weak<Mutex<Vec<Action>>>,
    left:           AtomicBool,
}

/// Handle to an action. Cheap to clone; all clones share state.
///
/// Reporting on an action that was already left is silently ignored.
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

impl Action {
    pub(crate) fn new(
        beacon:    Arc<Beacon>,
        name:      &str,
        parent_id: i32,
        siblings:  &Arc<Mutex<Vec<Action>>>,
    ) -> Action {
        let action = Action {
            inner: Arc::new(ActionInner {
                id:             beacon.create_id(),
                parent_id,
                name:           name.to_string(),
                start_time:     beacon.current_timestamp(),
                start_sequence: beacon.create_sequence_number(),
                beacon,
                children:       Arc::new(Mutex::new(Vec::new())),
                siblings:       Arc::downgrade(siblings),
                left:           AtomicBool::new(false),
            }),
        };
        lock(siblings).push(action.clone());
        action
    }

    /// An action that was never entered and records nothing.
    pub(crate) fn detached(beacon: Arc<Beacon>, name: &str) -> Action {
        Action {
            inner: Arc::new(ActionInner {
                id:             0,
                parent_id:      0,
                name:           name.to_string(),
                start_time:     0,
                start_sequence: 0,
                beacon,
                children:       Arc::new(Mutex::new(Vec::new())),
                siblings:       Weak::new(),
                left:           AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> i32 {
        self.inner.id
    }

    pub fn parent_id(&self) -> i32 {
        self.inner.parent_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_left(&self) -> bool {
        self.inner.left.load(Ordering::SeqCst)
    }

    /// Start a child action.
    pub fn enter_action(&self, name: &str) -> Action {
        if self.is_left() {
            return Action::detached(Arc::clone(&self.inner.beacon), name);
        }
        Action::new(Arc::clone(&self.inner.beacon), name, self.inner.id, &self.inner.children)
    }

    pub fn report_event(&self, name: &str) -> &Self {
        if !self.is_left() {
            self.inner.beacon.report_event(self.inner.id, name);
        }
        self
    }

    pub fn report_value_int(&self, name: &str, value: i64) -> &Self {
        if !self.is_left() {
            self.inner.beacon.report_value_int(self.inner.id, name, value);
        }
        self
    }

    pub fn report_value_double(&self, name: &str, value: f64) -> &Self {
        if !self.is_left() {
            self.inner.beacon.report_value_double(self.inner.id, name, value);
        }
        self
    }

    pub fn report_value_string(&self, name: &str, value: &str) -> &Self {
        if !self.is_left() {
            self.inner.beacon.report_value_string(self.inner.id, name, value);
        }
        self
    }

    pub fn report_error(&self, name: &str, code: i32, reason: &str) -> &Self {
        if !self.is_left() {
            self.inner.beacon.report_error(self.inner.id, name, code, reason);
        }
        self
    }

    /// Leave open child actions, then record this action. Later calls are
    /// no-ops.
    pub fn leave_action(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }

        let children = std::mem::take(&mut *lock(&self.inner.children));
        for child in children {
            child.leave_action();
        }

        let beacon = &self.inner.beacon;
        let record = ActionRecord {
            id:             self.inner.id,
            parent_id:      self.inner.parent_id,
            name:           &self.inner.name,
            start_time:     self.inner.start_time,
            end_time:       beacon.current_timestamp(),
            start_sequence: self.inner.start_sequence,
            end_sequence:   beacon.create_sequence_number(),
        };
        beacon.add_action(&record);

        if let Some(siblings) = self.inner.siblings.upgrade() {
            lock(&siblings).retain(|a| !Arc::ptr_eq(&a.inner, &self.inner));
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("parent_id", &self.inner.parent_id)
            .field("left", &self.is_left())
            .finish()
    }
}
