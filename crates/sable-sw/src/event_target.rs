//! Listener registry shared by the native observable surface and the worker
//! global scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Identifier handed out by [`EventTarget::add_listener`], used to remove
/// the listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A minimal event target: listeners keyed by event type, dispatched from an
/// ordered snapshot.
///
/// The listener type is generic so one implementation serves both sides of
/// the runtime: native callbacks on workers and registrations, and script
/// function handles inside a worker global scope.
pub struct EventTarget<L> {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, L)>>>,
    next_id: AtomicU64,
}

impl<L: Clone> EventTarget<L> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for `event_type`, in arrival order.
    pub fn add_listener(&self, event_type: &str, listener: L) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener by id. Returns false when no such listener is
    /// registered for `event_type`.
    pub fn remove_listener(&self, event_type: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.get_mut(event_type) {
            Some(list) => {
                let before = list.len();
                list.retain(|(listener_id, _)| *listener_id != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Remove every listener matching the predicate. Returns how many were
    /// removed.
    pub fn remove_where(&self, event_type: &str, predicate: impl Fn(&L) -> bool) -> usize {
        let mut listeners = self.listeners.lock();
        match listeners.get_mut(event_type) {
            Some(list) => {
                let before = list.len();
                list.retain(|(_, listener)| !predicate(listener));
                before - list.len()
            }
            None => 0,
        }
    }

    /// Snapshot the listeners for one event type in registration order.
    /// Dispatch happens outside the registry lock, so a listener may add or
    /// remove listeners without deadlocking.
    pub fn snapshot(&self, event_type: &str) -> Vec<L> {
        self.listeners
            .lock()
            .get(event_type)
            .map(|list| list.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of listeners registered for `event_type`.
    pub fn count(&self, event_type: &str) -> usize {
        self.listeners
            .lock()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl<L: Clone> Default for EventTarget<L> {
    fn default() -> Self {
        Self::new()
    }
}
