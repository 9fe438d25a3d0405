use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::events::{EventKind, TransportEvent};

/// Callback invoked for every matching emission.
pub type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    listener: Listener,
    once: bool,
}

/// Typed publish/subscribe registry keyed by [`EventKind`].
///
/// Emission iterates over a snapshot taken under the lock, and the lock is
/// released before any listener runs. Listeners may therefore subscribe or
/// unsubscribe from inside a callback; the change applies from the next
/// emission on. One-shot subscriptions are removed in the same critical
/// section that snapshots them, so they run at most once even when two threads
/// emit concurrently.
pub struct EventBus {
    subscriptions: Mutex<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for every future emission of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.insert(kind, Arc::new(listener), false)
    }

    /// Register a listener that is removed right before its first invocation.
    pub fn subscribe_once<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.insert(kind, Arc::new(listener), true)
    }

    /// Remove a registration. Returns `false` if it was not registered
    /// (already removed, or a one-shot that already fired).
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(list) = subscriptions.get_mut(&kind) else {
            return false;
        };
        match list.iter().position(|s| s.id == id) {
            Some(idx) => {
                let _ = list.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Synchronously invoke every current listener for the event's kind, in
    /// registration order. A panicking listener is logged and skipped.
    pub fn emit(&self, event: &TransportEvent) {
        let kind = event.kind();
        let snapshot: Vec<Subscription> = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(list) = subscriptions.get_mut(&kind) else {
                return;
            };
            let snapshot = list.clone();
            list.retain(|s| !s.once);
            snapshot
        };

        for sub in snapshot {
            let listener = Arc::clone(&sub.listener);
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(event = %kind, subscription = %sub.id, "event listener panicked");
            }
        }
    }

    /// Count registered listeners for an event kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.subscriptions.lock().get(&kind).map_or(0, Vec::len)
    }

    fn insert(&self, kind: EventKind, listener: Listener, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .entry(kind)
            .or_default()
            .push(Subscription { id, listener, once });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscriptions = self.subscriptions.lock();
        let counts: HashMap<EventKind, usize> =
            subscriptions.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}
