//! Per-connection table of live subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use procmux_protocol::RequestId;

use crate::subscription::Subscription;

/// Outcome of [`SubscriptionRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The subscription now owns its id.
    Registered,
    /// Another subscription already owns the id.
    Duplicate,
    /// The registry was drained by a connection close.
    Closed,
}

#[derive(Default)]
struct RegistryState {
    closed: bool,
    next_token: u64,
    entries: HashMap<String, Arc<Subscription>>,
}

/// Ids are compared by their text, so `1` and `"1"` name the same entry.
fn key(id: &RequestId) -> String {
    id.to_string()
}

/// Maps request ids to the subscriptions they started.
///
/// Every operation takes one short-lived lock; none of them runs user code
/// while holding it.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Creates an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the generation token for a new subscription.
    pub(crate) fn next_token(&self) -> u64 {
        let mut state = self.lock();
        state.next_token += 1;
        state.next_token
    }

    /// Inserts `subscription` under its id unless the id is taken.
    pub(crate) fn register(&self, subscription: Arc<Subscription>) -> Registration {
        let mut state = self.lock();
        if state.closed {
            return Registration::Closed;
        }
        let key = key(subscription.id());
        if state.entries.contains_key(&key) {
            return Registration::Duplicate;
        }
        debug!(id = %subscription.id(), token = subscription.token(), "Subscription registered");
        state.entries.insert(key, subscription);
        Registration::Registered
    }

    /// Removes and returns the subscription for `id`.
    pub fn remove(&self, id: &RequestId) -> Option<Arc<Subscription>> {
        self.lock().entries.remove(&key(id))
    }

    /// Removes the entry for `id` only if it still belongs to generation `token`.
    pub(crate) fn remove_if(&self, id: &RequestId, token: u64) -> bool {
        let key = key(id);
        let mut state = self.lock();
        match state.entries.get(&key) {
            Some(current) if current.token() == token => {
                state.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Returns true if `id` has a live subscription.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().entries.contains_key(&key(id))
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if no subscription is live.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Returns false once the registry has been drained.
    pub fn is_open(&self) -> bool {
        !self.lock().closed
    }

    /// Closes the registry and hands back every live subscription.
    ///
    /// Later registrations fail with [`Registration::Closed`].
    pub fn drain(&self) -> Vec<Arc<Subscription>> {
        let mut state = self.lock();
        state.closed = true;
        state.entries.drain().map(|(_, sub)| sub).collect()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("closed", &state.closed)
            .field("ids", &state.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;
    use procmux_protocol::ResponseEncoder;

    fn subscription(registry: &Arc<SubscriptionRegistry>, id: i64) -> Arc<Subscription> {
        let (outbox, _rx) = Outbox::channel(ResponseEncoder::default(), 1024);
        Subscription::new(RequestId::from(id), None, "online", outbox, registry)
    }

    #[test]
    fn register_rejects_taken_id() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let first = subscription(&registry, 1);
        let second = subscription(&registry, 1);

        assert_eq!(registry.register(first.clone()), Registration::Registered);
        assert_eq!(registry.register(second), Registration::Duplicate);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.remove(&RequestId::from(1)).unwrap(), &first));
        assert!(registry.is_empty());
    }

    #[test]
    fn numeric_and_string_ids_share_a_key() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let numeric = subscription(&registry, 1);
        let text = Subscription::new(
            RequestId::from("1"),
            None,
            "online",
            Outbox::channel(ResponseEncoder::default(), 1024).0,
            &registry,
        );

        assert_eq!(registry.register(numeric.clone()), Registration::Registered);
        assert_eq!(registry.register(text), Registration::Duplicate);
        assert!(registry.contains(&RequestId::from("1")));
        assert!(Arc::ptr_eq(&registry.remove(&RequestId::from("1")).unwrap(), &numeric));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_if_respects_generation() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let old = subscription(&registry, 7);
        let new = subscription(&registry, 7);
        assert_ne!(old.token(), new.token());

        registry.register(old.clone());
        registry.remove(&RequestId::from(7));
        registry.register(new.clone());

        assert!(!registry.remove_if(&RequestId::from(7), old.token()));
        assert!(registry.contains(&RequestId::from(7)));
        assert!(registry.remove_if(&RequestId::from(7), new.token()));
        assert!(!registry.contains(&RequestId::from(7)));
    }

    #[test]
    fn drain_closes_registry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.register(subscription(&registry, 1));
        registry.register(subscription(&registry, 2));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(!registry.is_open());
        assert_eq!(
            registry.register(subscription(&registry, 3)),
            Registration::Closed
        );
        assert!(registry.drain().is_empty());
    }
}
