//! Observer registry bridging store writes to UI re-render triggers.
//!
//! Listeners receive only the key that changed; they re-read the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::subscribers";

/// Callback invoked after every write or removal of a subscribed key.
pub type Listener = Arc<dyn Fn(&CacheKey) + Send + Sync>;

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<CacheKey, Vec<(u64, Listener)>>>,
}

impl SubscriberRegistry {
    pub(crate) fn add(self: &Arc<Self>, key: CacheKey, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.listeners, SOURCE, "add")
            .entry(key.clone())
            .or_default()
            .push((id, listener));

        Subscription {
            registry: Arc::downgrade(self),
            key,
            id,
        }
    }

    fn remove(&self, key: &CacheKey, id: u64) {
        let mut listeners = mutex_lock(&self.listeners, SOURCE, "remove");
        if let Some(entries) = listeners.get_mut(key) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                listeners.remove(key);
            }
        }
    }

    pub(crate) fn count(&self, key: &CacheKey) -> usize {
        mutex_lock(&self.listeners, SOURCE, "count")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Invoke every listener for `key`.
    ///
    /// Listeners are cloned out first so a callback may subscribe, unsubscribe
    /// or read the store without deadlocking.
    pub(crate) fn notify(&self, key: &CacheKey) {
        let listeners: Vec<Listener> = mutex_lock(&self.listeners, SOURCE, "notify")
            .get(key)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(key);
        }
    }
}

/// Handle returned by `CacheStore::subscribe`.
///
/// The listener stays registered until the handle is dropped or
/// [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    registry: Weak<SubscriberRegistry>,
    key: CacheKey,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }
}
