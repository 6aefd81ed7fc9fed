//! Invalidation propagation.
//!
//! Marks related keys stale after a committed mutation so dependent views
//! refetch on their next read. Stale entries are never evicted here.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::config::CacheConfig;
use super::keys::{CacheKey, InvalidationTarget};
use super::refetch::{RefetchQueue, RefetchReason};
use super::store::CacheStore;

pub struct Invalidator<V> {
    store: Arc<CacheStore<V>>,
    refetches: Arc<RefetchQueue>,
    refetch_active: bool,
}

impl<V: Clone> Invalidator<V> {
    pub fn new(store: Arc<CacheStore<V>>, refetches: Arc<RefetchQueue>, config: &CacheConfig) -> Self {
        Self {
            store,
            refetches,
            refetch_active: config.refetch_active_on_invalidate,
        }
    }

    /// Mark every entry matched by `targets` stale, returning the keys marked.
    ///
    /// Keys with live subscribers also get an immediate refetch request when
    /// `refetch_active_on_invalidate` is set.
    pub fn invalidate<I>(&self, targets: I) -> Vec<CacheKey>
    where
        I: IntoIterator<Item = InvalidationTarget>,
    {
        let mut seen = HashSet::new();
        let mut marked = Vec::new();

        for target in targets {
            for key in self.store.keys_matching(&target) {
                if !seen.insert(key.clone()) || !self.store.mark_stale(&key) {
                    continue;
                }
                if self.refetch_active && self.store.subscriber_count(&key) > 0 {
                    self.refetches.publish(key.clone(), RefetchReason::Invalidated);
                }
                marked.push(key);
            }
        }

        debug!(marked = marked.len(), "Invalidation applied");
        marked
    }
}
