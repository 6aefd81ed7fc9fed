//! Key-addressed in-memory store.
//!
//! Every operation that changes an entry runs under one write lock, then
//! notifies subscribers after the lock is released. Versions are never reused
//! for a key: removing an entry leaves a floor that a re-created entry
//! continues from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use super::entry::{self, CacheEntry, Incarnation, Version};
use super::keys::{CacheKey, InvalidationTarget};
use super::lock::{rw_read, rw_write};
use super::mutation::{OptimisticWrite, RollbackOutcome};
use super::subscribers::{SubscriberRegistry, Subscription};

const SOURCE: &str = "cache::store";

/// Proof that a read fetch was started for a key at a given generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: CacheKey,
    pub generation: u64,
}

/// What happened to the result of a read fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The result was written and the stale flag cleared.
    Written(Version),
    /// A mutation (or removal) cancelled the fetch after it started.
    Cancelled,
    /// Mutations are still pending on the key; the provisional value wins.
    Deferred,
}

struct StoreState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    version_floors: HashMap<CacheKey, Version>,
    fetch_generations: HashMap<CacheKey, u64>,
    last_incarnation: Incarnation,
}

impl<V> StoreState<V> {
    fn entry_mut(&mut self, key: &CacheKey) -> &mut CacheEntry<V> {
        let floors = &mut self.version_floors;
        let last_incarnation = &mut self.last_incarnation;
        self.entries.entry(key.clone()).or_insert_with(|| {
            *last_incarnation += 1;
            let mut entry = CacheEntry::empty(floors.remove(key).unwrap_or(0));
            entry.incarnation = *last_incarnation;
            entry
        })
    }

    fn retire(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let removed = self.entries.remove(key)?;
        // Removal is a write: anything applied before it is superseded.
        self.version_floors.insert(key.clone(), removed.version + 1);
        if let Some(generation) = self.fetch_generations.get_mut(key) {
            *generation += 1;
        }
        Some(removed)
    }

    fn current_version(&self, key: &CacheKey) -> Version {
        self.entries
            .get(key)
            .map(|entry| entry.version)
            .or_else(|| self.version_floors.get(key).copied())
            .unwrap_or(0)
    }
}

/// In-memory cache of `V` values addressed by [`CacheKey`].
pub struct CacheStore<V> {
    state: RwLock<StoreState<V>>,
    subscribers: Arc<SubscriberRegistry>,
}

impl<V: Clone> CacheStore<V> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState {
                entries: HashMap::new(),
                version_floors: HashMap::new(),
                fetch_generations: HashMap::new(),
                last_incarnation: 0,
            }),
            subscribers: Arc::new(SubscriberRegistry::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        rw_read(&self.state, SOURCE, "get").entries.get(key).cloned()
    }

    /// Shorthand for the data of an entry.
    pub fn data(&self, key: &CacheKey) -> Option<V> {
        rw_read(&self.state, SOURCE, "data")
            .entries
            .get(key)
            .and_then(|entry| entry.data.clone())
    }

    /// Overwrite the data for `key`, creating the entry if needed.
    pub fn set(&self, key: &CacheKey, data: V) -> Version {
        let version = rw_write(&self.state, SOURCE, "set")
            .entry_mut(key)
            .write(Some(data));
        trace!(cache_key = %key, version, "Cache entry written");
        self.subscribers.notify(key);
        version
    }

    /// Remove the entry for `key`, returning it if it existed.
    pub fn delete(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let removed = rw_write(&self.state, SOURCE, "delete").retire(key);
        if removed.is_some() {
            debug!(cache_key = %key, "Cache entry deleted");
            self.subscribers.notify(key);
        }
        removed
    }

    /// Drop every entry, e.g. on logout.
    pub fn clear(&self) {
        let removed: Vec<CacheKey> = {
            let mut state = rw_write(&self.state, SOURCE, "clear");
            let keys: Vec<CacheKey> = state.entries.keys().cloned().collect();
            for key in &keys {
                state.retire(key);
            }
            for generation in state.fetch_generations.values_mut() {
                *generation += 1;
            }
            keys
        };
        debug!(removed = removed.len(), "Cache cleared");
        for key in &removed {
            self.subscribers.notify(key);
        }
    }

    /// Register `callback` to fire after every write or removal of `key`.
    pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> Subscription
    where
        F: Fn(&CacheKey) + Send + Sync + 'static,
    {
        self.subscribers.add(key, Arc::new(callback))
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscribers.count(key)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        rw_read(&self.state, SOURCE, "keys")
            .entries
            .keys()
            .cloned()
            .collect()
    }

    pub fn keys_matching(&self, target: &InvalidationTarget) -> Vec<CacheKey> {
        match target {
            InvalidationTarget::Exact(key) => {
                if rw_read(&self.state, SOURCE, "keys_matching")
                    .entries
                    .contains_key(key)
                {
                    vec![key.clone()]
                } else {
                    Vec::new()
                }
            }
            InvalidationTarget::Prefix(_) => rw_read(&self.state, SOURCE, "keys_matching")
                .entries
                .keys()
                .filter(|key| target.matches(key))
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flag `key` as stale. Returns false if there is no entry to flag.
    pub fn mark_stale(&self, key: &CacheKey) -> bool {
        match rw_write(&self.state, SOURCE, "mark_stale").entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Start a read fetch for `key`.
    pub fn begin_fetch(&self, key: &CacheKey) -> FetchTicket {
        let generation = *rw_write(&self.state, SOURCE, "begin_fetch")
            .fetch_generations
            .entry(key.clone())
            .or_insert(0);
        FetchTicket {
            key: key.clone(),
            generation,
        }
    }

    /// Make every outstanding fetch for `key` land as [`FetchOutcome::Cancelled`].
    pub fn cancel_fetches(&self, key: &CacheKey) {
        let mut state = rw_write(&self.state, SOURCE, "cancel_fetches");
        if let Some(generation) = state.fetch_generations.get_mut(key) {
            *generation += 1;
            trace!(cache_key = %key, generation = *generation, "In-flight fetches cancelled");
        }
    }

    /// Write the result of a fetch unless it was cancelled or a mutation is pending.
    pub fn complete_fetch(&self, ticket: &FetchTicket, data: V) -> FetchOutcome {
        let outcome = {
            let mut state = rw_write(&self.state, SOURCE, "complete_fetch");
            let current = state
                .fetch_generations
                .get(&ticket.key)
                .copied()
                .unwrap_or(0);
            if current != ticket.generation {
                FetchOutcome::Cancelled
            } else if state
                .entries
                .get(&ticket.key)
                .is_some_and(CacheEntry::is_provisional)
            {
                FetchOutcome::Deferred
            } else {
                let entry = state.entry_mut(&ticket.key);
                let version = entry.write(Some(data));
                entry.stale = false;
                FetchOutcome::Written(version)
            }
        };

        debug!(cache_key = %ticket.key, outcome = ?outcome, "Fetch completed");
        if matches!(outcome, FetchOutcome::Written(_)) {
            self.subscribers.notify(&ticket.key);
        }
        outcome
    }

    /// Snapshot, transform and write in one critical section, counting the
    /// mutation as pending. A failing transform leaves the store untouched.
    ///
    /// `transform` runs under the store lock and must not touch the store.
    pub(crate) fn apply_optimistic<E>(
        &self,
        key: &CacheKey,
        transform: impl FnOnce(Option<&V>) -> Result<V, E>,
    ) -> Result<OptimisticWrite<V>, E> {
        let write = {
            let mut state = rw_write(&self.state, SOURCE, "apply_optimistic");
            let previous = entry::snapshot(state.entries.get(key));
            let optimistic = transform(previous.data.as_ref())?;

            let entry = state.entry_mut(key);
            let applied_version = entry.write(Some(optimistic));
            entry.pending_mutations += 1;
            OptimisticWrite {
                previous,
                applied_version,
                incarnation: entry.incarnation,
            }
        };
        self.subscribers.notify(key);
        Ok(write)
    }

    /// Compare-and-skip rollback: restore `snapshot` only if the entry is
    /// still at `applied_version`.
    pub(crate) fn restore_if_current(
        &self,
        key: &CacheKey,
        applied_version: Version,
        snapshot: entry::Snapshot<V>,
    ) -> RollbackOutcome {
        let outcome = {
            let mut state = rw_write(&self.state, SOURCE, "restore_if_current");
            let current_version = state.current_version(key);
            match state.entries.get_mut(key) {
                Some(entry) if current_version == applied_version => {
                    RollbackOutcome::Restored {
                        version: entry::restore(entry, snapshot),
                    }
                }
                _ => RollbackOutcome::SkippedStale {
                    applied_version,
                    current_version,
                },
            }
        };
        if matches!(outcome, RollbackOutcome::Restored { .. }) {
            self.subscribers.notify(key);
        }
        outcome
    }

    /// Count one pending mutation as finished, returning how many remain.
    ///
    /// Returns `None` when the entry the mutation wrote to is gone: removed,
    /// or removed and created again. A later entry's count is never touched.
    pub(crate) fn settle(&self, key: &CacheKey, incarnation: Incarnation) -> Option<u32> {
        let mut state = rw_write(&self.state, SOURCE, "settle");
        let entry = state
            .entries
            .get_mut(key)
            .filter(|entry| entry.incarnation == incarnation)?;
        entry.pending_mutations = entry.pending_mutations.saturating_sub(1);
        Some(entry.pending_mutations)
    }
}

impl<V: Clone> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
