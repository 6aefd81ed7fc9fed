//! Cache entry model plus the snapshot/restore pair used for rollback.

use tokio::time::{Duration, Instant};

/// Per-key write counter. Strictly increases on every write to a key.
pub type Version = u64;

/// Identifies one lifetime of an entry, from creation to delete or clear.
pub type Incarnation = u64;

/// One cached result set as observed by readers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    /// Last known value, either server-confirmed or optimistic.
    pub data: Option<V>,
    /// Bumped by every optimistic apply, confirmed write, rollback and fetch.
    pub version: Version,
    /// In-flight mutations touching this entry; non-zero means provisional.
    pub pending_mutations: u32,
    /// Set by invalidation, cleared only by a completed fetch.
    pub stale: bool,
    /// When `data` was last written.
    pub updated_at: Instant,
    /// Changes whenever the entry is removed and created again.
    pub incarnation: Incarnation,
}

impl<V> CacheEntry<V> {
    pub(crate) fn empty(version_floor: Version) -> Self {
        Self {
            data: None,
            version: version_floor,
            pending_mutations: 0,
            stale: false,
            updated_at: Instant::now(),
            incarnation: 0,
        }
    }

    /// Overwrite the data and bump the version, returning the new version.
    pub(crate) fn write(&mut self, data: Option<V>) -> Version {
        self.data = data;
        self.version += 1;
        self.updated_at = Instant::now();
        self.version
    }

    /// True while at least one mutation on this entry is unsettled.
    pub fn is_provisional(&self) -> bool {
        self.pending_mutations > 0
    }

    /// Classify the entry for a reader that tolerates `stale_time` of age.
    pub fn freshness(&self, stale_time: Duration, now: Instant) -> Freshness {
        if self.data.is_none() {
            Freshness::Missing
        } else if self.stale || now.saturating_duration_since(self.updated_at) >= stale_time {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

/// How much a reader can trust a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Readable, but a background refetch should run.
    Stale,
    /// Nothing cached yet.
    Missing,
}

/// Copy of an entry's data taken before an optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<V> {
    pub data: Option<V>,
    pub version: Version,
}

/// Capture the data and version of an entry; an absent entry snapshots as empty.
pub fn snapshot<V: Clone>(entry: Option<&CacheEntry<V>>) -> Snapshot<V> {
    match entry {
        Some(entry) => Snapshot {
            data: entry.data.clone(),
            version: entry.version,
        },
        None => Snapshot {
            data: None,
            version: 0,
        },
    }
}

/// Write a snapshot's data back into an entry.
///
/// Restoring is itself a write: the version moves forward, never back to the
/// snapshot's version.
pub fn restore<V>(entry: &mut CacheEntry<V>, snapshot: Snapshot<V>) -> Version {
    entry.write(snapshot.data)
}
