//! Mutation bookkeeping: identifiers, lifecycle phases and the in-flight ledger.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use time::OffsetDateTime;
use uuid::Uuid;

use super::entry::{Incarnation, Snapshot, Version};
use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::mutation";

/// Unique identifier of one `mutate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of a mutation as recorded for rollback bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

/// Lifecycle state of a single mutation.
///
/// `Init → Snapshotted → OptimisticApplied → AwaitingRemote →
/// {Committed | RolledBack} → Settled`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Init,
    Snapshotted,
    OptimisticApplied,
    AwaitingRemote,
    Committed,
    RolledBack,
    Settled,
}

impl MutationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Snapshotted => "snapshotted",
            Self::OptimisticApplied => "optimistic_applied",
            Self::AwaitingRemote => "awaiting_remote",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Settled => "settled",
        }
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the cache when a remote write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The pre-mutation data was written back at `version`.
    Restored { version: Version },
    /// A later write superseded this mutation; the cache was left alone.
    SkippedStale {
        applied_version: Version,
        current_version: Version,
    },
}

impl RollbackOutcome {
    pub fn was_skipped(&self) -> bool {
        matches!(self, Self::SkippedStale { .. })
    }
}

/// Result of the atomic snapshot + optimistic write.
#[derive(Debug, Clone)]
pub(crate) struct OptimisticWrite<V> {
    pub previous: Snapshot<V>,
    pub applied_version: Version,
    pub incarnation: Incarnation,
}

/// Rollback bookkeeping for one mutation, retained until it settles.
#[derive(Debug, Clone)]
pub struct MutationRecord<V> {
    pub id: MutationId,
    pub key: CacheKey,
    pub previous_data: Option<V>,
    pub previous_version: Version,
    pub applied_version: Version,
    /// Entry lifetime the optimistic write landed in.
    pub incarnation: Incarnation,
    pub status: MutationStatus,
    pub phase: MutationPhase,
    pub started_at: OffsetDateTime,
}

impl<V> MutationRecord<V> {
    pub(crate) fn new(id: MutationId, key: CacheKey, write: OptimisticWrite<V>) -> Self {
        Self {
            id,
            key,
            previous_data: write.previous.data,
            previous_version: write.previous.version,
            applied_version: write.applied_version,
            incarnation: write.incarnation,
            status: MutationStatus::Pending,
            phase: MutationPhase::OptimisticApplied,
            started_at: OffsetDateTime::now_utc(),
        }
    }
}

/// In-flight mutation records keyed by id.
///
/// Removing a record is the settle token: only the caller that takes it out
/// may decrement the entry's pending count.
pub(crate) struct MutationLedger<V> {
    records: Mutex<HashMap<MutationId, MutationRecord<V>>>,
}

impl<V: Clone> MutationLedger<V> {
    pub(crate) fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, record: MutationRecord<V>) {
        mutex_lock(&self.records, SOURCE, "insert").insert(record.id, record);
    }

    /// Apply `f` to a live record. Returns false if it already settled.
    pub(crate) fn update(&self, id: MutationId, f: impl FnOnce(&mut MutationRecord<V>)) -> bool {
        match mutex_lock(&self.records, SOURCE, "update").get_mut(&id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Remove a record. Returns `None` on every call after the first.
    pub(crate) fn take(&self, id: MutationId) -> Option<MutationRecord<V>> {
        mutex_lock(&self.records, SOURCE, "take").remove(&id)
    }

    pub(crate) fn for_key(&self, key: &CacheKey) -> Vec<MutationRecord<V>> {
        let mut records: Vec<_> = mutex_lock(&self.records, SOURCE, "for_key")
            .values()
            .filter(|record| &record.key == key)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.applied_version);
        records
    }

    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.records, SOURCE, "len").len()
    }
}
