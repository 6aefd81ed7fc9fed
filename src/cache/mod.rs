//! Optimistic query cache.
//!
//! A keyed in-memory store of server results that mutations update
//! optimistically before the server confirms them:
//!
//! - **Store**: versioned entries, subscriptions and ticketed fetches
//! - **Mutations**: snapshot, optimistic apply, remote write, then commit or
//!   version-guarded rollback
//! - **Invalidation**: related keys are marked stale after a commit and
//!   refetched through the refetch queue
//!
//! ## Configuration
//!
//! Controlled via the `[cache]` section of `optimist.toml`:
//!
//! ```toml
//! [cache]
//! stale_time_seconds = 300
//! refetch_queue_limit = 1024
//! refetch_batch_limit = 100
//! refetch_active_on_invalidate = true
//! ```

mod config;
mod controller;
mod entry;
mod error;
mod invalidation;
mod keys;
mod lock;
mod mutation;
mod notices;
mod planner;
mod query;
mod refetch;
mod retry;
mod store;
mod subscribers;

use std::sync::Arc;

pub use config::CacheConfig;
pub use controller::{MutationController, MutationOptions};
pub use entry::{CacheEntry, Freshness, Snapshot, Version, restore, snapshot};
pub use error::MutationError;
pub use invalidation::Invalidator;
pub use keys::{CacheKey, InvalidationTarget, KeySegment};
pub use mutation::{MutationId, MutationPhase, MutationRecord, MutationStatus, RollbackOutcome};
pub use notices::{MutationNotices, Notice, NoticePhase, Notifier, TracingNotifier};
pub use planner::{PlannedRefetch, RefetchPlan};
pub use query::{QueryClient, QueryRead, RefetchReport};
pub use refetch::{Epoch, RefetchQueue, RefetchReason, RefetchRequest};
pub use retry::{RetryPolicy, Retryable};
pub use store::{CacheStore, FetchOutcome, FetchTicket};
pub use subscribers::{Listener, Subscription};

pub(crate) mod metric_names {
    pub(crate) use super::controller::{
        METRIC_MUTATION_ABANDONED_TOTAL, METRIC_MUTATION_COMMITTED_TOTAL,
        METRIC_MUTATION_ROLLBACK_SKIPPED_TOTAL, METRIC_MUTATION_ROLLED_BACK_TOTAL,
        METRIC_MUTATION_TRANSFORM_FAILED_TOTAL, METRIC_REMOTE_WRITE_MS,
    };
    pub(crate) use super::query::{METRIC_CACHE_READ_TOTAL, METRIC_REFETCH_BATCH_MS};
    pub(crate) use super::refetch::{METRIC_REFETCH_DROPPED_TOTAL, METRIC_REFETCH_QUEUE_LEN};
}

/// One store with its mutation controller, read client and invalidator wired
/// to a shared refetch queue.
pub struct QueryCache<V> {
    store: Arc<CacheStore<V>>,
    refetches: Arc<RefetchQueue>,
    invalidator: Arc<Invalidator<V>>,
    controller: MutationController<V>,
    queries: QueryClient<V>,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new());
        let refetches = Arc::new(RefetchQueue::with_limit(config.refetch_queue_limit));
        let invalidator = Arc::new(Invalidator::new(
            Arc::clone(&store),
            Arc::clone(&refetches),
            &config,
        ));
        let controller = MutationController::new(
            Arc::clone(&store),
            Arc::clone(&invalidator),
            Arc::clone(&refetches),
        );
        let queries = QueryClient::new(Arc::clone(&store), Arc::clone(&refetches), config);

        Self {
            store,
            refetches,
            invalidator,
            controller,
            queries,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.controller = self.controller.with_notifier(notifier);
        self
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    pub fn controller(&self) -> &MutationController<V> {
        &self.controller
    }

    pub fn queries(&self) -> &QueryClient<V> {
        &self.queries
    }

    pub fn invalidator(&self) -> &Arc<Invalidator<V>> {
        &self.invalidator
    }

    pub fn refetches(&self) -> &Arc<RefetchQueue> {
        &self.refetches
    }
}

impl<V: Clone> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
