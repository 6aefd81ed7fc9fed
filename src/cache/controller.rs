//! Optimistic mutation controller.
//!
//! Drives one mutation through
//! `Init → Snapshotted → OptimisticApplied → AwaitingRemote →
//! {Committed | RolledBack} → Settled`. The remote write is the only
//! suspension point; everything else is a single store operation.
//!
//! Rollback is compare-and-skip: a failed mutation restores its snapshot only
//! if the entry is still at the version its optimistic write produced. A later
//! write (optimistic, confirmed or fetched) wins and the rollback is skipped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

use super::error::MutationError;
use super::invalidation::Invalidator;
use super::keys::{CacheKey, InvalidationTarget};
use super::mutation::{
    MutationId, MutationLedger, MutationPhase, MutationRecord, MutationStatus, RollbackOutcome,
};
use super::notices::{MutationNotices, NoticePhase, Notifier, TracingNotifier};
use super::refetch::{RefetchQueue, RefetchReason};
use super::store::CacheStore;

pub(crate) const METRIC_MUTATION_COMMITTED_TOTAL: &str = "optimist_mutation_committed_total";
pub(crate) const METRIC_MUTATION_ROLLED_BACK_TOTAL: &str = "optimist_mutation_rolled_back_total";
pub(crate) const METRIC_MUTATION_ROLLBACK_SKIPPED_TOTAL: &str =
    "optimist_mutation_rollback_skipped_total";
pub(crate) const METRIC_MUTATION_TRANSFORM_FAILED_TOTAL: &str =
    "optimist_mutation_transform_failed_total";
pub(crate) const METRIC_MUTATION_ABANDONED_TOTAL: &str = "optimist_mutation_abandoned_total";
pub(crate) const METRIC_REMOTE_WRITE_MS: &str = "optimist_remote_write_ms";

/// Per-call options: what to invalidate on success and which notices to show.
#[derive(Debug, Clone, Default)]
pub struct MutationOptions {
    pub invalidates: Vec<InvalidationTarget>,
    pub notices: MutationNotices,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(mut self, target: impl Into<InvalidationTarget>) -> Self {
        self.invalidates.push(target.into());
        self
    }

    pub fn notices(mut self, notices: MutationNotices) -> Self {
        self.notices = notices;
        self
    }
}

/// Orchestrates optimistic mutations against a shared [`CacheStore`].
pub struct MutationController<V> {
    store: Arc<CacheStore<V>>,
    invalidator: Arc<Invalidator<V>>,
    refetches: Arc<RefetchQueue>,
    notifier: Arc<dyn Notifier>,
    ledger: MutationLedger<V>,
}

impl<V: Clone> MutationController<V> {
    pub fn new(
        store: Arc<CacheStore<V>>,
        invalidator: Arc<Invalidator<V>>,
        refetches: Arc<RefetchQueue>,
    ) -> Self {
        Self {
            store,
            invalidator,
            refetches,
            notifier: Arc::new(TracingNotifier),
            ledger: MutationLedger::new(),
        }
    }

    /// Replace the default log-only notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    /// Unsettled mutations on `key`, oldest optimistic write first.
    pub fn in_flight(&self, key: &CacheKey) -> Vec<MutationRecord<V>> {
        self.ledger.for_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.ledger.len()
    }

    /// Apply `optimistic` to the cached value for `key`, run `remote_write`,
    /// then reconcile with the server result or roll back.
    ///
    /// Resolves to the server result, or to the caller's error wrapped in
    /// [`MutationError`]. The transform runs under the store lock and must not
    /// call back into the cache.
    #[instrument(skip_all, fields(cache_key = %key))]
    pub async fn mutate<A, E, T, W, Fut>(
        &self,
        key: CacheKey,
        variables: A,
        remote_write: W,
        optimistic: T,
        options: MutationOptions,
    ) -> Result<V, MutationError<E>>
    where
        T: FnOnce(&A, Option<&V>) -> Result<V, E>,
        W: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: fmt::Display,
    {
        let id = MutationId::new();
        debug!(mutation_id = %id, phase = %MutationPhase::Init, "Mutation started");

        // Reads still in flight must not land on top of the optimistic value.
        self.store.cancel_fetches(&key);

        let write = match self
            .store
            .apply_optimistic(&key, |previous| optimistic(&variables, previous))
        {
            Ok(write) => write,
            Err(error) => {
                counter!(METRIC_MUTATION_TRANSFORM_FAILED_TOTAL).increment(1);
                warn!(mutation_id = %id, error = %error, "Optimistic transform failed");
                return Err(MutationError::Transform(error));
            }
        };

        let previous = write.previous.clone();
        let applied_version = write.applied_version;
        debug!(
            mutation_id = %id,
            phase = %MutationPhase::Snapshotted,
            previous_version = previous.version,
            had_data = previous.data.is_some(),
            "Previous value captured"
        );
        debug!(
            mutation_id = %id,
            phase = %MutationPhase::OptimisticApplied,
            applied_version,
            incarnation = write.incarnation,
            "Optimistic value applied"
        );
        self.ledger.insert(MutationRecord::new(id, key.clone(), write));
        let guard = SettleGuard {
            controller: self,
            id,
            key: &key,
            settled: false,
        };
        self.emit(&options.notices, NoticePhase::Optimistic);

        self.ledger
            .update(id, |record| record.phase = MutationPhase::AwaitingRemote);
        let started_at = Instant::now();
        let result = remote_write(variables).await;
        histogram!(METRIC_REMOTE_WRITE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(server) => {
                let version = self.store.set(&key, server.clone());
                self.ledger.update(id, |record| {
                    record.status = MutationStatus::Committed;
                    record.phase = MutationPhase::Committed;
                });
                counter!(METRIC_MUTATION_COMMITTED_TOTAL).increment(1);
                info!(mutation_id = %id, version, "Mutation committed");

                if !options.invalidates.is_empty() {
                    self.invalidator.invalidate(options.invalidates);
                }
                self.emit(&options.notices, NoticePhase::Success);
                guard.settle();
                Ok(server)
            }
            Err(error) => {
                let rollback = self.store.restore_if_current(&key, applied_version, previous);
                self.ledger.update(id, |record| {
                    record.status = MutationStatus::RolledBack;
                    record.phase = MutationPhase::RolledBack;
                });
                match rollback {
                    RollbackOutcome::Restored { version } => {
                        counter!(METRIC_MUTATION_ROLLED_BACK_TOTAL).increment(1);
                        info!(mutation_id = %id, version, error = %error, "Mutation rolled back");
                    }
                    RollbackOutcome::SkippedStale {
                        applied_version,
                        current_version,
                    } => {
                        counter!(METRIC_MUTATION_ROLLBACK_SKIPPED_TOTAL).increment(1);
                        warn!(
                            mutation_id = %id,
                            applied_version,
                            current_version,
                            error = %error,
                            "Rollback skipped; a newer write superseded this mutation"
                        );
                    }
                }
                self.emit(&options.notices, NoticePhase::Error);
                guard.settle();
                Err(MutationError::RemoteWrite {
                    source: error,
                    rollback,
                })
            }
        }
    }

    fn emit(&self, notices: &MutationNotices, phase: NoticePhase) {
        if let Some(notice) = notices.for_phase(phase) {
            self.notifier.notify(phase, notice);
        }
    }

    /// Finish a mutation exactly once. The ledger removal is the token: a
    /// second call for the same id does nothing.
    fn settle(&self, id: MutationId, key: &CacheKey, reason: RefetchReason) {
        let Some(record) = self.ledger.take(id) else {
            return;
        };

        let Some(remaining) = self.store.settle(key, record.incarnation) else {
            // The entry was removed under the mutation; any entry now at `key`
            // belongs to later writers and keeps its own count.
            debug!(
                mutation_id = %id,
                phase = %MutationPhase::Settled,
                status = ?record.status,
                "Mutation settled after its entry was removed"
            );
            return;
        };
        debug!(
            mutation_id = %id,
            phase = %MutationPhase::Settled,
            status = ?record.status,
            remaining,
            "Mutation settled"
        );

        if remaining == 0 {
            self.store.mark_stale(key);
            self.refetches.publish(key.clone(), reason);
        }
    }
}

/// Settles the mutation even if the `mutate` future is dropped or panics
/// while awaiting the remote write.
struct SettleGuard<'a, V: Clone> {
    controller: &'a MutationController<V>,
    id: MutationId,
    key: &'a CacheKey,
    settled: bool,
}

impl<V: Clone> SettleGuard<'_, V> {
    fn settle(mut self) {
        self.settled = true;
        self.controller
            .settle(self.id, self.key, RefetchReason::Settled);
    }
}

impl<V: Clone> Drop for SettleGuard<'_, V> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        counter!(METRIC_MUTATION_ABANDONED_TOTAL).increment(1);
        warn!(
            mutation_id = %self.id,
            cache_key = %self.key,
            "Mutation abandoned before the remote write resolved"
        );
        self.controller
            .settle(self.id, self.key, RefetchReason::Abandoned);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::notices::Notice;
    use crate::cache_key;
    use crate::remote::RemoteError;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<NoticePhase>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, phase: NoticePhase, _notice: &Notice) {
            self.seen.lock().expect("seen").push(phase);
        }
    }

    fn controller() -> (MutationController<String>, Arc<RefetchQueue>) {
        let store = Arc::new(CacheStore::new());
        let queue = Arc::new(RefetchQueue::new());
        let invalidator = Arc::new(Invalidator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            &CacheConfig::default(),
        ));
        (
            MutationController::new(store, invalidator, Arc::clone(&queue)),
            queue,
        )
    }

    fn replace(vars: &String, _prev: Option<&String>) -> Result<String, RemoteError> {
        Ok(vars.clone())
    }

    #[tokio::test]
    async fn success_replaces_optimistic_value_with_server_result() {
        let (controller, queue) = controller();
        let key = cache_key!["team", "t-1"];
        controller.store().set(&key, "A".to_string());

        let result = controller
            .mutate(
                key.clone(),
                "B".to_string(),
                |vars| async move { Ok::<_, RemoteError>(format!("{vars}-server")) },
                replace,
                MutationOptions::new().notices(MutationNotices::none()),
            )
            .await;

        assert_eq!(result.expect("committed"), "B-server");
        let entry = controller.store().get(&key).expect("entry");
        assert_eq!(entry.data.as_deref(), Some("B-server"));
        assert_eq!(entry.version, 3);
        assert_eq!(entry.pending_mutations, 0);
        assert!(entry.stale);
        assert_eq!(queue.count(&key, RefetchReason::Settled), 1);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn failure_restores_snapshot() {
        let (controller, _queue) = controller();
        let key = cache_key!["team", "t-1"];
        controller.store().set(&key, "A".to_string());

        let error = controller
            .mutate(
                key.clone(),
                "B".to_string(),
                |_vars| async { Err::<String, _>(RemoteError::from_status(500, "down")) },
                replace,
                MutationOptions::default(),
            )
            .await
            .expect_err("remote write fails");

        assert_eq!(error.rollback(), Some(RollbackOutcome::Restored { version: 3 }));
        assert_eq!(error.source_error().status, Some(500));
        assert_eq!(controller.store().data(&key).as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn failed_transform_writes_nothing() {
        let (controller, queue) = controller();
        let key = cache_key!["team", "t-1"];
        controller.store().set(&key, "A".to_string());
        let before = controller.store().get(&key);

        let error = controller
            .mutate(
                key.clone(),
                "B".to_string(),
                |_vars| async { Ok::<String, RemoteError>("never".to_string()) },
                |_vars, _prev| Err(RemoteError::validation("bad input")),
                MutationOptions::default(),
            )
            .await
            .expect_err("transform fails");

        assert!(error.is_transform());
        assert_eq!(controller.store().get(&key), before);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn success_runs_invalidation() {
        let (controller, _queue) = controller();
        let key = cache_key!["cloud-account", "acc-1"];
        let list = cache_key!["cloud-accounts", "org-1"];
        controller.store().set(&list, "[acc-1]".to_string());

        controller
            .mutate(
                key,
                "renamed".to_string(),
                |vars| async move { Ok::<_, RemoteError>(vars) },
                replace,
                MutationOptions::new().invalidate(InvalidationTarget::prefix(cache_key![
                    "cloud-accounts"
                ])),
            )
            .await
            .expect("committed");

        assert!(controller.store().get(&list).expect("list").stale);
    }

    #[tokio::test]
    async fn failure_skips_invalidation() {
        let (controller, _queue) = controller();
        let list = cache_key!["cloud-accounts", "org-1"];
        controller.store().set(&list, "[acc-1]".to_string());

        let _ = controller
            .mutate(
                cache_key!["cloud-account", "acc-1"],
                "renamed".to_string(),
                |_vars| async { Err::<String, _>(RemoteError::network("offline")) },
                replace,
                MutationOptions::new().invalidate(list.clone()),
            )
            .await;

        assert!(!controller.store().get(&list).expect("list").stale);
    }

    #[tokio::test]
    async fn notices_follow_lifecycle() {
        let (controller, _queue) = controller();
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = controller.with_notifier(notifier.clone());
        let key = cache_key!["team", "t-1"];

        controller
            .mutate(
                key.clone(),
                "B".to_string(),
                |vars| async move { Ok::<_, RemoteError>(vars) },
                replace,
                MutationOptions::default(),
            )
            .await
            .expect("committed");
        let _ = controller
            .mutate(
                key,
                "C".to_string(),
                |_vars| async { Err::<String, _>(RemoteError::network("offline")) },
                replace,
                MutationOptions::new().notices(MutationNotices::default().optimistic(None)),
            )
            .await;

        assert_eq!(
            *notifier.seen.lock().expect("seen"),
            vec![
                NoticePhase::Optimistic,
                NoticePhase::Success,
                NoticePhase::Error
            ]
        );
    }

    #[tokio::test]
    async fn dropped_mutation_settles_and_requests_refetch() {
        let (controller, queue) = controller();
        let key = cache_key!["team", "t-1"];
        controller.store().set(&key, "A".to_string());
        let (_tx, rx) = oneshot::channel::<Result<String, RemoteError>>();

        let pending = controller.mutate(
            key.clone(),
            "B".to_string(),
            move |_vars| async move { rx.await.unwrap_or_else(|_| Err(RemoteError::network("closed"))) },
            replace,
            MutationOptions::default(),
        );
        tokio::select! {
            biased;
            _ = pending => panic!("remote write never resolves"),
            _ = tokio::task::yield_now() => {}
        }

        let entry = controller.store().get(&key).expect("entry");
        assert_eq!(entry.pending_mutations, 0);
        assert_eq!(entry.data.as_deref(), Some("B"));
        assert!(entry.stale);
        assert_eq!(queue.count(&key, RefetchReason::Abandoned), 1);
        assert_eq!(controller.in_flight_count(), 0);
    }
}
