//! Read side of the cache: freshness-aware reads, ticketed fetches and the
//! refetch consumer.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant as WallInstant;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::entry::{CacheEntry, Freshness};
use super::keys::CacheKey;
use super::planner::RefetchPlan;
use super::refetch::{RefetchQueue, RefetchReason};
use super::retry::Retryable;
use super::store::{CacheStore, FetchOutcome};

pub(crate) const METRIC_CACHE_READ_TOTAL: &str = "optimist_cache_read_total";
pub(crate) const METRIC_REFETCH_BATCH_MS: &str = "optimist_refetch_batch_ms";

/// A cached entry as seen by one reader.
#[derive(Debug, Clone)]
pub struct QueryRead<V> {
    pub entry: Option<CacheEntry<V>>,
    pub freshness: Freshness,
}

impl<V> QueryRead<V> {
    pub fn data(&self) -> Option<&V> {
        self.entry.as_ref().and_then(|entry| entry.data.as_ref())
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

/// Counters from one refetch consumption.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefetchReport {
    pub planned: usize,
    pub written: usize,
    pub cancelled: usize,
    pub deferred: usize,
    pub failed: usize,
}

pub struct QueryClient<V> {
    store: Arc<CacheStore<V>>,
    refetches: Arc<RefetchQueue>,
    config: CacheConfig,
}

impl<V: Clone> QueryClient<V> {
    pub fn new(store: Arc<CacheStore<V>>, refetches: Arc<RefetchQueue>, config: CacheConfig) -> Self {
        Self {
            store,
            refetches,
            config,
        }
    }

    /// Read `key`, scheduling a background refetch unless the entry is fresh.
    pub fn read(&self, key: &CacheKey) -> QueryRead<V> {
        let entry = self.store.get(key);
        let freshness = entry.as_ref().map_or(Freshness::Missing, |entry| {
            entry.freshness(self.config.stale_time(), Instant::now())
        });

        match freshness {
            Freshness::Fresh => {}
            Freshness::Stale => {
                self.refetches.publish(key.clone(), RefetchReason::StaleRead);
            }
            Freshness::Missing => {
                self.refetches.publish(key.clone(), RefetchReason::Missing);
            }
        }
        counter!(METRIC_CACHE_READ_TOTAL, "freshness" => freshness_label(freshness)).increment(1);

        QueryRead { entry, freshness }
    }

    /// Run one fetch for `key` and store its result unless a mutation
    /// cancelled the fetch or is still pending.
    #[instrument(skip_all, fields(cache_key = %key))]
    pub async fn fetch<E, Fut>(&self, key: &CacheKey, fetch: Fut) -> Result<FetchOutcome, E>
    where
        Fut: Future<Output = Result<V, E>>,
    {
        let ticket = self.store.begin_fetch(key);
        let data = fetch.await?;
        Ok(self.store.complete_fetch(&ticket, data))
    }

    /// Like [`fetch`](Self::fetch), retrying retryable errors with the
    /// configured query backoff. A mutation between attempts still cancels
    /// the whole fetch.
    pub async fn fetch_with_retry<E, F, Fut>(
        &self,
        key: &CacheKey,
        mut fetch: F,
    ) -> Result<FetchOutcome, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Retryable + std::fmt::Display,
    {
        self.fetch(key, self.config.query_retry.run(|_| fetch())).await
    }

    /// Drain up to `refetch_batch_limit` queued requests and fetch each
    /// distinct key with `fetcher`, retrying per the query backoff.
    ///
    /// Keys with pending mutations are skipped; settling the last mutation
    /// queues a fresh request for them.
    pub async fn consume_refetches<E, F, Fut>(&self, mut fetcher: F) -> RefetchReport
    where
        F: FnMut(CacheKey) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Retryable + std::fmt::Display,
    {
        let requests = self
            .refetches
            .drain(self.config.refetch_batch_limit_non_zero());
        if requests.is_empty() {
            return RefetchReport::default();
        }

        let started_at = WallInstant::now();
        let plan = RefetchPlan::from_requests(requests);
        let mut report = RefetchReport {
            planned: plan.len(),
            ..RefetchReport::default()
        };
        debug!(%plan, "Refetch plan created");

        for planned in plan.refetches {
            if self
                .store
                .get(&planned.key)
                .is_some_and(|entry| entry.is_provisional())
            {
                report.deferred += 1;
                continue;
            }

            let outcome = self
                .fetch_with_retry(&planned.key, || fetcher(planned.key.clone()))
                .await;
            match outcome {
                Ok(FetchOutcome::Written(_)) => report.written += 1,
                Ok(FetchOutcome::Cancelled) => report.cancelled += 1,
                Ok(FetchOutcome::Deferred) => report.deferred += 1,
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        cache_key = %planned.key,
                        reasons = ?planned.reasons,
                        error = %error,
                        "Refetch failed"
                    );
                }
            }
        }

        histogram!(METRIC_REFETCH_BATCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            planned = report.planned,
            written = report.written,
            cancelled = report.cancelled,
            deferred = report.deferred,
            failed = report.failed,
            "Refetch batch consumed"
        );
        report
    }
}

fn freshness_label(freshness: Freshness) -> &'static str {
    match freshness {
        Freshness::Fresh => "fresh",
        Freshness::Stale => "stale",
        Freshness::Missing => "missing",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache_key;
    use crate::remote::RemoteError;

    fn client(config: CacheConfig) -> (Arc<CacheStore<u32>>, Arc<RefetchQueue>, QueryClient<u32>) {
        let store = Arc::new(CacheStore::new());
        let queue = Arc::new(RefetchQueue::new());
        let client = QueryClient::new(Arc::clone(&store), Arc::clone(&queue), config);
        (store, queue, client)
    }

    #[tokio::test(start_paused = true)]
    async fn read_classifies_and_schedules_refetches() {
        let config = CacheConfig {
            stale_time_ms: 1_000,
            ..Default::default()
        };
        let (store, queue, client) = client(config);
        let key = cache_key!["teams", "org-1"];

        assert_eq!(client.read(&key).freshness, Freshness::Missing);
        assert_eq!(queue.count(&key, RefetchReason::Missing), 1);

        store.set(&key, 7);
        let read = client.read(&key);
        assert!(read.is_fresh());
        assert_eq!(read.data(), Some(&7));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(client.read(&key).freshness, Freshness::Stale);
        assert_eq!(queue.count(&key, RefetchReason::StaleRead), 1);
    }

    #[tokio::test]
    async fn fetch_writes_and_clears_stale() {
        let (store, _queue, client) = client(CacheConfig::default());
        let key = cache_key!["teams", "org-1"];
        store.set(&key, 1);
        store.mark_stale(&key);

        let outcome = client
            .fetch(&key, async { Ok::<_, RemoteError>(2) })
            .await
            .expect("fetch");

        assert_eq!(outcome, FetchOutcome::Written(2));
        assert!(!store.get(&key).expect("entry").stale);
    }

    #[tokio::test]
    async fn fetch_error_leaves_entry_alone() {
        let (store, _queue, client) = client(CacheConfig::default());
        let key = cache_key!["teams", "org-1"];
        store.set(&key, 1);

        let result = client
            .fetch(&key, async { Err::<u32, _>(RemoteError::network("offline")) })
            .await;

        assert!(result.is_err());
        assert_eq!(store.data(&key), Some(1));
    }

    #[tokio::test]
    async fn consume_dedupes_keys_and_skips_provisional() {
        let (store, queue, client) = client(CacheConfig::default());
        let busy = cache_key!["team", "t-1"];
        let idle = cache_key!["team", "t-2"];
        store
            .apply_optimistic(&busy, |_| Ok::<_, ()>(10))
            .expect("applied");
        queue.publish(idle.clone(), RefetchReason::StaleRead);
        queue.publish(idle.clone(), RefetchReason::Invalidated);
        queue.publish(busy.clone(), RefetchReason::StaleRead);

        let mut fetched = Vec::new();
        let report = client
            .consume_refetches(|key| {
                fetched.push(key);
                async { Ok::<_, RemoteError>(99) }
            })
            .await;

        assert_eq!(
            report,
            RefetchReport {
                planned: 2,
                written: 1,
                deferred: 1,
                ..RefetchReport::default()
            }
        );
        assert_eq!(fetched, vec![idle.clone()]);
        assert_eq!(store.data(&idle), Some(99));
        assert_eq!(store.data(&busy), Some(10));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn consume_counts_failures() {
        let (_store, queue, client) = client(CacheConfig::default());
        queue.publish(cache_key!["a"], RefetchReason::Missing);

        let report = client
            .consume_refetches(|_| async { Err::<u32, _>(RemoteError::from_status(500, "")) })
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_retries_server_errors() {
        let (store, queue, client) = client(CacheConfig::default());
        let key = cache_key!["resources", "acc-1"];
        queue.publish(key.clone(), RefetchReason::Missing);

        let mut attempts = 0;
        let report = client
            .consume_refetches(|_| {
                attempts += 1;
                let attempt = attempts;
                async move {
                    if attempt < 3 {
                        Err(RemoteError::from_status(503, "unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(attempts, 3);
        assert_eq!(report.written, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(store.data(&key), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_does_not_retry_not_found() {
        let (store, queue, client) = client(CacheConfig::default());
        let key = cache_key!["resources", "gone"];
        queue.publish(key.clone(), RefetchReason::Missing);

        let mut attempts = 0;
        let report = client
            .consume_refetches(|_| {
                attempts += 1;
                async { Err::<u32, _>(RemoteError::from_status(404, "")) }
            })
            .await;

        assert_eq!(attempts, 1);
        assert_eq!(report.failed, 1);
        assert!(store.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_with_retry_honours_policy_limit() {
        let config = CacheConfig {
            query_retry: crate::cache::RetryPolicy {
                max_retries: 1,
                ..crate::cache::RetryPolicy::query_default()
            },
            ..Default::default()
        };
        let (_store, _queue, client) = client(config);
        let key = cache_key!["teams", "org-1"];

        let mut attempts = 0;
        let result = client
            .fetch_with_retry(&key, || {
                attempts += 1;
                async { Err::<u32, _>(RemoteError::network("offline")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }
}
