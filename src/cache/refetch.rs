//! Background refetch requests.
//!
//! Settling mutations, invalidations and stale reads publish requests here;
//! the read client drains and executes them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::refetch";
const DEFAULT_QUEUE_LIMIT: usize = 1024;
pub(crate) const METRIC_REFETCH_QUEUE_LEN: &str = "optimist_refetch_queue_len";
pub(crate) const METRIC_REFETCH_DROPPED_TOTAL: &str = "optimist_refetch_dropped_total";

/// Monotonic sequence number for ordering requests within this process.
pub type Epoch = u64;

/// Why a key should be re-read from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefetchReason {
    /// The last pending mutation on the key settled.
    Settled,
    /// A caller dropped an in-flight mutation; the outcome is unknown.
    Abandoned,
    /// The key was invalidated while someone was subscribed to it.
    Invalidated,
    /// A reader saw stale or aged data.
    StaleRead,
    /// A reader found nothing cached.
    Missing,
}

impl RefetchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settled => "settled",
            Self::Abandoned => "abandoned",
            Self::Invalidated => "invalidated",
            Self::StaleRead => "stale_read",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for RefetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RefetchRequest {
    pub id: Uuid,
    pub epoch: Epoch,
    pub key: CacheKey,
    pub reason: RefetchReason,
    pub requested_at: OffsetDateTime,
}

/// Bounded FIFO of refetch requests. Overflow drops the oldest request.
pub struct RefetchQueue {
    queue: Mutex<VecDeque<RefetchRequest>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl RefetchQueue {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_QUEUE_LIMIT)
    }

    /// Create a queue holding at most `limit` requests (clamped to 1).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue a refetch of `key`.
    pub fn publish(&self, key: CacheKey, reason: RefetchReason) -> Epoch {
        let epoch = self.next_epoch();
        let request = RefetchRequest {
            id: Uuid::new_v4(),
            epoch,
            key,
            reason,
            requested_at: OffsetDateTime::now_utc(),
        };

        debug!(
            request_id = %request.id,
            epoch,
            cache_key = %request.key,
            reason = %reason,
            "Refetch requested"
        );

        let len = {
            let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
            if queue.len() >= self.limit
                && let Some(dropped) = queue.pop_front()
            {
                warn!(
                    cache_key = %dropped.key,
                    epoch = dropped.epoch,
                    limit = self.limit,
                    "Refetch queue full; dropped oldest request"
                );
                counter!(METRIC_REFETCH_DROPPED_TOTAL).increment(1);
            }
            queue.push_back(request);
            queue.len()
        };
        gauge!(METRIC_REFETCH_QUEUE_LEN).set(len as f64);
        epoch
    }

    /// Remove up to `limit` requests in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<RefetchRequest> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_REFETCH_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    /// Number of queued requests for `key` with the given reason.
    pub fn count(&self, key: &CacheKey, reason: RefetchReason) -> usize {
        mutex_lock(&self.queue, SOURCE, "count")
            .iter()
            .filter(|request| &request.key == key && request.reason == reason)
            .count()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_REFETCH_QUEUE_LEN).set(0.0);
    }
}

impl Default for RefetchQueue {
    fn default() -> Self {
        Self::new()
    }
}
