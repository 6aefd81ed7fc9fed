//! Cache configuration.
//!
//! Built from the `[cache]` section of `optimist.toml`.

use std::time::Duration;

use serde::Deserialize;

use super::retry::RetryPolicy;

// Default values for cache configuration
const DEFAULT_STALE_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_REFETCH_QUEUE_LIMIT: usize = 1024;
const DEFAULT_REFETCH_BATCH_LIMIT: usize = 100;

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age (ms) after which non-invalidated data is no longer fresh.
    pub stale_time_ms: u64,
    /// Maximum queued refetch requests before the oldest is dropped.
    pub refetch_queue_limit: usize,
    /// Maximum requests drained per refetch consumption.
    pub refetch_batch_limit: usize,
    /// Immediately refetch invalidated keys that have live subscribers.
    pub refetch_active_on_invalidate: bool,
    /// Backoff for read fetches; comes from the `[retry]` section.
    #[serde(skip)]
    pub query_retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            refetch_queue_limit: DEFAULT_REFETCH_QUEUE_LIMIT,
            refetch_batch_limit: DEFAULT_REFETCH_BATCH_LIMIT,
            refetch_active_on_invalidate: true,
            query_retry: RetryPolicy::query_default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            stale_time_ms: u64::try_from(settings.stale_time.as_millis()).unwrap_or(u64::MAX),
            refetch_queue_limit: settings.refetch_queue_limit.get(),
            refetch_batch_limit: settings.refetch_batch_limit.get(),
            refetch_active_on_invalidate: settings.refetch_active_on_invalidate,
            query_retry: RetryPolicy::query_default(),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            query_retry: settings.retry.query_policy(),
            ..Self::from(&settings.cache)
        }
    }
}

impl CacheConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    /// Returns the refetch batch limit, clamping to 1 if zero.
    pub fn refetch_batch_limit_non_zero(&self) -> usize {
        self.refetch_batch_limit.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.stale_time(), Duration::from_secs(300));
        assert_eq!(config.refetch_queue_limit, 1024);
        assert_eq!(config.refetch_batch_limit, 100);
        assert!(config.refetch_active_on_invalidate);
        assert_eq!(config.query_retry.max_retries, 3);
    }

    #[test]
    fn batch_limit_clamps_to_one() {
        let config = CacheConfig {
            refetch_batch_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.refetch_batch_limit_non_zero(), 1);
    }
}
