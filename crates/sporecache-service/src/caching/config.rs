use std::time::Duration;

use crate::config::CacheConfig;

/// Per-request cache behavior.
///
/// This is supplied by every consumer and is not stored with the entry: two consumers of the same
/// key may use different staleness windows. See [`ResourceCache`](super::ResourceCache) for how
/// competing `cache_time` values are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    /// Age after which the entry is served stale and revalidated in the background.
    pub stale_time: Duration,
    /// Age after which the entry may be garbage collected.
    pub cache_time: Duration,
    /// Revalidate a stale subscription on [`Trigger::Focus`](super::Trigger::Focus).
    pub revalidate_on_focus: bool,
    /// Revalidate a stale subscription on [`Trigger::Reconnect`](super::Trigger::Reconnect).
    pub revalidate_on_reconnect: bool,
    /// Number of retries after a failed fetch.
    pub retry_count: u32,
    /// The `n`th retry waits `retry_delay * n`.
    pub retry_delay: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        CacheConfig::default().query()
    }
}

impl QueryConfig {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }
}
