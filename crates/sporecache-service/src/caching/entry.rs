use std::time::Duration;

use tokio::time::Instant;

use super::FetchError;

/// The last successfully fetched value for a key.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub data: T,
    /// When `data` was written, either by a fetch or by a mutation.
    pub timestamp: Instant,
    /// The error of the last failed revalidation, if any.
    ///
    /// This never hides `data`, it is only kept for diagnostics.
    pub error: Option<FetchError>,
}

impl<T> CacheEntry<T> {
    pub(super) fn new(data: T, timestamp: Instant) -> Self {
        Self {
            data,
            timestamp,
            error: None,
        }
    }

    /// How long ago this entry was written.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    /// Whether the entry is older than `stale_time`.
    pub fn is_stale(&self, stale_time: Duration, now: Instant) -> bool {
        self.age(now) > stale_time
    }
}

/// What a consumer currently sees for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// The cached value, possibly stale.
    pub data: Option<T>,
    /// The last fetch error.
    ///
    /// When `data` is present as well, the consumer is being served last-known-good data.
    pub error: Option<FetchError>,
    /// No data is available yet and a fetch is running.
    pub is_loading: bool,
    /// A fetch for this key is running.
    pub is_validating: bool,
    /// `data` is older than the consumer's `stale_time`.
    pub is_stale: bool,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_validating: false,
            is_stale: false,
        }
    }
}

impl<T: Clone> Snapshot<T> {
    pub(super) fn build(
        entry: Option<&CacheEntry<T>>,
        is_validating: bool,
        stale_time: Duration,
        now: Instant,
    ) -> Self {
        match entry {
            Some(entry) => Self {
                data: Some(entry.data.clone()),
                error: entry.error.clone(),
                is_loading: false,
                is_validating,
                is_stale: entry.is_stale(stale_time, now),
            },
            None => Self {
                is_loading: is_validating,
                is_validating,
                ..Default::default()
            },
        }
    }
}
