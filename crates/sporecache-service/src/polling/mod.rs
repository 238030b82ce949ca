//! Re-fetching of records that are still being filled in by the backend.
//!
//! Some backends answer with a placeholder first and enrich the record asynchronously. A
//! [`CompletionPoller`] fetches its target once, asks a caller-supplied predicate whether the
//! payload is still incomplete, and if so keeps fetching with capped exponential backoff until the
//! record is complete or the attempt budget is used up.
//!
//! Giving up is not an error: [`PollState::gave_up`] is set and the last incomplete payload stays
//! visible.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::caching::FetchError;

mod poller;


pub use poller::CompletionPoller;

/// Growth factor of the delay between two polls.
const BACKOFF_FACTOR: f64 = 1.8;

/// Budget and pacing of a [`CompletionPoller`].
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct PollerOptions {
    /// Number of polls after the initial fetch before giving up.
    pub max_attempts: u32,

    /// Delay before the first poll.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for the delay between two polls.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl PollerOptions {
    /// The delay before the poll that follows `attempt`: `min(base_delay * 1.8^attempt, max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * BACKOFF_FACTOR.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// What the consumer of a [`CompletionPoller`] sees.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState<T> {
    /// The last fetched payload, complete or not.
    pub data: Option<T>,
    /// The initial fetch for the current target is running.
    pub loading: bool,
    /// The payload is incomplete and another poll is pending or running.
    pub retrying: bool,
    /// Number of polls that have fired for the current target. The initial fetch is attempt 0.
    pub attempt: u32,
    /// The attempt budget ran out while the payload was still incomplete.
    pub gave_up: bool,
    /// The error of the last failed fetch.
    pub error: Option<FetchError>,
}

impl<T> Default for PollState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            retrying: false,
            attempt: 0,
            gave_up: false,
            error: None,
        }
    }
}

impl<T> PollState<T> {
    /// Whether no further fetch will happen for the current target.
    pub fn is_settled(&self) -> bool {
        !self.loading && !self.retrying
    }
}
