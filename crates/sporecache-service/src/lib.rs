//! In-process data freshness for the research portal.
//!
//! Two independent pieces live here:
//!
//! - [`caching`]: a keyed stale-while-revalidate [`ResourceCache`](caching::ResourceCache) that
//!   deduplicates concurrent fetches, serves last-known-good data under failure and
//!   garbage-collects abandoned entries.
//! - [`polling`]: a [`CompletionPoller`](polling::CompletionPoller) that keeps re-fetching a
//!   record which came back incomplete, with capped exponential backoff and a bounded budget.
//!
//! Both are driven by an injectable [`Scheduler`](scheduler::Scheduler), so tests can run on
//! paused tokio time.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod polling;
pub mod scheduler;
pub mod utils;
