//! Stale-while-revalidate caching of remote resources.
//!
//! # Freshness
//!
//! Every consumer asks for a key together with a [`QueryConfig`]. The entry is
//!
//! - *fresh* while its age does not exceed the consumer's `stale_time`. It is served as is and no
//!   fetch happens.
//! - *stale* once it is older than that. It is still served right away, and a background
//!   revalidation replaces it when the fetch completes.
//! - *expired* once it is older than its effective `cache_time`. The periodic sweep removes it and
//!   the next consumer has to wait for a fetch again.
//!
//! # Deduplication
//!
//! There is at most one fetch per key in flight. Every consumer, revalidation, trigger and
//! prefetch for that key waits on the same shared channel and observes the same result.
//!
//! # Failures
//!
//! A failed fetch is retried `retry_count` times, the `n`th retry waiting `retry_delay * n`. If
//! all attempts fail and the key has data, the data is kept and the error is only recorded next to
//! it. Without data the error is surfaced to the waiting consumers, and the next request for the
//! key fetches again.
//!
//! # Subscriptions
//!
//! [`ResourceCache::subscribe`] registers a callback that receives a [`Snapshot`] whenever the
//! entry for its key changes. Subscriptions can opt into revalidation on [`Trigger`]s, which the
//! embedding application raises through [`ResourceCache::trigger`].

mod cache_key;
mod config;
mod entry;
mod fetch_error;
mod memory;
mod subscription;


pub use cache_key::CacheKey;
pub use config::QueryConfig;
pub use entry::{CacheEntry, Snapshot};
pub use fetch_error::{FetchError, Fetcher};
pub use memory::{FetchResult, Resource, ResourceCache};
pub use subscription::{Subscription, Trigger};
