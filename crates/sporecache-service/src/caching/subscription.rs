use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use super::memory::{FetchResult, FetchSpec, Resource};
use super::{CacheKey, QueryConfig, ResourceCache, Snapshot};

/// An application event that prompts mounted subscriptions to revalidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The application window regained focus.
    Focus,
    /// Network connectivity was restored.
    Reconnect,
}

type UpdateFn<T> = Box<dyn Fn(Snapshot<T>) + Send + Sync>;

/// What a subscriber has been handed so far.
struct Delivery<T> {
    /// Revision of `last`. Snapshots with a lower revision are outdated and dropped.
    revision: u64,
    last: Snapshot<T>,
    /// Set while some thread runs `on_update`.
    busy: bool,
    /// The newest snapshot that arrived while `on_update` was running.
    queued: Option<Snapshot<T>>,
}

/// A registered consumer of one key.
pub(super) struct Subscriber<T> {
    pub(super) id: u64,
    pub(super) key: CacheKey,
    pub(super) config: QueryConfig,
    pub(super) fetch: FetchSpec<T>,
    on_update: UpdateFn<T>,
    delivery: Mutex<Delivery<T>>,
    mounted: AtomicBool,
}

impl<T: Resource> Subscriber<T> {
    pub(super) fn new(
        id: u64,
        key: CacheKey,
        config: QueryConfig,
        fetch: FetchSpec<T>,
        on_update: UpdateFn<T>,
    ) -> Self {
        Self {
            id,
            key,
            config,
            fetch,
            on_update,
            delivery: Mutex::new(Delivery {
                revision: 0,
                last: Snapshot::default(),
                busy: false,
                queued: None,
            }),
            mounted: AtomicBool::new(true),
        }
    }

    pub(super) fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub(super) fn wants(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Focus => self.config.revalidate_on_focus,
            Trigger::Reconnect => self.config.revalidate_on_reconnect,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Delivery<T>> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `snapshot` and hands it to the consumer, unless it has unsubscribed.
    ///
    /// Snapshots are built under the cache lock, `revision` reflects that order. A snapshot that
    /// arrives after a newer one is dropped. `on_update` calls never overlap: snapshots arriving
    /// meanwhile, including from within `on_update`, are coalesced and delivered once it returns.
    pub(super) fn deliver(&self, revision: u64, snapshot: Snapshot<T>) {
        let mut delivery = self.lock();
        if !self.is_mounted() || revision <= delivery.revision {
            return;
        }
        delivery.revision = revision;
        delivery.last = snapshot.clone();
        if delivery.busy {
            delivery.queued = Some(snapshot);
            return;
        }

        delivery.busy = true;
        let mut next = snapshot;
        loop {
            drop(delivery);
            (self.on_update)(next);
            delivery = self.lock();
            match delivery.queued.take() {
                Some(queued) if self.is_mounted() => next = queued,
                _ => {
                    delivery.busy = false;
                    return;
                }
            }
        }
    }

    pub(super) fn snapshot(&self) -> Snapshot<T> {
        self.lock().last.clone()
    }

    fn unmount(&self) {
        let mut delivery = self.lock();
        self.mounted.store(false, Ordering::Release);
        delivery.queued = None;
    }
}

/// A consumer's registration with a [`ResourceCache`].
///
/// Returned by [`ResourceCache::subscribe`]. Dropping it unsubscribes: no further updates are
/// delivered, even for fetches that are still running.
pub struct Subscription<T: Resource> {
    cache: ResourceCache<T>,
    subscriber: Arc<Subscriber<T>>,
}

impl<T: Resource> Subscription<T> {
    pub(super) fn new(cache: ResourceCache<T>, subscriber: Arc<Subscriber<T>>) -> Self {
        Self { cache, subscriber }
    }

    pub fn key(&self) -> &CacheKey {
        &self.subscriber.key
    }

    pub fn config(&self) -> &QueryConfig {
        &self.subscriber.config
    }

    /// The last snapshot delivered to this subscription.
    pub fn snapshot(&self) -> Snapshot<T> {
        self.subscriber.snapshot()
    }

    /// See [`ResourceCache::mutate`].
    pub fn mutate(&self, data: Option<T>) {
        self.cache.mutate(self.key(), data);
    }

    /// See [`ResourceCache::revalidate`].
    pub fn revalidate(&self) -> BoxFuture<'static, FetchResult<T>> {
        self.cache.revalidate(self.key())
    }

    /// Stops all further updates.
    pub fn unsubscribe(self) {}
}

impl<T: Resource> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.subscriber.unmount();
        self.cache.unsubscribe(&self.subscriber);
    }
}

impl<T: Resource> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.subscriber.key)
            .field("config", &self.subscriber.config)
            .field("mounted", &self.subscriber.is_mounted())
            .finish()
    }
}
