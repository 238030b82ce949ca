use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared, TryFutureExt};
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::scheduler::{self, ScheduledTask, SchedulerRef, TokioScheduler};
use crate::utils::defer::CallOnDrop;

use super::subscription::{Subscriber, Subscription};
use super::{CacheEntry, CacheKey, FetchError, Fetcher, QueryConfig, Snapshot, Trigger};

/// Values that can be stored in a [`ResourceCache`].
pub trait Resource: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Resource for T {}

pub type FetchResult<T> = Result<T, FetchError>;

type FetchChannel<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

/// Subscribers to notify once the state lock has been released, with the slot revision each
/// snapshot was built at.
type Notifications<T> = Vec<(Arc<Subscriber<T>>, u64, Snapshot<T>)>;

/// Work collected under the state lock and carried out once it has been released.
///
/// Tasks must not be spawned under the lock. A scheduler may drop a task on the spot, and the
/// task's cleanup locks the state.
struct Effects<T> {
    tasks: Vec<BoxFuture<'static, ()>>,
    notifications: Notifications<T>,
}

impl<T> Default for Effects<T> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

impl<T> Effects<T> {
    fn extend(&mut self, other: Self) {
        self.tasks.extend(other.tasks);
        self.notifications.extend(other.notifications);
    }
}

/// A fetcher together with the retry policy it was requested with.
pub(super) struct FetchSpec<T> {
    fetcher: Arc<dyn Fetcher<T>>,
    retry_count: u32,
    retry_delay: Duration,
}

impl<T> FetchSpec<T> {
    pub(super) fn new(fetcher: Arc<dyn Fetcher<T>>, config: &QueryConfig) -> Self {
        Self {
            fetcher,
            retry_count: config.retry_count,
            retry_delay: config.retry_delay,
        }
    }
}

impl<T> Clone for FetchSpec<T> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            retry_count: self.retry_count,
            retry_delay: self.retry_delay,
        }
    }
}

struct InFlight<T> {
    id: u64,
    channel: FetchChannel<T>,
}

/// Everything the cache tracks for one key.
struct Slot<T> {
    entry: Option<CacheEntry<T>>,
    /// The single outstanding fetch for this key.
    in_flight: Option<InFlight<T>>,
    /// The shortest `cache_time` requested since the entry was created.
    cache_time: Option<Duration>,
    /// The fetcher most recently supplied for this key, used for forced revalidation.
    fetch: Option<FetchSpec<T>>,
    subscribers: Vec<Arc<Subscriber<T>>>,
    /// Bumped for every snapshot built from this slot.
    revision: u64,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entry: None,
            in_flight: None,
            cache_time: None,
            fetch: None,
            subscribers: Vec::new(),
            revision: 0,
        }
    }
}

impl<T> Slot<T> {
    fn record_request(&mut self, config: &QueryConfig, fetch: FetchSpec<T>) {
        let cache_time = match self.cache_time {
            Some(current) => current.min(config.cache_time),
            None => config.cache_time,
        };
        self.cache_time = Some(cache_time);
        self.fetch = Some(fetch);
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn clear(&mut self) {
        self.entry = None;
        self.cache_time = None;
    }

    fn is_idle(&self) -> bool {
        self.entry.is_none() && self.in_flight.is_none() && self.subscribers.is_empty()
    }
}

struct Inner<T> {
    config: CacheConfig,
    scheduler: SchedulerRef,
    slots: Mutex<HashMap<CacheKey, Slot<T>>>,
    next_id: AtomicU64,
    /// The pending garbage collection sweep, once started.
    gc: Mutex<Option<ScheduledTask>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let gc = self.gc.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = gc.take() {
            task.cancel();
        }
    }
}

/// A keyed stale-while-revalidate store.
///
/// - An entry younger than the consumer's `stale_time` is served without any network activity.
/// - An older entry is served immediately while a background revalidation runs.
/// - A missing entry is fetched. There is at most one in-flight fetch per key: all concurrent
///   requests, revalidations and triggers for a key await the same fetch.
/// - Failed fetches are retried `retry_count` times with linearly increasing delay. If they still
///   fail, an existing entry keeps being served and only records the error.
/// - A periodic sweep removes entries older than their effective `cache_time`. When consumers ask
///   for different values, the shortest one requested since the entry was created wins.
///
/// Fetches run as background tasks on the [`Scheduler`](crate::scheduler::Scheduler) and always
/// run to completion, even if every caller has gone away. Entries are written in the order their
/// fetches complete.
///
/// The cache is cheap to clone, all clones share the same entries.
pub struct ResourceCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResourceCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, in_flight) = self
            .inner
            .slots
            .try_lock()
            .map(|slots| {
                let entries = slots.values().filter(|s| s.entry.is_some()).count();
                let in_flight = slots.values().filter(|s| s.in_flight.is_some()).count();
                (entries, in_flight)
            })
            .unwrap_or_default();
        f.debug_struct("ResourceCache")
            .field("config", &self.inner.config)
            .field("entries", &entries)
            .field("in-flight fetches", &in_flight)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl ResourceCache<serde_json::Value> {
    /// The process-wide cache for JSON resources.
    ///
    /// Garbage collection starts with the first fetch made through it.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ResourceCache<serde_json::Value>> = OnceLock::new();
        GLOBAL.get_or_init(|| ResourceCache::new(CacheConfig::default(), TokioScheduler::shared()))
    }
}

impl<T: Resource> ResourceCache<T> {
    pub fn new(config: CacheConfig, scheduler: SchedulerRef) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                scheduler,
                slots: Default::default(),
                next_id: AtomicU64::new(0),
                gc: Default::default(),
            }),
        }
    }

    /// The request configuration used when a caller does not bring its own.
    pub fn default_query(&self) -> QueryConfig {
        self.inner.config.query()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<T>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> Instant {
        self.inner.scheduler.now()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the entry for `key` without fetching or subscribing.
    pub fn read(&self, key: &str) -> Option<CacheEntry<T>> {
        self.slots().get(key)?.entry.clone()
    }

    /// Returns the cached value for `key`, if any.
    pub fn peek(&self, key: &str) -> Option<T> {
        self.read(key).map(|entry| entry.data)
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        self.slots().values().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns what is currently known about `key`, fetching in the background if needed.
    ///
    /// This never waits for the network. A missing entry yields `is_loading`, a stale one yields
    /// the stale data with `is_validating`.
    pub fn get<F>(&self, key: impl Into<CacheKey>, fetcher: F, config: &QueryConfig) -> Snapshot<T>
    where
        F: Fetcher<T>,
    {
        let key = key.into();
        self.spawn_gc();
        metric!(counter("caches.access") += 1);

        let fetch = FetchSpec::new(Arc::new(fetcher), config);
        let (snapshot, effects) = {
            let mut slots = self.slots();
            let now = self.now();
            let slot = slots.entry(key.clone()).or_default();
            slot.record_request(config, fetch.clone());

            let is_stale = slot
                .entry
                .as_ref()
                .map(|entry| entry.is_stale(config.stale_time, now));
            let effects = match is_stale {
                Some(false) => {
                    metric!(counter("caches.memory.hit") += 1);
                    Effects::default()
                }
                Some(true) => {
                    metric!(counter("caches.stale") += 1);
                    self.start_fetch(&key, slot, fetch, now).1
                }
                None => self.start_fetch(&key, slot, fetch, now).1,
            };

            let snapshot = Snapshot::build(
                slot.entry.as_ref(),
                slot.in_flight.is_some(),
                config.stale_time,
                now,
            );
            (snapshot, effects)
        };
        self.apply(effects);

        snapshot
    }

    /// Returns the value for `key`, waiting for a fetch only if nothing is cached.
    ///
    /// Stale entries are returned right away and revalidated in the background.
    ///
    /// # Errors
    ///
    /// Fails with the last fetch error if there was no cached value and every retry failed.
    pub async fn load<F>(
        &self,
        key: impl Into<CacheKey>,
        fetcher: F,
        config: &QueryConfig,
    ) -> FetchResult<T>
    where
        F: Fetcher<T>,
    {
        let key = key.into();
        self.spawn_gc();
        metric!(counter("caches.access") += 1);

        let fetch = FetchSpec::new(Arc::new(fetcher), config);
        let (outcome, effects) = {
            let mut slots = self.slots();
            let now = self.now();
            let slot = slots.entry(key.clone()).or_default();
            slot.record_request(config, fetch.clone());

            let cached = slot
                .entry
                .as_ref()
                .map(|entry| (entry.data.clone(), entry.is_stale(config.stale_time, now)));
            match cached {
                Some((data, false)) => {
                    metric!(counter("caches.memory.hit") += 1);
                    (Ok(data), Effects::default())
                }
                Some((data, true)) => {
                    metric!(counter("caches.stale") += 1);
                    let (_channel, effects) = self.start_fetch(&key, slot, fetch, now);
                    (Ok(data), effects)
                }
                None => {
                    let (channel, effects) = self.start_fetch(&key, slot, fetch, now);
                    (Err(channel), effects)
                }
            }
        };
        self.apply(effects);

        match outcome {
            Ok(data) => Ok(data),
            Err(channel) => channel.await,
        }
    }

    /// Writes `data` into the cache, or forces a revalidation when `data` is `None`.
    ///
    /// Writing notifies all subscribers without any network activity.
    pub fn mutate(&self, key: impl Into<CacheKey>, data: Option<T>) {
        let key = key.into();
        let Some(data) = data else {
            // the revalidation is spawned eagerly, nobody needs to await it
            let _revalidation = self.revalidate(key);
            return;
        };

        // Writes may happen outside of a runtime, the sweep then starts with the first one inside.
        if tokio::runtime::Handle::try_current().is_ok() {
            self.spawn_gc();
        }

        let notifications = {
            let mut slots = self.slots();
            let now = self.now();
            let slot = slots.entry(key.clone()).or_default();
            slot.entry = Some(CacheEntry::new(data, now));
            tracing::trace!(%key, "Mutated cache entry");
            notifications(slot, now, None)
        };
        dispatch(notifications);
    }

    /// Fetches `key` again regardless of staleness.
    ///
    /// This uses the fetcher most recently supplied for the key and joins a fetch that is already
    /// running. The fetch starts right away, the returned future only reports its result.
    pub fn revalidate(&self, key: impl Into<CacheKey>) -> BoxFuture<'static, FetchResult<T>> {
        let key = key.into();
        let (channel, effects) = {
            let mut slots = self.slots();
            let now = self.now();
            let Some(slot) = slots.get_mut(key.as_str()) else {
                return future::ready(Err(FetchError::NoFetcher)).boxed();
            };
            let Some(fetch) = slot.fetch.clone() else {
                return future::ready(Err(FetchError::NoFetcher)).boxed();
            };
            self.start_fetch(&key, slot, fetch, now)
        };
        self.apply(effects);

        channel.boxed()
    }

    /// Populates `key` ahead of time.
    ///
    /// Does nothing if the key is already cached, joins a running fetch otherwise. The fetch
    /// starts right away, the returned future only reports its result.
    pub fn prefetch<F>(&self, key: impl Into<CacheKey>, fetcher: F) -> BoxFuture<'static, FetchResult<()>>
    where
        F: Fetcher<T>,
    {
        let key = key.into();
        self.spawn_gc();

        let config = self.default_query();
        let fetch = FetchSpec::new(Arc::new(fetcher), &config);
        let (channel, effects) = {
            let mut slots = self.slots();
            let now = self.now();
            let slot = slots.entry(key.clone()).or_default();
            if slot.entry.is_some() {
                return future::ready(Ok(())).boxed();
            }
            slot.record_request(&config, fetch.clone());
            self.start_fetch(&key, slot, fetch, now)
        };
        self.apply(effects);

        channel.map_ok(|_| ()).boxed()
    }

    /// Removes the entry for `key`, or every entry if no key is given.
    ///
    /// Running fetches are not affected and will write their result once they complete.
    pub fn clear(&self, key: Option<&str>) {
        let mut slots = self.slots();
        match key {
            Some(key) => {
                if let Some(slot) = slots.get_mut(key) {
                    slot.clear();
                    if slot.is_idle() {
                        slots.remove(key);
                    }
                }
            }
            None => {
                slots.values_mut().for_each(Slot::clear);
                slots.retain(|_, slot| !slot.is_idle());
            }
        }
    }

    /// Registers a consumer for `key`.
    ///
    /// `on_update` is called right away with the current [`Snapshot`], and again whenever the
    /// entry changes or a fetch starts. Dropping the returned [`Subscription`] unregisters it.
    pub fn subscribe<F, U>(
        &self,
        key: impl Into<CacheKey>,
        fetcher: F,
        config: QueryConfig,
        on_update: U,
    ) -> Subscription<T>
    where
        F: Fetcher<T>,
        U: Fn(Snapshot<T>) + Send + Sync + 'static,
    {
        let key = key.into();
        self.spawn_gc();

        let fetch = FetchSpec::new(Arc::new(fetcher), &config);
        let subscriber = Arc::new(Subscriber::new(
            self.next_id(),
            key.clone(),
            config,
            fetch.clone(),
            Box::new(on_update),
        ));

        let (revision, snapshot, effects) = {
            let mut slots = self.slots();
            let now = self.now();
            let slot = slots.entry(key.clone()).or_default();
            slot.record_request(&config, fetch.clone());
            slot.subscribers.push(Arc::clone(&subscriber));

            let is_fresh = slot
                .entry
                .as_ref()
                .is_some_and(|entry| !entry.is_stale(config.stale_time, now));
            let effects = if is_fresh {
                Effects::default()
            } else {
                self.start_fetch(&key, slot, fetch, now).1
            };

            let snapshot = Snapshot::build(
                slot.entry.as_ref(),
                slot.in_flight.is_some(),
                config.stale_time,
                now,
            );
            (slot.next_revision(), snapshot, effects)
        };

        // the fetch notification for the new subscriber is older and will be dropped
        subscriber.deliver(revision, snapshot);
        self.apply(effects);

        Subscription::new(self.clone(), subscriber)
    }

    pub(super) fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(subscriber.key.as_str()) {
            slot.subscribers.retain(|other| other.id != subscriber.id);
            if slot.is_idle() {
                slots.remove(subscriber.key.as_str());
            }
        }
    }

    /// Revalidates every mounted subscription that opted into `trigger` and is stale.
    ///
    /// Each trigger is handled once, subscriptions are not polled in between.
    pub fn trigger(&self, trigger: Trigger) {
        let effects = {
            let mut slots = self.slots();
            let now = self.now();
            let mut effects = Effects::default();
            for (key, slot) in slots.iter_mut() {
                let due = slot
                    .subscribers
                    .iter()
                    .filter(|subscriber| subscriber.is_mounted() && subscriber.wants(trigger))
                    .find(|subscriber| {
                        slot.entry
                            .as_ref()
                            .is_none_or(|entry| entry.is_stale(subscriber.config.stale_time, now))
                    })
                    .map(|subscriber| subscriber.fetch.clone());

                if let Some(fetch) = due {
                    tracing::debug!(%key, ?trigger, "Revalidating on trigger");
                    effects.extend(self.start_fetch(key, slot, fetch, now).1);
                }
            }
            effects
        };
        self.apply(effects);
    }

    /// Removes every entry older than its effective `cache_time`.
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let (evicted, remaining) = {
            let mut slots = self.slots();
            let now = self.now();
            let default_cache_time = self.inner.config.cache_time;

            let mut evicted = 0;
            for (key, slot) in slots.iter_mut() {
                let cache_time = slot.cache_time.unwrap_or(default_cache_time);
                let expired = slot
                    .entry
                    .as_ref()
                    .is_some_and(|entry| entry.age(now) > cache_time);
                if expired {
                    tracing::trace!(%key, ?cache_time, "Evicting cache entry");
                    slot.clear();
                    evicted += 1;
                }
            }
            slots.retain(|_, slot| !slot.is_idle());

            let remaining = slots.values().filter(|s| s.entry.is_some()).count();
            (evicted, remaining)
        };

        metric!(counter("caches.gc.evicted") += evicted as i64);
        metric!(gauge("caches.entries") = remaining as u64);
        if evicted > 0 {
            tracing::debug!(evicted, remaining, "Swept resource cache");
        }

        evicted
    }

    /// Starts the periodic garbage collection sweep, unless it is already running.
    ///
    /// A zero `gc_interval` disables the sweep. The sweep stops when the last handle to the cache
    /// is dropped.
    pub fn spawn_gc(&self) {
        if self.inner.config.gc_interval.is_zero() {
            return;
        }
        let mut gc = self
            .inner
            .gc
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if gc.is_none() {
            *gc = Some(schedule_sweep(&self.inner));
        }
    }

    /// Returns the in-flight fetch for `key`, starting one if there is none.
    ///
    /// The in-flight record is registered right away, so every later request for the key joins
    /// it until the fetch settles. The fetch task itself is part of the returned [`Effects`] and
    /// has to be [applied](Self::apply) once the state lock is released.
    fn start_fetch(
        &self,
        key: &CacheKey,
        slot: &mut Slot<T>,
        fetch: FetchSpec<T>,
        now: Instant,
    ) -> (FetchChannel<T>, Effects<T>) {
        if let Some(in_flight) = &slot.in_flight {
            metric!(counter("caches.dedup.hit") += 1);
            tracing::trace!(%key, "Joining in-flight fetch");
            return (in_flight.channel.clone(), Effects::default());
        }

        let id = self.next_id();
        let (sender, receiver) = oneshot::channel();
        let channel = receiver
            .unwrap_or_else(|_cancelled| Err(FetchError::Cancelled))
            .boxed()
            .shared();
        slot.in_flight = Some(InFlight {
            id,
            channel: channel.clone(),
        });

        // Evicts the in-flight record even if the fetch task dies without settling.
        let done_token = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let mut slots = inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(slot) = slots.get_mut(key.as_str()) {
                    if slot.in_flight.as_ref().is_some_and(|f| f.id == id) {
                        slot.in_flight = None;
                    }
                }
            })
        };

        let this = self.clone();
        let key = key.clone();
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            let _done_token = done_token;
            tracing::debug!(%key, "Fetching resource");
            let result = this.fetch_with_retries(&key, &fetch).await;
            this.settle(&key, id, &result);
            sender.send(result).ok();
        });

        let effects = Effects {
            tasks: vec![task],
            notifications: notifications(slot, now, None),
        };
        (channel, effects)
    }

    /// Spawns the fetches and delivers the notifications collected under the state lock.
    fn apply(&self, effects: Effects<T>) {
        for task in effects.tasks {
            self.inner.scheduler.spawn(task);
        }
        dispatch(effects.notifications);
    }

    async fn fetch_with_retries(&self, key: &CacheKey, fetch: &FetchSpec<T>) -> FetchResult<T> {
        let mut retries = 0;
        loop {
            metric!(counter("caches.fetch") += 1);
            let started = Instant::now();
            let result = fetch.fetcher.fetch().await;
            metric!(timer("caches.fetch.duration") = started.elapsed());
            let err = match result {
                Ok(data) => return Ok(data),
                Err(err) => err,
            };
            metric!(counter("caches.fetch.error") += 1);

            if retries >= fetch.retry_count {
                tracing::warn!(
                    %key,
                    retries,
                    error = &err as &dyn std::error::Error,
                    "Fetch failed, giving up"
                );
                return Err(err);
            }

            retries += 1;
            let delay = fetch.retry_delay * retries;
            metric!(counter("caches.fetch.retry") += 1);
            tracing::debug!(%key, retry = retries, ?delay, error = %err, "Fetch failed, retrying");
            scheduler::sleep(&*self.inner.scheduler, delay).await;
        }
    }

    /// Writes the result of the in-flight fetch `id` and notifies subscribers.
    fn settle(&self, key: &CacheKey, id: u64, result: &FetchResult<T>) {
        let notifications = {
            let mut slots = self.slots();
            let now = self.now();
            let slot = slots.entry(key.clone()).or_default();
            if slot.in_flight.as_ref().is_some_and(|f| f.id == id) {
                slot.in_flight = None;
            }

            match result {
                Ok(data) => slot.entry = Some(CacheEntry::new(data.clone(), now)),
                Err(err) => {
                    if let Some(entry) = slot.entry.as_mut() {
                        tracing::debug!(%key, "Revalidation failed, serving stale entry");
                        entry.error = Some(err.clone());
                    }
                }
            }
            notifications(slot, now, result.as_ref().err())
        };
        dispatch(notifications);
    }
}

/// Builds the snapshot every mounted subscriber of `slot` should see.
///
/// `error` is reported to subscribers when there is no entry to carry it.
fn notifications<T: Resource>(
    slot: &mut Slot<T>,
    now: Instant,
    error: Option<&FetchError>,
) -> Notifications<T> {
    let revision = slot.next_revision();
    slot.subscribers
        .iter()
        .filter(|subscriber| subscriber.is_mounted())
        .map(|subscriber| {
            let mut snapshot = Snapshot::build(
                slot.entry.as_ref(),
                slot.in_flight.is_some(),
                subscriber.config.stale_time,
                now,
            );
            if snapshot.error.is_none() {
                snapshot.error = error.cloned();
            }
            (Arc::clone(subscriber), revision, snapshot)
        })
        .collect()
}

fn dispatch<T: Resource>(notifications: Notifications<T>) {
    for (subscriber, revision, snapshot) in notifications {
        subscriber.deliver(revision, snapshot);
    }
}

fn schedule_sweep<T: Resource>(inner: &Arc<Inner<T>>) -> ScheduledTask {
    let weak = Arc::downgrade(inner);
    inner.scheduler.schedule(
        inner.config.gc_interval,
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let cache = ResourceCache { inner };
            cache.sweep();

            let next = schedule_sweep(&cache.inner);
            *cache.inner.gc.lock().unwrap_or_else(PoisonError::into_inner) = Some(next);
        }),
    )
}
