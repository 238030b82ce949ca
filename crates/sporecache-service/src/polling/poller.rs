use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use crate::caching::FetchError;
use crate::scheduler::{ScheduledTask, SchedulerRef};

use super::{PollState, PollerOptions};

type FetchFn<K, T> = Box<dyn Fn(&K) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;
type PredicateFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type UpdateFn<T> = Box<dyn Fn(&PollState<T>) + Send + Sync>;

/// Mutable state of a poller, guarded by a single lock.
struct Session<K, T> {
    target: Option<K>,
    /// Bumped on every target change, so work started for an old target can tell it is stale.
    generation: u64,
    mounted: bool,
    state: PollState<T>,
    /// The pending poll, if any.
    timer: Option<ScheduledTask>,
}

impl<K, T> Session<K, T> {
    fn is_current(&self, generation: u64) -> bool {
        self.mounted && self.generation == generation
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

struct Shared<K, T> {
    fetch: FetchFn<K, T>,
    is_incomplete: PredicateFn<T>,
    options: PollerOptions,
    scheduler: SchedulerRef,
    on_update: UpdateFn<T>,
    session: Mutex<Session<K, T>>,
}

/// Polls a target until its payload is complete.
///
/// - Setting a target fetches it right away with `loading` set.
/// - After every successful fetch the completeness predicate is asked. A complete payload ends
///   polling. An incomplete one schedules exactly one more fetch after
///   [`PollerOptions::backoff_delay`]. Once `max_attempts` polls have fired, polling stops with
///   `gave_up` set and the last payload kept.
/// - A failed initial fetch records the error and stops. A failed poll keeps the last payload,
///   records the error and continues while budget remains.
/// - Replacing the target resets all state and cancels the pending poll before the new initial
///   fetch. Results and timers that belong to a previous target are discarded.
/// - [`unsubscribe`](Self::unsubscribe), or dropping the poller, cancels the pending poll and
///   suppresses every further update, including those of a fetch that is still running.
///
/// `on_update` is called with the poller's lock held, so every state change is delivered in order
/// and none after unsubscribing. It must not call back into the poller.
pub struct CompletionPoller<K, T> {
    shared: Arc<Shared<K, T>>,
}

impl<K, T> CompletionPoller<K, T>
where
    K: Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates a poller without a target.
    ///
    /// `fetch` is invoked with the current target for the initial fetch and every poll.
    pub fn new<F, Fut, P, U>(
        fetch: F,
        is_incomplete: P,
        options: PollerOptions,
        scheduler: SchedulerRef,
        on_update: U,
    ) -> Self
    where
        F: Fn(&K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
        U: Fn(&PollState<T>) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                fetch: Box::new(move |target| Box::pin(fetch(target))),
                is_incomplete: Box::new(is_incomplete),
                options,
                scheduler,
                on_update: Box::new(on_update),
                session: Mutex::new(Session {
                    target: None,
                    generation: 0,
                    mounted: true,
                    state: PollState::default(),
                    timer: None,
                }),
            }),
        }
    }

    /// Switches to `target` and starts over, or goes idle for `None`.
    ///
    /// Setting the same target again restarts polling as well.
    pub fn set_target(&self, target: Option<K>) {
        let mut session = self.shared.lock();
        if !session.mounted {
            return;
        }

        session.cancel_timer();
        session.generation += 1;
        session.target = target.clone();
        session.state = PollState {
            loading: target.is_some(),
            ..Default::default()
        };
        tracing::debug!(?target, "Polling new target");
        self.shared.notify(&session);

        if let Some(target) = target {
            self.shared.spawn_fetch(session.generation, &target);
        }
    }

    pub fn target(&self) -> Option<K> {
        self.shared.lock().target.clone()
    }

    /// The current state.
    pub fn state(&self) -> PollState<T> {
        self.shared.lock().state.clone()
    }

    pub fn options(&self) -> &PollerOptions {
        &self.shared.options
    }

    /// Stops polling for good.
    pub fn unsubscribe(&self) {
        let mut session = self.shared.lock();
        session.mounted = false;
        session.cancel_timer();
    }
}

impl<K, T> Drop for CompletionPoller<K, T> {
    fn drop(&mut self) {
        let mut session = self.shared.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.mounted = false;
        session.cancel_timer();
    }
}

impl<K: fmt::Debug, T> fmt::Debug for CompletionPoller<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CompletionPoller");
        debug.field("options", &self.shared.options);
        if let Ok(session) = self.shared.session.try_lock() {
            debug
                .field("target", &session.target)
                .field("attempt", &session.state.attempt)
                .field("mounted", &session.mounted);
        }
        debug.finish()
    }
}

impl<K, T> Shared<K, T>
where
    K: Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Session<K, T>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, session: &Session<K, T>) {
        (self.on_update)(&session.state);
    }

    /// Invokes the fetcher for `target` and settles its result in the background.
    fn spawn_fetch(self: &Arc<Self>, generation: u64, target: &K) {
        metric!(counter("poller.fetch") += 1);
        let fetch = (self.fetch)(target);
        let shared = Arc::clone(self);
        self.scheduler.spawn(Box::pin(async move {
            let result = fetch.await;
            shared.settle(generation, result);
        }));
    }

    fn settle(self: &Arc<Self>, generation: u64, result: Result<T, FetchError>) {
        let mut session = self.lock();
        if !session.is_current(generation) {
            tracing::trace!("Discarding fetch result of an abandoned target");
            return;
        }

        let state = &mut session.state;
        state.loading = false;
        match result {
            Ok(data) => {
                let incomplete = (self.is_incomplete)(&data);
                state.data = Some(data);
                state.error = None;
                if !incomplete {
                    state.retrying = false;
                    tracing::debug!(attempt = state.attempt, "Polled record is complete");
                    self.notify(&session);
                    return;
                }
            }
            Err(err) if state.attempt == 0 => {
                tracing::debug!(error = %err, "Initial fetch failed, not polling");
                state.retrying = false;
                state.error = Some(err);
                self.notify(&session);
                return;
            }
            Err(err) => {
                tracing::debug!(attempt = state.attempt, error = %err, "Poll failed");
                state.error = Some(err);
            }
        }

        self.schedule_poll(&mut session);
        self.notify(&session);
    }

    /// Schedules the next poll, or gives up if the budget is used up.
    fn schedule_poll(self: &Arc<Self>, session: &mut Session<K, T>) {
        let attempt = session.state.attempt;
        if attempt >= self.options.max_attempts {
            tracing::warn!(
                target = ?session.target,
                attempts = attempt,
                "Record still incomplete, giving up"
            );
            metric!(counter("poller.gave_up") += 1);
            session.state.retrying = false;
            session.state.gave_up = true;
            return;
        }

        let delay = self.options.backoff_delay(attempt);
        tracing::trace!(attempt, ?delay, "Scheduling poll");
        session.state.retrying = true;

        let generation = session.generation;
        let shared = Arc::clone(self);
        let poll = async move { shared.poll(generation) };
        session.timer = Some(self.scheduler.schedule(delay, Box::pin(poll)));
    }

    fn poll(self: &Arc<Self>, generation: u64) {
        let mut session = self.lock();
        if !session.is_current(generation) {
            return;
        }
        let Some(target) = session.target.clone() else {
            return;
        };

        session.timer = None;
        session.state.attempt += 1;
        metric!(counter("poller.retry") += 1);
        self.notify(&session);

        self.spawn_fetch(generation, &target);
    }
}
