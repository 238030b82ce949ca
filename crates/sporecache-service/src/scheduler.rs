//! Timers and background tasks.
//!
//! Everything in this crate that waits, retries or sweeps goes through a [`Scheduler`] instead of
//! calling into the runtime directly. The default [`TokioScheduler`] reads the clock through
//! [`tokio::time::Instant`], so tests running with paused time observe the same virtual clock for
//! staleness checks as they do for timers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Runs delayed and background work on behalf of the caches.
pub trait Scheduler: fmt::Debug + Send + Sync + 'static {
    /// Runs `task` once `delay` has elapsed, unless the returned handle is cancelled first.
    ///
    /// Cancelling only prevents the task from starting. A task that already started runs to
    /// completion.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask;

    /// Runs `task` in the background right away.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// The current time as seen by this scheduler.
    fn now(&self) -> Instant;
}

/// A shared, type-erased [`Scheduler`].
pub type SchedulerRef = Arc<dyn Scheduler>;

/// Handle to a task registered with [`Scheduler::schedule`].
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    /// Creates a handle that is cancelled through `token`.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Prevents the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Turns this handle into a guard that cancels the task when dropped.
    pub fn cancel_on_drop(self) -> DropGuard {
        self.token.drop_guard()
    }
}

/// The default [`Scheduler`], backed by the ambient tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    /// Returns a shared handle to the tokio scheduler.
    pub fn shared() -> SchedulerRef {
        Arc::new(TokioScheduler)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let timer = async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        };
        tokio::spawn(timer.bind_hub(Hub::new_from_top(Hub::current())));

        ScheduledTask::new(token)
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Waits for `delay` using the timers of `scheduler`.
///
/// Dropping the returned future before it completes cancels the underlying timer.
pub async fn sleep(scheduler: &dyn Scheduler, delay: Duration) {
    let (sender, receiver) = oneshot::channel();
    let task = scheduler.schedule(
        delay,
        Box::pin(async move {
            sender.send(()).ok();
        }),
    );
    let _guard = task.cancel_on_drop();
    receiver.await.ok();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_after_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = TokioScheduler;

        let _task = {
            let runs = Arc::clone(&runs);
            scheduler.schedule(
                Duration::from_secs(5),
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = TokioScheduler;

        let task = {
            let runs = Arc::clone(&runs);
            scheduler.schedule(
                Duration::from_secs(5),
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        task.cancel();
        assert!(task.is_cancelled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_uses_scheduler_clock() {
        let scheduler = TokioScheduler;
        let start = scheduler.now();

        sleep(&scheduler, Duration::from_millis(1500)).await;

        assert!(scheduler.now() - start >= Duration::from_millis(1500));
    }
}
