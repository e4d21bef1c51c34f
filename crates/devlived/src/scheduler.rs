//! Injected scheduling capability for recurring and one-shot work.
//!
//! A [`Scheduler`] wraps a tokio runtime handle plus a root
//! `CancellationToken` and a `TaskTracker`. Every scheduled task gets a child
//! token, so cancelling one task never touches the others while
//! [`Scheduler::shutdown`] stops all of them and waits for in-flight work.
//!
//! Ticks are driven by `tokio::time`, so tests built on
//! `#[tokio::test(start_paused = true)]` get a deterministic clock for free.
//!
//! # Cancellation
//!
//! Each tick re-checks its token right before running the task body. Once
//! [`ScheduledTask::cancel`] returns, no new tick starts; a tick whose body is
//! already running is allowed to finish.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Smallest period accepted by the scheduler; `tokio::time::interval` rejects zero.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Runtime-backed scheduler. Cheap to clone; clones share one lifecycle.
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Handle to one scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    name: &'static str,
    token: CancellationToken,
}

impl ScheduledTask {
    /// Stops further ticks. Idempotent.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(task = self.name, "Scheduled task cancelled");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Scheduler {
    /// Creates a scheduler that spawns onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Creates a scheduler on the runtime the caller is running in.
    ///
    /// Returns `None` outside of a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Runs `task` every `period`, first after `initial_delay`.
    ///
    /// Missed ticks are skipped rather than replayed, so a slow tick never
    /// causes a burst of catch-up runs.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> ScheduledTask
    where
        F: FnMut() + Send + 'static,
    {
        let period = clamp_period(name, period);
        let token = self.shutdown.child_token();
        let scheduled = ScheduledTask {
            name,
            token: token.clone(),
        };

        if self.is_shutdown() {
            debug!(task = name, "Scheduler shut down, task not started");
            return scheduled;
        }

        self.tracker.spawn_on(
            async move {
                let mut ticker = interval_at(Instant::now() + initial_delay, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;

                        _ = token.cancelled() => break,

                        _ = ticker.tick() => {
                            if token.is_cancelled() {
                                break;
                            }
                            task();
                        }
                    }
                }

                debug!(task = name, "Recurring task stopped");
            },
            &self.handle,
        );

        scheduled
    }

    /// Runs `task` once after `delay` unless cancelled first.
    pub fn schedule_once<F>(&self, name: &'static str, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let scheduled = ScheduledTask {
            name,
            token: token.clone(),
        };

        if self.is_shutdown() {
            debug!(task = name, "Scheduler shut down, task not started");
            return scheduled;
        }

        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {}

                    _ = tokio::time::sleep(delay) => {
                        if !token.is_cancelled() {
                            task();
                        }
                    }
                }
            },
            &self.handle,
        );

        scheduled
    }

    /// Spawns a tracked future that is dropped at shutdown.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = future => {}
                }
            },
            &self.handle,
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels every task and waits until all of them have returned.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Scheduler shut down");
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}

fn clamp_period(name: &'static str, period: Duration) -> Duration {
    if period < MIN_PERIOD {
        warn!(task = name, ?period, "Period below minimum, clamping");
        return MIN_PERIOD;
    }
    period
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn scheduler() -> Scheduler {
        Scheduler::current().expect("inside a runtime")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_runs_every_period() {
        let scheduler = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = scheduler.schedule_at_fixed_rate(
            "counter",
            Duration::ZERO,
            Duration::from_millis(100),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Ticks at 0, 100, 200, 300
        sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        task.cancel();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_is_honoured() {
        let scheduler = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let _task = scheduler.schedule_at_fixed_rate(
            "delayed",
            Duration::from_millis(100),
            Duration::from_millis(100),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_once_fires_once() {
        let scheduler = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        scheduler.schedule_once("once", Duration::from_millis(200), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(199)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_once_never_fires() {
        let scheduler = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = scheduler.schedule_once("once", Duration::from_millis(200), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        task.cancel();

        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let scheduler = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = scheduler.schedule_at_fixed_rate(
            "counter",
            Duration::ZERO,
            Duration::from_millis(10),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        sleep(Duration::from_millis(25)).await;

        scheduler.shutdown().await;
        let after = count.load(Ordering::SeqCst);
        assert!(task.is_cancelled());
        assert_eq!(scheduler.active_tasks(), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);

        let late = scheduler.schedule_once("late", Duration::ZERO, || {});
        assert!(late.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_clamped() {
        let scheduler = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let task = scheduler.schedule_at_fixed_rate("zero", Duration::ZERO, Duration::ZERO, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(5)).await;
        task.cancel();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
