//! Auto-reconnect for client-role connections.
//!
//! A [`ReconnectTimer`] is bound to one outbound connection. While the
//! [`Connector`] reports it is disconnected, every `period` the timer starts
//! one connect attempt. Once the connector reports connected, the timer
//! cancels itself.
//!
//! At most one attempt is in flight per timer: a tick that finds the previous
//! attempt still running is skipped entirely.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use devlive_core::ReconnectConfig;

use crate::scheduler::{ScheduledTask, Scheduler};

/// Error type for a failed connect attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The outbound side of a client-role connection.
///
/// Infrastructure implementations open sockets; test implementations count calls.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Whether the connection is currently established.
    fn is_connected(&self) -> bool;

    /// Performs one connect attempt.
    async fn do_connect(&self) -> Result<(), ConnectError>;
}

/// Recurring reconnect task for one connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReconnectTimer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// `None` for the disabled timer.
    scheduler: Option<Scheduler>,
    config: Mutex<ReconnectConfig>,
    /// Frozen timers ignore every mutation.
    frozen: bool,
    task: Mutex<Option<ScheduledTask>>,
    in_flight: AtomicBool,
    attempts: AtomicU64,
}

impl ReconnectTimer {
    pub fn new(scheduler: Scheduler, config: ReconnectConfig) -> Self {
        Self::build(Some(scheduler), config, false)
    }

    /// A timer that never schedules anything and ignores every mutation.
    ///
    /// Lets callers hold a timer unconditionally when auto-reconnect is off.
    pub fn disabled() -> Self {
        Self::build(None, ReconnectConfig::disabled(), true)
    }

    fn build(scheduler: Option<Scheduler>, config: ReconnectConfig, frozen: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                config: Mutex::new(config),
                frozen,
                task: Mutex::new(None),
                in_flight: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules the recurring reconnect check for `connector`.
    ///
    /// Returns false when auto-reconnect is off, a task is already scheduled,
    /// or the scheduler is shut down.
    pub fn start(&self, connector: Arc<dyn Connector>) -> bool {
        let config = self.config();
        let Some(scheduler) = self.inner.scheduler.as_ref().filter(|_| config.enabled) else {
            debug!("Auto-reconnect disabled, not scheduling");
            return false;
        };

        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return false;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let scheduled = scheduler.schedule_at_fixed_rate(
            "reconnect",
            config.initial_delay(),
            config.period,
            move || {
                if let Some(inner) = weak.upgrade() {
                    tick(&inner, &connector);
                }
            },
        );
        if scheduled.is_cancelled() {
            warn!("Scheduler is shut down, reconnect timer not started");
            return false;
        }
        *task = Some(scheduled);

        info!(
            period_ms = u64::try_from(config.period.as_millis()).unwrap_or(u64::MAX),
            fire_immediately = config.fire_immediately,
            "Reconnect timer started"
        );
        true
    }

    /// Cancels the scheduled task, if any. An attempt already in flight is
    /// left to finish. Returns false if nothing was scheduled.
    pub fn stop(&self) -> bool {
        match lock(&self.inner.task).take() {
            Some(task) => {
                let was_live = !task.is_cancelled();
                task.cancel();
                was_live
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn is_auto_connect(&self) -> bool {
        !self.inner.frozen && self.config().enabled
    }

    /// Turns auto-reconnect on or off. Turning it off also stops the timer.
    pub fn set_auto_connect(&self, enabled: bool) {
        if self.inner.frozen {
            return;
        }
        lock(&self.inner.config).enabled = enabled;
        if !enabled {
            self.stop();
        }
    }

    pub fn period(&self) -> Duration {
        self.config().period
    }

    /// Changes the period used by the next `start`.
    pub fn set_period(&self, period: Duration) {
        if self.inner.frozen {
            return;
        }
        lock(&self.inner.config).period = period;
    }

    pub fn config(&self) -> ReconnectConfig {
        *lock(&self.inner.config)
    }

    /// Number of connect attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    pub fn is_attempt_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.cancel();
        }
    }
}

/// Releases the single-attempt guard when dropped, whatever the outcome.
struct AttemptGuard(Arc<Inner>);

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

fn tick(inner: &Arc<Inner>, connector: &Arc<dyn Connector>) {
    if inner
        .in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("Reconnect attempt still in flight, skipping tick");
        return;
    }
    let guard = AttemptGuard(Arc::clone(inner));

    if connector.is_connected() {
        if let Some(task) = lock(&inner.task).take() {
            task.cancel();
            info!("Connection established, reconnect timer cancelled");
        }
        return;
    }

    let Some(scheduler) = inner.scheduler.as_ref() else {
        return;
    };
    let attempt = inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
    let connector = Arc::clone(connector);

    debug!(attempt, "Starting reconnect attempt");
    scheduler.spawn(async move {
        let _guard = guard;
        match connector.do_connect().await {
            Ok(()) => debug!(attempt, "Reconnect attempt completed"),
            Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
