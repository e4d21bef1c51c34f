//! Liveness sweeper - evicts devices that went silent.
//!
//! Every `sweep_interval` the sweeper snapshots the registry, takes a single
//! `now`, and removes each device idle for longer than `expire_after`. The
//! removal re-checks the device under the registry lock, so a device touched
//! or replaced between snapshot and removal survives until the next tick.
//!
//! Evicted connections are closed fire-and-forget. A close failure is logged
//! and counted but never stops the rest of the sweep.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use devlive_core::{ConfigError, SweepConfig};

use crate::registry::{DeviceRegistry, RemovalReason};
use crate::scheduler::{ScheduledTask, Scheduler};

/// Errors surfaced by the sweeper's configuration surface.
#[derive(Debug, Error)]
pub enum SweepError {
    /// The configuration is frozen while the sweeper runs.
    #[error("sweeper is running; stop it before changing its configuration")]
    Running,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices present in the snapshot.
    pub scanned: usize,
    /// Devices removed by this sweep.
    pub evicted: usize,
    /// Evicted devices whose connection failed to close.
    pub close_failures: usize,
}

/// Recurring eviction task bound to one registry.
///
/// `Stopped -> Running -> Stopped`; both `start` and `stop` are idempotent.
#[derive(Debug)]
pub struct LivenessSweeper {
    registry: Arc<DeviceRegistry>,
    scheduler: Scheduler,
    config: Mutex<SweepConfig>,
    task: Mutex<Option<ScheduledTask>>,
}

impl LivenessSweeper {
    pub fn new(registry: Arc<DeviceRegistry>, scheduler: Scheduler, config: SweepConfig) -> Self {
        Self {
            registry,
            scheduler,
            config: Mutex::new(config),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SweepConfig {
        *lock(&self.config)
    }

    /// Replaces the configuration. Rejected while running.
    pub fn set_config(&self, config: SweepConfig) -> Result<(), SweepError> {
        config.validate()?;
        let task = lock(&self.task);
        if is_live(&task) {
            return Err(SweepError::Running);
        }
        *lock(&self.config) = config;
        Ok(())
    }

    /// Schedules the recurring sweep. Returns false if already running or
    /// the scheduler is shut down.
    pub fn start(&self) -> bool {
        let mut task = lock(&self.task);
        if is_live(&task) {
            debug!("Liveness sweeper already running");
            return false;
        }

        let config = self.config();
        let registry = Arc::clone(&self.registry);
        let expire_after = config.expire_after;

        let scheduled = self.scheduler.schedule_at_fixed_rate(
            "liveness-sweep",
            config.sweep_interval,
            config.sweep_interval,
            move || {
                sweep(&registry, expire_after, Instant::now());
            },
        );
        if scheduled.is_cancelled() {
            warn!("Scheduler is shut down, liveness sweeper not started");
            return false;
        }
        *task = Some(scheduled);

        info!(
            expire_after_ms = millis(config.expire_after),
            sweep_interval_ms = millis(config.sweep_interval),
            "Liveness sweeper started"
        );
        true
    }

    /// Cancels the recurring sweep. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        let Some(task) = lock(&self.task).take() else {
            return false;
        };
        let was_live = !task.is_cancelled();
        task.cancel();
        if was_live {
            info!("Liveness sweeper stopped");
        }
        was_live
    }

    pub fn is_running(&self) -> bool {
        is_live(&lock(&self.task))
    }

    /// Runs one sweep immediately on the caller's thread.
    pub fn sweep_now(&self) -> SweepReport {
        sweep(&self.registry, self.config().expire_after, Instant::now())
    }
}

impl Drop for LivenessSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Evicts every device in `registry` idle for longer than `expire_after` at `now`.
pub fn sweep(registry: &DeviceRegistry, expire_after: Duration, now: Instant) -> SweepReport {
    let snapshot = registry.values();
    let mut report = SweepReport {
        scanned: snapshot.len(),
        ..SweepReport::default()
    };

    for device in snapshot {
        if !device.clock().is_expired(now, expire_after) {
            continue;
        }

        // Re-check under the lock: the entry must still be this instance and
        // still be silent, otherwise a touch or replacement won the race.
        let evicted = registry.remove_if(device.id(), RemovalReason::Expired, |current| {
            Arc::ptr_eq(current, &device) && current.clock().is_expired(now, expire_after)
        });
        let Some(evicted) = evicted else {
            continue;
        };

        report.evicted += 1;
        info!(
            device_id = %evicted.id(),
            idle_ms = millis(evicted.clock().idle_for(now)),
            "Device expired"
        );

        if let Err(e) = evicted.close() {
            report.close_failures += 1;
            warn!(device_id = %evicted.id(), error = %e, "Failed to close expired device");
        }
    }

    if report.evicted > 0 {
        debug!(
            scanned = report.scanned,
            evicted = report.evicted,
            remaining = registry.size(),
            "Sweep complete"
        );
    }

    report
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_live(task: &Option<ScheduledTask>) -> bool {
    task.as_ref().is_some_and(|t| !t.is_cancelled())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
