//! Periodic statistics for the liveness daemon.
//!
//! Every `stats.interval` the reporter logs:
//! - the number of tracked devices
//! - registry churn since the previous report, by removal reason
//! - the daemon's own memory and CPU usage
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Missing process information degrades to zeroed metrics

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sysinfo::{Pid, System};
use tracing::{info, warn};

use devlive_core::{Device, DeviceId, StatsConfig};

use crate::registry::{DeviceRegistry, RemovalReason, StateChangeListener};
use crate::scheduler::{ScheduledTask, Scheduler};

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 100;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

// ============================================================================
// Process metrics
// ============================================================================

/// Current process metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessMetrics {
    pub memory_bytes: u64,
    pub memory_mb: u64,
    /// CPU usage as percentage (0.0 - 100.0+)
    pub cpu_percent: f32,
    pub memory_high: bool,
    pub cpu_high: bool,
}

/// Samples the daemon's own resource usage through `sysinfo`.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes process information and returns current metrics.
    ///
    /// CPU usage is computed against the previous refresh, so the first
    /// sample after construction reads zero.
    pub fn refresh(&mut self) -> ProcessMetrics {
        // Per-process refresh alone does not compute CPU usage
        self.system.refresh_all();

        let (memory_bytes, cpu_percent) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        let memory_mb = memory_bytes / 1024 / 1024;
        ProcessMetrics {
            memory_bytes,
            memory_mb,
            cpu_percent,
            memory_high: memory_mb > self.memory_threshold_mb,
            cpu_high: cpu_percent > self.cpu_threshold_percent,
        }
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Registry churn
// ============================================================================

/// Registry changes counted between two reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Churn {
    pub added: u64,
    pub replaced: u64,
    pub removed: u64,
    pub expired: u64,
    pub disconnected: u64,
}

/// Listener that counts registry changes.
#[derive(Debug, Default)]
pub struct ChurnCounter {
    added: AtomicU64,
    replaced: AtomicU64,
    removed: AtomicU64,
    expired: AtomicU64,
    disconnected: AtomicU64,
}

impl ChurnCounter {
    /// Returns the counts so far and resets them.
    pub fn take(&self) -> Churn {
        Churn {
            added: self.added.swap(0, Ordering::Relaxed),
            replaced: self.replaced.swap(0, Ordering::Relaxed),
            removed: self.removed.swap(0, Ordering::Relaxed),
            expired: self.expired.swap(0, Ordering::Relaxed),
            disconnected: self.disconnected.swap(0, Ordering::Relaxed),
        }
    }
}

impl StateChangeListener for ChurnCounter {
    fn on_addition(&self, _id: &DeviceId, _device: &Arc<Device>, old: Option<&Arc<Device>>) {
        let counter = if old.is_some() {
            &self.replaced
        } else {
            &self.added
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_removal(&self, _id: &DeviceId, _device: &Arc<Device>, reason: RemovalReason) {
        let counter = match reason {
            RemovalReason::Explicit => &self.removed,
            RemovalReason::Expired => &self.expired,
            RemovalReason::Disconnected => &self.disconnected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Starts the periodic stats report for `registry`.
pub fn start_reporter(
    scheduler: &Scheduler,
    registry: Arc<DeviceRegistry>,
    config: StatsConfig,
) -> ScheduledTask {
    let churn = Arc::new(ChurnCounter::default());
    registry.add_listener(churn.clone());

    let mut monitor = ProcessMonitor::new();
    // Baseline for the first CPU sample
    let _ = monitor.refresh();

    info!(
        interval_ms = u64::try_from(config.interval.as_millis()).unwrap_or(u64::MAX),
        memory_threshold_mb = monitor.memory_threshold_mb(),
        "Stats reporter started"
    );

    scheduler.schedule_at_fixed_rate("stats", config.interval, config.interval, move || {
        let metrics = monitor.refresh();
        log_stats(registry.size(), churn.take(), &metrics, &monitor);
    })
}

fn log_stats(devices: usize, churn: Churn, metrics: &ProcessMetrics, monitor: &ProcessMonitor) {
    let cpu_percent = format!("{:.1}", metrics.cpu_percent);

    // Churn was already taken, so every branch has to carry it
    if metrics.memory_high {
        warn!(
            devices,
            added = churn.added,
            replaced = churn.replaced,
            removed = churn.removed,
            expired = churn.expired,
            disconnected = churn.disconnected,
            memory_mb = metrics.memory_mb,
            threshold_mb = monitor.memory_threshold_mb(),
            cpu_percent,
            "HIGH MEMORY: Daemon memory usage above threshold"
        );
    } else if metrics.cpu_high {
        warn!(
            devices,
            added = churn.added,
            replaced = churn.replaced,
            removed = churn.removed,
            expired = churn.expired,
            disconnected = churn.disconnected,
            memory_mb = metrics.memory_mb,
            cpu_percent,
            threshold_percent = monitor.cpu_threshold_percent(),
            "HIGH CPU: Daemon CPU usage above threshold"
        );
    } else {
        info!(
            devices,
            added = churn.added,
            replaced = churn.replaced,
            removed = churn.removed,
            expired = churn.expired,
            disconnected = churn.disconnected,
            memory_mb = metrics.memory_mb,
            cpu_percent,
            "Liveness stats"
        );
    }
}
