//! TOML configuration for the liveness services.
//!
//! ```toml
//! log_level = "info"
//!
//! [sweep]
//! expire_after_ms = 5000
//! sweep_interval_ms = 1000
//!
//! [reconnect]
//! enabled = true
//! period_ms = 10000
//! fire_immediately = true
//!
//! [stats]
//! interval_ms = 5000
//! ```
//!
//! Every field is optional; missing fields take the defaults shown above.
//! Durations are written as integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DEVLIVE_CONFIG";

pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_millis(5000);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECONNECT_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Config schema types
// ============================================================================

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// `tracing` filter directive applied when `RUST_LOG` is unset.
    pub log_level: String,
    pub sweep: SweepConfig,
    pub reconnect: ReconnectConfig,
    pub stats: StatsConfig,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sweep: SweepConfig::default(),
            reconnect: ReconnectConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

/// Eviction deadline and scan cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Maximum silence before a device is evicted.
    #[serde(rename = "expire_after_ms", with = "millis")]
    pub expire_after: Duration,

    /// Time between two sweeps.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
}

impl SweepConfig {
    pub fn new(expire_after: Duration, sweep_interval: Duration) -> Self {
        Self {
            expire_after,
            sweep_interval,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        non_zero("sweep.expire_after_ms", self.expire_after)?;
        non_zero("sweep.sweep_interval_ms", self.sweep_interval)
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRE_AFTER, DEFAULT_SWEEP_INTERVAL)
    }
}

/// Auto-reconnect behaviour for client-role connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether the reconnect timer schedules anything at all.
    pub enabled: bool,

    /// Time between two reconnect checks.
    #[serde(rename = "period_ms", with = "millis")]
    pub period: Duration,

    /// Run the first check on start instead of after one period.
    pub fire_immediately: bool,
}

impl ReconnectConfig {
    pub fn enabled(period: Duration) -> Self {
        Self {
            enabled: true,
            period,
            fire_immediately: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the first check.
    pub fn initial_delay(&self) -> Duration {
        if self.fire_immediately {
            Duration::ZERO
        } else {
            self.period
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.enabled {
            non_zero("reconnect.period_ms", self.period)?;
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::enabled(DEFAULT_RECONNECT_PERIOD)
    }
}

/// Periodic statistics report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl LivenessConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let cfg: Self = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads the file at `path`, returning defaults if it does not exist.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Loads from an explicit path, `DEVLIVE_CONFIG`, or the platform default.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        match resolve_path(explicit) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.sweep.validate()?;
        self.reconnect.validate()?;
        non_zero("stats.interval_ms", self.stats.interval)
    }
}

/// Resolves which config file to read, if any.
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    default_path()
}

/// `<platform config dir>/devlive/config.toml`.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("devlive").join("config.toml"))
}

fn non_zero(field: &'static str, value: Duration) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Serde adapter storing a `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LivenessConfig::default();
        assert_eq!(cfg.sweep.expire_after, Duration::from_millis(5000));
        assert_eq!(cfg.sweep.sweep_interval, Duration::from_millis(1000));
        assert_eq!(cfg.reconnect.period, Duration::from_secs(10));
        assert!(cfg.reconnect.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let cfg = LivenessConfig::from_toml_str(
            r#"
            [sweep]
            expire_after_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(cfg.sweep.expire_after, Duration::from_millis(1500));
        assert_eq!(cfg.sweep.sweep_interval, DEFAULT_SWEEP_INTERVAL);
        assert_eq!(cfg.reconnect, ReconnectConfig::default());
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = LivenessConfig::from_toml_str(
            r#"
            [sweep]
            sweep_interval_ms = 0
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "sweep.sweep_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_disabled_reconnect_ignores_zero_period() {
        let cfg = ReconnectConfig {
            enabled: false,
            period: Duration::ZERO,
            fire_immediately: false,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_initial_delay() {
        let mut cfg = ReconnectConfig::enabled(Duration::from_secs(3));
        assert_eq!(cfg.initial_delay(), Duration::ZERO);
        cfg.fire_immediately = false;
        assert_eq!(cfg.initial_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_toml_uses_millisecond_keys() {
        let text = LivenessConfig::default().to_toml_string().unwrap();
        assert!(text.contains("expire_after_ms = 5000"));
        assert!(text.contains("period_ms = 10000"));
        assert_eq!(LivenessConfig::from_toml_str(&text).unwrap(), LivenessConfig::default());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LivenessConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, LivenessConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[reconnect]\nenabled = false\n").unwrap();

        let cfg = LivenessConfig::load(Some(&path)).unwrap();
        assert!(!cfg.reconnect.enabled);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sweep\nexpire_after_ms = ").unwrap();

        assert!(matches!(
            LivenessConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
