//! Domain-specific error types following panic-free policy.

use std::path::PathBuf;

use thiserror::Error;

use crate::DeviceId;

/// Errors raised by a transport-level connection handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection was already closed by either side.
    #[error("connection closed")]
    Closed,

    /// The outbound queue could not accept more data.
    #[error("send buffer full ({pending} bytes pending)")]
    BufferFull { pending: usize },

    /// Any other transport failure, carried as text.
    #[error("transport error: {0}")]
    Other(String),
}

/// A device factory refused or failed to build a device.
#[derive(Error, Debug, Clone)]
#[error("failed to create device {id}: {reason}")]
pub struct FactoryError {
    pub id: DeviceId,
    pub reason: String,
}

impl FactoryError {
    pub fn new(id: DeviceId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field holds a value outside its accepted range.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
