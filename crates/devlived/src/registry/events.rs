//! Registry errors and events.
//!
//! - `RegistryError`: failures surfaced by registry operations
//! - `DeviceEvent`: events published on the registry's broadcast channel
//! - `RemovalReason`: why a device left the registry

use devlive_core::{DeviceId, FactoryError};
use thiserror::Error;

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
///
/// Lookups never fail: a missing device is reported as `None`.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// `get_or_create_from` was called on a registry without a factory.
    #[error("no device factory configured")]
    NoFactory,

    /// The factory refused to build the device.
    #[error(transparent)]
    Factory(#[from] FactoryError),
}

// ============================================================================
// Device Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device was inserted.
    Added {
        device_id: DeviceId,
        /// True when the insert replaced an existing device.
        replaced: bool,
    },

    /// A device was removed with notification.
    Removed {
        device_id: DeviceId,
        reason: RemovalReason,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Added { device_id, .. } | Self::Removed { device_id, .. } => device_id,
        }
    }
}

/// Reason why a device was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// A caller removed the device explicitly.
    Explicit,

    /// The liveness sweeper found the device silent past its deadline.
    Expired,

    /// The transport reported the connection inactive.
    Disconnected,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly removed"),
            Self::Expired => write!(f, "liveness deadline exceeded"),
            Self::Disconnected => write!(f, "connection inactive"),
        }
    }
}
