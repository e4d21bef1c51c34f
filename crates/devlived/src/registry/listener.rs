//! Extension points of the registry: state-change listeners and device factories.

use std::sync::Arc;

use devlive_core::{Attributes, Device, DeviceId, FactoryError};
use tracing::info;

use super::events::RemovalReason;

/// Synchronous observer of registry membership changes.
///
/// Callbacks run on the thread that performed the mutation, while the
/// registry's mutation lock is held. They must be fast, must not block, and
/// must not call mutating registry methods (read-only lookups are fine).
/// A panicking listener is logged and skipped; it never corrupts the registry.
pub trait StateChangeListener: Send + Sync {
    /// A device was inserted. `old` is the device it replaced, if any, so the
    /// listener can release resources tied to it.
    fn on_addition(&self, id: &DeviceId, device: &Arc<Device>, old: Option<&Arc<Device>>) {
        let _ = (id, device, old);
    }

    /// A device was removed with notification.
    fn on_removal(&self, id: &DeviceId, device: &Arc<Device>, reason: RemovalReason) {
        let _ = (id, device, reason);
    }
}

/// Builds devices for `DeviceRegistry::get_or_create_from`.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, id: &DeviceId, attributes: &Attributes) -> Result<Device, FactoryError>;
}

impl<F> DeviceFactory for F
where
    F: Fn(&DeviceId, &Attributes) -> Result<Device, FactoryError> + Send + Sync,
{
    fn create(&self, id: &DeviceId, attributes: &Attributes) -> Result<Device, FactoryError> {
        self(id, attributes)
    }
}

/// Listener that logs devices going online and offline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl StateChangeListener for LoggingListener {
    fn on_addition(&self, id: &DeviceId, device: &Arc<Device>, old: Option<&Arc<Device>>) {
        match old {
            Some(old) => info!(
                device_id = %id,
                device = %device,
                replaced = %old,
                "Device replaced"
            ),
            None => info!(device_id = %id, device = %device, "Device online"),
        }
    }

    fn on_removal(&self, id: &DeviceId, device: &Arc<Device>, reason: RemovalReason) {
        info!(
            device_id = %id,
            reason = %reason,
            online_ms = u64::try_from(device.online_for().as_millis()).unwrap_or(u64::MAX),
            online_since = %device.online_since().format("%Y-%m-%d %H:%M:%S"),
            "Device offline"
        );
    }
}
