//! Connection-state notifier.
//!
//! Transports report raw "channel active" and "channel inactive" events,
//! possibly from different I/O workers and possibly more than once. The
//! notifier turns them into a clean per-connection lifecycle:
//!
//! - exactly one `Active` callback per established connection
//! - exactly one `Inactive` callback per teardown, always after `Active`
//! - nothing at all for a connection torn down before it became active
//!
//! [`RegistryBridge`] is the listener that maps this lifecycle onto the
//! device registry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use dashmap::DashMap;
use tracing::{debug, error};

use devlive_core::{same_connection, Device, DeviceId, SharedConnection};

use crate::registry::{panic_message, DeviceRegistry, RemovalReason};

/// Connection state reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Active,
    Inactive,
}

/// A connection as seen by listeners.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    id: DeviceId,
    handle: SharedConnection,
}

impl ConnectionInfo {
    pub fn new(id: impl Into<DeviceId>, handle: SharedConnection) -> Self {
        Self {
            id: id.into(),
            handle,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn handle(&self) -> &SharedConnection {
        &self.handle
    }
}

/// Observer of connection lifecycle changes.
///
/// Callbacks for one connection are serialized; callbacks for different
/// connections may run concurrently.
pub trait ActiveStateListener: Send + Sync {
    fn on_changed(&self, connection: &ConnectionInfo, state: ActiveState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Active,
    Closed,
}

#[derive(Debug)]
struct Slot {
    info: ConnectionInfo,
    state: Mutex<SlotState>,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Identity of a handle; stable while the slot keeps the handle alive.
type ConnectionKey = usize;

fn key_of(handle: &SharedConnection) -> ConnectionKey {
    Arc::as_ptr(handle) as *const () as usize
}

/// Deduplicates and orders transport connection events.
#[derive(Default)]
pub struct ConnectionStateNotifier {
    slots: DashMap<ConnectionKey, Arc<Slot>>,
    listeners: RwLock<Vec<Arc<dyn ActiveStateListener>>>,
}

impl ConnectionStateNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn ActiveStateListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Reports that `handle` became active for device `id`.
    ///
    /// Returns true if listeners were notified. Repeated reports for the same
    /// handle, and reports for a handle that is already closed, are ignored.
    pub fn on_active(&self, id: impl Into<DeviceId>, handle: SharedConnection) -> bool {
        if !handle.is_open() {
            debug!("Ignoring activation of a closed connection");
            return false;
        }

        let key = key_of(&handle);
        let slot = Arc::clone(
            self.slots
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Slot {
                        info: ConnectionInfo::new(id, handle),
                        state: Mutex::new(SlotState::Pending),
                    })
                })
                .value(),
        );

        {
            let mut state = slot.state();
            if *state != SlotState::Pending {
                return false;
            }
            // A teardown may have completed between the first check and the insert
            if slot.info.handle.is_open() {
                *state = SlotState::Active;
                debug!(device_id = %slot.info.id, "Connection active");
                self.fire(&slot.info, ActiveState::Active);
                return true;
            }
            *state = SlotState::Closed;
        }

        self.slots.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
        false
    }

    /// Reports that `handle` was torn down.
    ///
    /// The handle must already report `is_open() == false`, so that a late
    /// activation for it is ignored. Returns true if listeners were notified.
    pub fn on_inactive(&self, handle: &SharedConnection) -> bool {
        let key = key_of(handle);
        let Some(slot) = self.slot(key) else {
            return false;
        };

        let notified = {
            let mut state = slot.state();
            match std::mem::replace(&mut *state, SlotState::Closed) {
                SlotState::Active => {
                    debug!(device_id = %slot.info.id, "Connection inactive");
                    self.fire(&slot.info, ActiveState::Inactive);
                    true
                }
                SlotState::Pending | SlotState::Closed => false,
            }
        };

        // Slot lock released first: map shard locks are never taken under it
        self.slots.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
        notified
    }

    /// Number of connections currently active.
    pub fn active_connections(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        slots
            .iter()
            .filter(|slot| *slot.state() == SlotState::Active)
            .count()
    }

    pub fn is_active(&self, handle: &SharedConnection) -> bool {
        self.slot(key_of(handle))
            .is_some_and(|slot| *slot.state() == SlotState::Active)
    }

    fn slot(&self, key: ConnectionKey) -> Option<Arc<Slot>> {
        self.slots.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    fn fire(&self, info: &ConnectionInfo, state: ActiveState) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_changed(info, state))) {
                error!(
                    device_id = %info.id,
                    ?state,
                    panic = panic_message(payload.as_ref()),
                    "Active state listener panicked"
                );
            }
        }
    }
}

impl std::fmt::Debug for ConnectionStateNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateNotifier")
            .field("connections", &self.slots.len())
            .finish()
    }
}

/// Maps connection lifecycle onto registry membership.
///
/// `Active` inserts a device bound to the connection, replacing a device
/// bound to another connection. `Inactive` removes the device only while it
/// is still bound to the connection being torn down.
#[derive(Debug, Clone)]
pub struct RegistryBridge {
    registry: Arc<DeviceRegistry>,
}

impl RegistryBridge {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }
}

impl ActiveStateListener for RegistryBridge {
    fn on_changed(&self, connection: &ConnectionInfo, state: ActiveState) {
        let id = connection.id();
        let handle = connection.handle();

        match state {
            ActiveState::Active => {
                let bound = self
                    .registry
                    .get(id)
                    .is_some_and(|device| same_connection(device.connection(), handle));
                if !bound {
                    self.registry.put(Device::new(id.clone(), Arc::clone(handle)));
                }
            }
            ActiveState::Inactive => {
                self.registry.remove_if(id, RemovalReason::Disconnected, |device| {
                    same_connection(device.connection(), handle)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::SimulatedConnection;
    use devlive_core::ConnectionHandle;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, ActiveState)>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<(String, ActiveState)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ActiveStateListener for Recorder {
        fn on_changed(&self, connection: &ConnectionInfo, state: ActiveState) {
            self.events
                .lock()
                .unwrap()
                .push((connection.id().to_string(), state));
        }
    }

    fn setup() -> (ConnectionStateNotifier, Arc<Recorder>) {
        let notifier = ConnectionStateNotifier::new();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone());
        (notifier, recorder)
    }

    #[test]
    fn test_active_then_inactive_fires_once_each() {
        let (notifier, recorder) = setup();
        let handle: SharedConnection = Arc::new(SimulatedConnection::new());

        assert!(notifier.on_active("A", handle.clone()));
        assert!(!notifier.on_active("A", handle.clone()));
        assert!(notifier.is_active(&handle));
        assert_eq!(notifier.active_connections(), 1);

        assert!(notifier.on_inactive(&handle));
        assert!(!notifier.on_inactive(&handle));
        assert_eq!(notifier.active_connections(), 0);

        assert_eq!(
            recorder.events(),
            vec![
                ("A".to_string(), ActiveState::Active),
                ("A".to_string(), ActiveState::Inactive),
            ]
        );
    }

    #[test]
    fn test_teardown_without_activation_is_silent() {
        let (notifier, recorder) = setup();
        let handle: SharedConnection = Arc::new(SimulatedConnection::new());

        assert!(!notifier.on_inactive(&handle));
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_closed_handle_never_activates() {
        let (notifier, recorder) = setup();
        let conn = Arc::new(SimulatedConnection::new());
        conn.close().unwrap();

        assert!(!notifier.on_active("A", conn));
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_bridge_binds_devices_to_connections() {
        let registry = Arc::new(DeviceRegistry::new());
        let notifier = ConnectionStateNotifier::new();
        notifier.add_listener(Arc::new(RegistryBridge::new(Arc::clone(&registry))));
        let id = DeviceId::new("A");

        let first: SharedConnection = Arc::new(SimulatedConnection::new());
        let second: SharedConnection = Arc::new(SimulatedConnection::new());

        notifier.on_active("A", first.clone());
        notifier.on_active("A", second.clone());
        let device = registry.get(&id).unwrap();
        assert!(same_connection(device.connection(), &second));

        // Late teardown of the replaced connection leaves the device alone
        notifier.on_inactive(&first);
        assert!(registry.contains(&id));

        notifier.on_inactive(&second);
        assert!(!registry.contains(&id));
    }
}
