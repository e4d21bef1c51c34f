//! The device registry - owns every tracked `Device`.
//!
//! # Locking
//!
//! Reads (`get`, `touch`, `contains`, snapshots) go straight to a `DashMap`
//! and never take the registry lock, so the ingest path stays lock-free for
//! known devices. Every mutation (`get_or_create`, `put`, `remove*`) runs
//! under a single per-registry mutex, and listeners are notified before that
//! mutex is released. This gives a total order of notifications per registry:
//! a removal can never be observed after a later addition for the same id.
//!
//! `get_or_create` is double-checked: a lock-free lookup first, then a
//! re-check under the lock before the factory runs. At most one factory call
//! happens per unseen id, however many callers race for it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error};

use devlive_core::{Attributes, Device, DeviceId};

use super::events::{DeviceEvent, RegistryError, RemovalReason};
use super::listener::{DeviceFactory, StateChangeListener};

/// Capacity of the event broadcast channel.
const EVENT_BUFFER: usize = 100;

/// Concurrent map from device id to device.
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Arc<Device>>,

    /// Serializes mutations and their notifications.
    mutation: Mutex<()>,

    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,

    /// Factory used by `get_or_create_from`.
    factory: Option<Arc<dyn DeviceFactory>>,

    /// Event publisher for asynchronous subscribers
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            devices: DashMap::new(),
            mutation: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            factory: None,
            events,
        }
    }

    /// Creates a registry whose `get_or_create_from` builds devices with `factory`.
    pub fn with_factory(factory: impl DeviceFactory + 'static) -> Self {
        Self {
            factory: Some(Arc::new(factory)),
            ..Self::new()
        }
    }

    /// Registers a synchronous state-change listener.
    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Subscribes to the asynchronous event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.devices.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Snapshot of the current ids.
    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of the current devices.
    pub fn values(&self) -> Vec<Arc<Device>> {
        self.devices
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Refreshes the device's last-seen mark. Returns false if absent.
    pub fn touch(&self, id: &DeviceId) -> bool {
        match self.devices.get(id) {
            Some(entry) => {
                entry.value().touch();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Returns the device for `id`, building it with `factory` if absent.
    ///
    /// The factory runs under the registry lock and must not call back into
    /// the registry. If it fails, the error is returned and the registry is
    /// left unchanged.
    pub fn get_or_create<F, E>(&self, id: &DeviceId, factory: F) -> Result<Arc<Device>, E>
    where
        F: FnOnce(&DeviceId) -> Result<Device, E>,
    {
        if let Some(device) = self.get(id) {
            return Ok(device);
        }

        let _guard = self.lock();
        if let Some(device) = self.get(id) {
            return Ok(device);
        }

        let device = Arc::new(factory(id)?);
        self.devices.insert(id.clone(), Arc::clone(&device));
        debug!(device_id = %id, devices = self.devices.len(), "Device created");
        self.notify_addition(id, &device, None);

        Ok(device)
    }

    /// `get_or_create` using the configured factory and `attributes`.
    pub fn get_or_create_from(
        &self,
        id: &DeviceId,
        attributes: &Attributes,
    ) -> Result<Arc<Device>, RegistryError> {
        let factory = self.factory.as_ref().ok_or(RegistryError::NoFactory)?;
        self.get_or_create(id, |id| factory.create(id, attributes).map_err(RegistryError::from))
    }

    /// Inserts `device` under its own id, replacing any previous device.
    ///
    /// The addition notification carries the replaced device so listeners can
    /// clean it up before it is dropped.
    pub fn put(&self, device: Device) -> Option<Arc<Device>> {
        let id = device.id().clone();
        let device = Arc::new(device);

        let _guard = self.lock();
        let previous = self.devices.insert(id.clone(), Arc::clone(&device));
        debug!(
            device_id = %id,
            replaced = previous.is_some(),
            devices = self.devices.len(),
            "Device stored"
        );
        self.notify_addition(&id, &device, previous.as_ref());

        previous
    }

    /// Removes a device with an `Explicit` removal notification.
    pub fn remove(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.remove_with_reason(id, RemovalReason::Explicit)
    }

    /// Removes a device and notifies listeners with `reason`.
    pub fn remove_with_reason(&self, id: &DeviceId, reason: RemovalReason) -> Option<Arc<Device>> {
        self.remove_if(id, reason, |_| true)
    }

    /// Removes a device without notifying anyone.
    pub fn remove_silently(&self, id: &DeviceId) -> Option<Arc<Device>> {
        let _guard = self.lock();
        let removed = self.devices.remove(id).map(|(_, device)| device);
        if removed.is_some() {
            debug!(device_id = %id, "Device removed silently");
        }
        removed
    }

    /// Removes the device only if `predicate` holds for the current entry.
    ///
    /// The predicate is evaluated under the registry lock, so it sees the same
    /// entry that gets removed. Used to evict a specific device instance
    /// without racing a concurrent replacement.
    pub fn remove_if<P>(&self, id: &DeviceId, reason: RemovalReason, predicate: P) -> Option<Arc<Device>>
    where
        P: FnOnce(&Arc<Device>) -> bool,
    {
        let _guard = self.lock();
        let (_, device) = self
            .devices
            .remove_if(id, |_, device| predicate(device))?;

        debug!(
            device_id = %id,
            reason = %reason,
            devices = self.devices.len(),
            "Device removed"
        );
        self.notify_removal(id, &device, reason);

        Some(device)
    }

    // ========================================================================
    // Notification
    // ========================================================================

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is unit; a poisoned lock carries no broken state.
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> Vec<Arc<dyn StateChangeListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_addition(&self, id: &DeviceId, device: &Arc<Device>, old: Option<&Arc<Device>>) {
        for listener in self.listeners() {
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| listener.on_addition(id, device, old)))
            {
                error!(
                    device_id = %id,
                    panic = panic_message(payload.as_ref()),
                    "State change listener panicked on addition"
                );
            }
        }

        // No subscribers is not an error
        let _ = self.events.send(DeviceEvent::Added {
            device_id: id.clone(),
            replaced: old.is_some(),
        });
    }

    fn notify_removal(&self, id: &DeviceId, device: &Arc<Device>, reason: RemovalReason) {
        for listener in self.listeners() {
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| listener.on_removal(id, device, reason)))
            {
                error!(
                    device_id = %id,
                    panic = panic_message(payload.as_ref()),
                    "State change listener panicked on removal"
                );
            }
        }

        let _ = self.events.send(DeviceEvent::Removed {
            device_id: id.clone(),
            reason,
        });
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::SimulatedConnection;
    use devlive_core::FactoryError;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn device(id: &str) -> Device {
        Device::new(id, Arc::new(SimulatedConnection::new()))
    }

    /// Records every callback as a compact string.
    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    impl StateChangeListener for Journal {
        fn on_addition(&self, id: &DeviceId, _device: &Arc<Device>, old: Option<&Arc<Device>>) {
            let tag = if old.is_some() { "replace" } else { "add" };
            self.entries.lock().unwrap().push(format!("{tag}:{id}"));
        }

        fn on_removal(&self, id: &DeviceId, _device: &Arc<Device>, reason: RemovalReason) {
            self.entries
                .lock()
                .unwrap()
                .push(format!("remove:{id}:{reason:?}"));
        }
    }

    struct Panicker;

    impl StateChangeListener for Panicker {
        fn on_addition(&self, _: &DeviceId, _: &Arc<Device>, _: Option<&Arc<Device>>) {
            panic!("listener bug");
        }

        fn on_removal(&self, _: &DeviceId, _: &Arc<Device>, _: RemovalReason) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_get_or_create_creates_once() {
        let registry = DeviceRegistry::new();
        let journal = Arc::new(Journal::default());
        registry.add_listener(journal.clone());
        let id = DeviceId::new("A");

        let first = registry
            .get_or_create(&id, |id| Ok::<_, Infallible>(device(id.as_str())))
            .unwrap();
        let second = registry
            .get_or_create(&id, |_| -> Result<Device, Infallible> {
                panic!("factory must not run for a known id")
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.size(), 1);
        assert_eq!(journal.entries(), vec!["add:A"]);
    }

    #[test]
    fn test_factory_error_leaves_registry_unchanged() {
        let registry = DeviceRegistry::new();
        let journal = Arc::new(Journal::default());
        registry.add_listener(journal.clone());
        let id = DeviceId::new("broken");

        let result = registry.get_or_create(&id, |id| Err(FactoryError::new(id.clone(), "nope")));

        assert!(result.is_err());
        assert!(registry.is_empty());
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_get_or_create_from_without_factory() {
        let registry = DeviceRegistry::new();
        let result = registry.get_or_create_from(&DeviceId::new("A"), &Attributes::new());
        assert!(matches!(result, Err(RegistryError::NoFactory)));
    }

    #[test]
    fn test_get_or_create_from_passes_attributes() {
        let registry = DeviceRegistry::with_factory(|id: &DeviceId, attrs: &Attributes| {
            Ok::<_, FactoryError>(device(id.as_str()).with_attributes(attrs.clone()))
        });
        let mut attrs = Attributes::new();
        attrs.insert("kind".into(), "collector".into());

        let dev = registry
            .get_or_create_from(&DeviceId::new("A"), &attrs)
            .unwrap();
        assert_eq!(dev.attribute("kind").and_then(|v| v.as_str()), Some("collector"));
    }

    #[test]
    fn test_put_reports_replaced_device() {
        let registry = DeviceRegistry::new();
        let journal = Arc::new(Journal::default());
        registry.add_listener(journal.clone());

        assert!(registry.put(device("A")).is_none());
        let old = registry.put(device("A"));

        assert!(old.is_some());
        assert_eq!(registry.size(), 1);
        assert_eq!(journal.entries(), vec!["add:A", "replace:A"]);
    }

    #[test]
    fn test_remove_notifies_once() {
        let registry = DeviceRegistry::new();
        let journal = Arc::new(Journal::default());
        registry.add_listener(journal.clone());
        let id = DeviceId::new("A");
        registry.put(device("A"));

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());

        assert_eq!(journal.entries(), vec!["add:A", "remove:A:Explicit"]);
    }

    #[test]
    fn test_remove_silently_skips_notification() {
        let registry = DeviceRegistry::new();
        let journal = Arc::new(Journal::default());
        registry.add_listener(journal.clone());
        let id = DeviceId::new("A");
        registry.put(device("A"));

        assert!(registry.remove_silently(&id).is_some());
        assert!(!registry.contains(&id));
        assert_eq!(journal.entries(), vec!["add:A"]);
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("A");
        registry.put(device("A"));

        assert!(registry
            .remove_if(&id, RemovalReason::Expired, |_| false)
            .is_none());
        assert!(registry.contains(&id));
        assert!(registry
            .remove_if(&id, RemovalReason::Expired, |_| true)
            .is_some());
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_touch_absent_is_noop() {
        let registry = DeviceRegistry::new();
        assert!(!registry.touch(&DeviceId::new("ghost")));
        registry.put(device("A"));
        assert!(registry.touch(&DeviceId::new("A")));
    }

    #[test]
    fn test_snapshots() {
        let registry = DeviceRegistry::new();
        registry.put(device("A"));
        registry.put(device("B"));

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec![DeviceId::new("A"), DeviceId::new("B")]);
        assert_eq!(registry.values().len(), 2);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = DeviceRegistry::new();
        let journal = Arc::new(Journal::default());
        registry.add_listener(Arc::new(Panicker));
        registry.add_listener(journal.clone());
        let id = DeviceId::new("A");

        registry.put(device("A"));
        registry.remove(&id);

        assert!(registry.is_empty());
        assert_eq!(journal.entries(), vec!["add:A", "remove:A:Explicit"]);

        // Registry still usable afterwards
        registry.put(device("B"));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_concurrent_get_or_create_constructs_once() {
        const CALLERS: usize = 16;

        let registry = DeviceRegistry::new();
        let journal = Arc::new(Journal::default());
        registry.add_listener(journal.clone());
        let constructed = AtomicUsize::new(0);
        let barrier = Barrier::new(CALLERS);
        let id = DeviceId::new("contended");

        let devices: Vec<Arc<Device>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        registry
                            .get_or_create(&id, |id| {
                                constructed.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, Infallible>(device(id.as_str()))
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert_eq!(journal.entries(), vec!["add:contended"]);
        assert!(devices.iter().all(|d| Arc::ptr_eq(d, &devices[0])));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        let id = DeviceId::new("A");

        registry.put(device("A"));
        registry.remove_with_reason(&id, RemovalReason::Disconnected);

        assert_eq!(
            rx.recv().await.unwrap(),
            DeviceEvent::Added {
                device_id: id.clone(),
                replaced: false
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            DeviceEvent::Removed {
                device_id: id,
                reason: RemovalReason::Disconnected
            }
        );
    }
}
