//! Device registry.
//!
//! The registry is the single owner of every tracked device. Ingest paths
//! look devices up (or create them) and refresh their clocks; the liveness
//! sweeper and the connection-state notifier remove them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │  I/O workers    │────▶│ DeviceRegistry  │────▶│ StateChangeListener  │
//! └─────────────────┘     └─────────────────┘     │ (sync, caller thread)│
//!         │                       │               └──────────────────────┘
//!         │ get_or_create/touch   │ DeviceEvent   ┌──────────────────────┐
//!         ▼                       └──────────────▶│ broadcast subscribers│
//!  DashMap<DeviceId, Arc<Device>>                 └──────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Lock poisoning is recovered, listener panics are caught and logged

mod events;
mod listener;
mod store;

pub use events::{DeviceEvent, RegistryError, RemovalReason};
pub use listener::{DeviceFactory, LoggingListener, StateChangeListener};
pub use store::DeviceRegistry;

pub(crate) use store::panic_message;
