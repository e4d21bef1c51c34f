//! devlived - device liveness runtime
//!
//! This crate provides the runtime services around the domain types of
//! `devlive-core`:
//! - `scheduler` - injected scheduling capability (recurring and one-shot tasks)
//! - `registry` - concurrent device registry with listeners and events
//! - `sweeper` - periodic eviction of silent devices
//! - `reconnect` - auto-reconnect timer for client-role connections
//! - `notifier` - transport connect/disconnect events to registry membership
//! - `stats` - periodic device count and process resource report
//! - `simulate` - in-process transport stand-ins
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        devlived                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  transport events          inbound traffic                   │
//! │        │                         │                           │
//! │        ▼                         ▼ touch / get_or_create     │
//! │  ┌────────────────────┐   ┌─────────────────┐                │
//! │  │ConnectionState     │──▶│ DeviceRegistry  │──▶ listeners   │
//! │  │Notifier            │   └────────▲────────┘    + events    │
//! │  └────────────────────┘            │ remove_if               │
//! │                           ┌────────┴────────┐                │
//! │  ┌────────────────┐       │ LivenessSweeper │                │
//! │  │ ReconnectTimer │       └────────▲────────┘                │
//! │  └───────▲────────┘                │                         │
//! │          └──────────── Scheduler ──┘                         │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Listener panics are caught and logged, never propagated

pub mod notifier;
pub mod reconnect;
pub mod registry;
pub mod scheduler;
pub mod simulate;
pub mod stats;
pub mod sweeper;

pub use notifier::{ActiveState, ActiveStateListener, ConnectionInfo, ConnectionStateNotifier, RegistryBridge};
pub use reconnect::{ConnectError, Connector, ReconnectTimer};
pub use registry::{
    DeviceEvent, DeviceFactory, DeviceRegistry, LoggingListener, RegistryError, RemovalReason,
    StateChangeListener,
};
pub use scheduler::{ScheduledTask, Scheduler};
pub use sweeper::{LivenessSweeper, SweepError, SweepReport};
