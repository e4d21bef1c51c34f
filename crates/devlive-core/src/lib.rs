//! devlive core - shared types for device liveness tracking
//!
//! This crate provides the domain types shared between the runtime
//! services (`devlived`) and any transport that feeds them.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod transport;

// Re-exports for convenience
pub use clock::ExpiryClock;
pub use config::{LivenessConfig, ReconnectConfig, StatsConfig, SweepConfig};
pub use device::{Attributes, Device, DeviceId, SequenceStatus};
pub use error::{ConfigError, ConfigResult, FactoryError, TransportError};
pub use transport::{same_connection, ConnectionHandle, SharedConnection};
