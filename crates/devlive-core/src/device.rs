//! Device domain entity and its identifier.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::clock::ExpiryClock;
use crate::error::TransportError;
use crate::transport::SharedConnection;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Stable identifier of a remote peer.
///
/// Usually derived from the payload (a hex serial number) for datagram
/// transports, or from the channel id for stream transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Free-form attributes handed to a device factory.
pub type Attributes = Map<String, Value>;

// ============================================================================
// Sequence Tracking
// ============================================================================

/// Classification of an observed packet sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// Higher than anything seen so far; recorded.
    Advanced,
    /// Equal to the last recorded number.
    Duplicate,
    /// Lower than the last recorded number.
    Stale,
}

// ============================================================================
// Device
// ============================================================================

/// One logical remote peer.
///
/// All mutable state is atomic so a device can be refreshed through a shared
/// reference by any I/O worker.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,

    /// Handle to the transport connection the device was last seen on.
    connection: SharedConnection,

    clock: ExpiryClock,

    /// Wall-clock creation time, for logs and reports.
    online_since: DateTime<Utc>,

    /// Last recorded sequence number plus one; zero means none yet.
    sequence: AtomicU64,

    attributes: Attributes,
}

impl Device {
    /// Creates a device that is considered seen right now.
    pub fn new(id: impl Into<DeviceId>, connection: SharedConnection) -> Self {
        Self {
            id: id.into(),
            connection,
            clock: ExpiryClock::new(),
            online_since: Utc::now(),
            sequence: AtomicU64::new(0),
            attributes: Attributes::new(),
        }
    }

    /// Attaches creation attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.local_addr()
    }

    pub fn clock(&self) -> &ExpiryClock {
        &self.clock
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Refreshes the last-seen mark. Call on every inbound unit.
    pub fn touch(&self) {
        self.clock.touch();
    }

    pub fn last_seen(&self) -> Instant {
        self.clock.last_seen()
    }

    pub fn online_since(&self) -> DateTime<Utc> {
        self.online_since
    }

    /// Time since the device was created, measured on the monotonic clock.
    pub fn online_for(&self) -> Duration {
        self.clock.created_at().elapsed()
    }

    /// Pushes outbound bytes to the peer.
    pub fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.connection.send(data)
    }

    /// Asks the transport to close the connection.
    pub fn close(&self) -> Result<(), TransportError> {
        self.connection.close()
    }

    /// Records an inbound sequence number and classifies it.
    pub fn record_sequence(&self, seq: u64) -> SequenceStatus {
        let marker = seq.saturating_add(1);
        match self
            .sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (marker > current).then_some(marker)
            }) {
            Ok(_) => SequenceStatus::Advanced,
            Err(current) if current == marker => SequenceStatus::Duplicate,
            Err(_) => SequenceStatus::Stale,
        }
    }

    /// The highest recorded sequence number, if any.
    pub fn last_sequence(&self) -> Option<u64> {
        match self.sequence.load(Ordering::Acquire) {
            0 => None,
            marker => Some(marker - 1),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if let Some(peer) = self.peer_addr() {
            write!(f, "@{peer}")?;
        }
        if let Some(local) = self.local_addr() {
            write!(f, " via {local}")?;
        }
        Ok(())
    }
}
