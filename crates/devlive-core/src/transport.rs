//! The slice of the transport layer the liveness core depends on.
//!
//! Sockets, framing and TLS live outside this workspace. A transport hands
//! the core a [`ConnectionHandle`] per connection; the core only ever pushes
//! outbound bytes through it and asks it to close.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TransportError;

/// Handle to one transport-level connection.
///
/// Implementations are expected to be cheap references (a channel sender,
/// a channel id) rather than the socket itself. Both methods must return
/// promptly: `send` enqueues, `close` requests a close.
pub trait ConnectionHandle: Send + Sync + fmt::Debug {
    /// Queues `data` for delivery to the peer.
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Requests the connection to close.
    fn close(&self) -> Result<(), TransportError>;

    /// Whether the transport still considers the connection open.
    fn is_open(&self) -> bool;

    /// Remote address, when the transport knows it.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Local address the connection is bound to, when the transport knows it.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Shared connection handle as stored by devices.
pub type SharedConnection = Arc<dyn ConnectionHandle>;

/// Identity comparison for shared handles.
///
/// Compares data pointers only; vtable pointers of the same type may differ
/// across codegen units.
pub fn same_connection(a: &SharedConnection, b: &SharedConnection) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
