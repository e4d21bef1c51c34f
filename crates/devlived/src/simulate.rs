//! In-process stand-ins for the transport layer.
//!
//! - `SimulatedConnection`: a connection handle that records traffic
//! - `SimulatedConnector`: a client connector that fails a fixed number of
//!   times before connecting
//! - `Simulation`: a set of synthetic devices producing traffic, some of
//!   which fall silent, used by `devlived simulate` to exercise eviction
//!
//! Synthetic devices come online through a `ConnectionStateNotifier`, the
//! same way a real transport reports accepted connections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use devlive_core::{ConnectionHandle, DeviceId, SequenceStatus, SharedConnection, TransportError};

use crate::notifier::ConnectionStateNotifier;
use crate::reconnect::{ConnectError, Connector};
use crate::registry::DeviceRegistry;
use crate::scheduler::{ScheduledTask, Scheduler};

// ============================================================================
// Connection handle
// ============================================================================

/// Connection handle backed by counters instead of a socket.
#[derive(Debug, Default)]
pub struct SimulatedConnection {
    closed: AtomicBool,
    close_calls: AtomicUsize,
    packets_sent: AtomicUsize,
    bytes_sent: AtomicUsize,
    fail_close: bool,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl SimulatedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection whose `close` always errors.
    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    pub fn with_peer(peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..Self::default()
        }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn packets_sent(&self) -> usize {
        self.packets_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ConnectionHandle for SimulatedConnection {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.packets_sent.fetch_add(1, Ordering::SeqCst);
        self.bytes_sent.fetch_add(data.len(), Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::Other("simulated close failure".into()));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

// ============================================================================
// Client connector
// ============================================================================

/// Connector that refuses `failures` attempts, then connects.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    connected: AtomicBool,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    latency: Duration,
}

impl SimulatedConnector {
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    /// Each attempt takes `latency` before it resolves.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Drops the link so the next check sees it disconnected.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn do_connect(&self) -> Result<(), ConnectError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectError::Failed(format!(
                "simulated refusal on attempt {attempt}"
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(attempt, "Simulated connector connected");
        Ok(())
    }
}

// ============================================================================
// Synthetic devices
// ============================================================================

/// Port the synthetic devices appear to have connected to.
const SIMULATED_LISTEN_PORT: u16 = 9000;

/// Shape of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationPlan {
    pub devices: usize,
    /// How many of the devices stop talking after `silence_after`.
    pub silent: usize,
    pub traffic_interval: Duration,
    pub silence_after: Duration,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            devices: 8,
            silent: 2,
            traffic_interval: Duration::from_millis(500),
            silence_after: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct Peer {
    id: DeviceId,
    handle: SharedConnection,
    talking: AtomicBool,
    sequence: AtomicU64,
}

/// A running set of synthetic devices.
#[derive(Debug)]
pub struct Simulation {
    peers: Arc<Vec<Peer>>,
    traffic: ScheduledTask,
    silencer: ScheduledTask,
}

impl Simulation {
    /// Connects the plan's devices through `notifier` and starts their traffic.
    pub fn start(
        registry: Arc<DeviceRegistry>,
        notifier: Arc<ConnectionStateNotifier>,
        scheduler: &Scheduler,
        plan: SimulationPlan,
    ) -> Self {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), SIMULATED_LISTEN_PORT);
        let peers: Arc<Vec<Peer>> = Arc::new(
            (0..plan.devices)
                .map(|i| {
                    let port = 40_000u16.saturating_add(u16::try_from(i).unwrap_or(u16::MAX));
                    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
                    Peer {
                        id: DeviceId::new(format!("sim-{i:04}")),
                        handle: Arc::new(SimulatedConnection::with_peer(addr).with_local(local)),
                        talking: AtomicBool::new(true),
                        sequence: AtomicU64::new(0),
                    }
                })
                .collect(),
        );

        for peer in peers.iter() {
            notifier.on_active(peer.id.clone(), Arc::clone(&peer.handle));
        }

        let traffic = {
            let peers = Arc::clone(&peers);
            scheduler.schedule_at_fixed_rate(
                "sim-traffic",
                plan.traffic_interval,
                plan.traffic_interval,
                move || deliver(&registry, &notifier, &peers),
            )
        };

        let silent = plan.silent.min(plan.devices);
        let silencer = {
            let peers = Arc::clone(&peers);
            scheduler.schedule_once("sim-silence", plan.silence_after, move || {
                for peer in peers.iter().rev().take(silent) {
                    peer.talking.store(false, Ordering::SeqCst);
                    info!(device_id = %peer.id, "Simulated device went silent");
                }
            })
        };

        info!(
            devices = plan.devices,
            silent,
            silence_after_ms = u64::try_from(plan.silence_after.as_millis()).unwrap_or(u64::MAX),
            "Simulation started"
        );

        Self {
            peers,
            traffic,
            silencer,
        }
    }

    /// Number of devices still producing traffic.
    pub fn talking(&self) -> usize {
        self.peers
            .iter()
            .filter(|peer| peer.talking.load(Ordering::SeqCst))
            .count()
    }

    pub fn stop(&self) {
        self.traffic.cancel();
        self.silencer.cancel();
    }
}

/// One round of traffic: every talking peer sends a packet and gets an ack.
///
/// A peer whose device was evicted stops talking and reports its connection
/// torn down.
fn deliver(registry: &DeviceRegistry, notifier: &ConnectionStateNotifier, peers: &[Peer]) {
    for peer in peers.iter() {
        let Some(device) = registry.get(&peer.id) else {
            if peer.talking.swap(false, Ordering::SeqCst) || notifier.is_active(&peer.handle) {
                if let Err(e) = peer.handle.close() {
                    debug!(device_id = %peer.id, error = %e, "Simulated close failed");
                }
                notifier.on_inactive(&peer.handle);
            }
            continue;
        };
        if !peer.talking.load(Ordering::SeqCst) {
            continue;
        }

        device.touch();
        let seq = peer.sequence.fetch_add(1, Ordering::Relaxed);
        if device.record_sequence(seq) != SequenceStatus::Advanced {
            debug!(device_id = %peer.id, seq, "Out-of-order simulated packet");
        }
        if let Err(e) = device.send(&seq.to_be_bytes()) {
            debug!(device_id = %peer.id, error = %e, "Simulated ack dropped");
        }
    }
}
