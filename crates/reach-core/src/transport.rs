//! Transport driver contract
//!
//! Every concrete transport implements [`TransportDriver`] and funnels
//! its observations into one shared event channel consumed by the
//! routing engine. Drivers treat payloads as opaque bytes and never
//! parse packet contents.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::device::PeerDescriptor;
use crate::error::TransportError;
use crate::identity::NodeId;

/// The transport flavors the mesh knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Same-host channel for co-located processes
    Local,
    /// P2P-over-internet with rendezvous signaling
    Internet,
    /// Network-backed rendezvous relay (also store-and-forward)
    Rendezvous,
    /// Native Bluetooth LE, where the OS provides it
    BluetoothLe,
    /// Native Wi-Fi peer-to-peer, where the OS provides it
    WifiDirect,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Internet => write!(f, "internet"),
            Self::Rendezvous => write!(f, "rendezvous"),
            Self::BluetoothLe => write!(f, "ble"),
            Self::WifiDirect => write!(f, "wifi-direct"),
        }
    }
}

impl TransportKind {
    /// Static preference bias in the selector score
    pub fn bias(&self) -> i32 {
        match self {
            Self::Internet => 20,
            Self::Local => 15,
            Self::BluetoothLe | Self::WifiDirect => 10,
            Self::Rendezvous => 5,
        }
    }

    /// Initial latency estimate in milliseconds, before measurements
    pub fn default_latency_hint(&self) -> u32 {
        match self {
            Self::Local => 10,
            Self::WifiDirect => 30,
            Self::Internet => 80,
            Self::BluetoothLe => 120,
            Self::Rendezvous => 250,
        }
    }

    /// Whether observations arrive via a remote network service
    ///
    /// Network-observed peers get a longer liveness window than peers
    /// observed on a local channel.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Internet | Self::Rendezvous)
    }
}

/// Everything a driver reports upward
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer became reachable on this transport
    PeerObserved {
        kind: TransportKind,
        peer: PeerDescriptor,
    },

    /// Opaque bytes arrived from a peer
    Bytes {
        kind: TransportKind,
        from: NodeId,
        bytes: Bytes,
    },

    /// A peer's channel on this transport went away
    PeerLost { kind: TransportKind, peer_id: NodeId },

    /// The driver's overall availability flipped
    AvailabilityChanged { kind: TransportKind, available: bool },
}

/// Sender half of the shared driver event channel
pub type TransportEventSender = mpsc::Sender<TransportEvent>;

/// Receiver half of the shared driver event channel
pub type TransportEventReceiver = mpsc::Receiver<TransportEvent>;

/// Uniform contract implemented by every concrete transport
///
/// Drivers are constructed with the shared [`TransportEventSender`];
/// all callbacks flow through it. Send queues are bounded: on overflow
/// a driver drops its oldest frame and reports [`TransportError::QueueFull`]
/// so the selector can devalue the transport.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Which flavor this driver is
    fn kind(&self) -> TransportKind;

    /// Bring the driver up
    async fn start(&self) -> Result<(), TransportError>;

    /// Tear the driver down; idempotent
    async fn stop(&self);

    /// Best-effort fan-out to every currently reachable peer
    async fn broadcast(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Send to one peer
    async fn send(&self, peer: &NodeId, bytes: Bytes) -> Result<(), TransportError>;

    /// Peers with an active channel right now
    fn connected_peers(&self) -> Vec<NodeId>;

    /// Whether the driver currently reports itself usable
    fn is_available(&self) -> bool;
}
