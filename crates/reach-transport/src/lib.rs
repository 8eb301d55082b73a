//! # Reach Transport
//!
//! Concrete transports for the Reach mesh, the shared metrics table,
//! and the transport selector.
//!
//! - [`LocalTransport`] / [`LocalBus`]: same-host channel with explicit
//!   link control (also the topology harness for integration tests)
//! - [`InternetTransport`]: P2P-over-internet TCP sessions bootstrapped
//!   by [`SignalBlob`] exchange
//! - [`RendezvousTransport`] / [`RendezvousStore`]: network-backed
//!   relay for discovery, signaling, and store-and-forward
//! - [`MetricsTable`] / [`TransportSelector`]: per-transport health and
//!   the scored attempt order

pub mod internet;
pub mod local;
pub mod metrics;
pub mod rendezvous;
pub mod selector;

pub use internet::{InternetConfig, InternetTransport, SignalBlob};
pub use local::{LocalBus, LocalTransport};
pub use metrics::{MetricsTable, TransportMetrics};
pub use rendezvous::{
    MemoryRendezvous, RelayDeviceRecord, RelayMessageRecord, RelayPresenceRecord,
    RendezvousStore, RendezvousTransport,
};
pub use selector::TransportSelector;
