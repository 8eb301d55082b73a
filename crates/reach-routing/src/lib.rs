//! # Reach Routing
//!
//! The per-node routing and relay state machine.
//!
//! - [`PeerRegistry`]: merged device view across all transports, with
//!   liveness sweeps
//! - [`PendingTable`]: in-memory pending-retry entries and their timers
//! - [`RoutingEngine`]: packet ingress - integrity check, duplicate
//!   suppression, local delivery, ACK correlation, relay decision
//!
//! The engine never talks to drivers directly; relay copies and ACKs
//! are pushed onto an outbound channel the node's fan-out task drains.

pub mod engine;
pub mod pending;
pub mod registry;

pub use engine::{
    Dispatch, OutboundFrame, RoutingEngine, RoutingStats, RoutingStatsSnapshot, TypingSignal,
};
pub use pending::PendingTable;
pub use registry::{PeerRegistry, RegistryChange};
