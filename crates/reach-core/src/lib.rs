//! # Reach Core
//!
//! Core types and contracts for the Reach mesh messaging substrate.
//!
//! This crate provides the foundations shared by every layer of the stack:
//!
//! - [`NodeId`] / [`NodeIdentity`]: the 8-character node identifier and
//!   display name
//! - [`Packet`] and the wire codec: framed JSON packets with a 32-bit
//!   integrity digest
//! - [`SeenSet`]: bounded duplicate suppression over packet ids
//! - [`DeviceRecord`] / [`Message`] / [`PendingMessage`]: the records the
//!   registry and storage layers operate on
//! - [`TransportDriver`]: the uniform contract every concrete transport
//!   implements
//! - [`MeshEvent`]: events the core raises toward the application

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod identity;
pub mod message;
pub mod packet;
pub mod seen;
pub mod transport;

// Re-export main types
pub use codec::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use message::*;
pub use packet::*;
pub use seen::*;
pub use transport::*;
