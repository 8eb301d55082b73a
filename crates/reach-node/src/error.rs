//! Node error types

use thiserror::Error;

use reach_core::{IdentityError, PacketError, TransportError};
use reach_storage::StorageError;

/// Top-level error for node operations
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("node already started")]
    AlreadyStarted,

    #[error("node not started")]
    NotStarted,
}

/// Result alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;
