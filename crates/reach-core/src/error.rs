//! Error types for the Reach mesh core

use thiserror::Error;

/// Errors from the packet codec and integrity checks
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("packet exceeds {limit} bytes (got {actual})")]
    Oversize { limit: usize, actual: usize },

    #[error("integrity digest mismatch")]
    DigestMismatch,

    #[error("hop list does not start at the originator")]
    BadHopList,
}

/// Errors related to node identity
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid node id: {0}")]
    InvalidFormat(String),

    #[error("cannot produce a stable node id: {0}")]
    Unavailable(String),
}

/// Errors related to transport drivers
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("peer not reachable on this transport: {0}")]
    PeerNotReachable(String),

    #[error("no transport available for peer {0}")]
    NoTransport(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("send queue full, oldest frame dropped")]
    QueueFull,

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("bad signaling blob: {0}")]
    BadSignaling(String),

    #[error("transport closed")]
    Closed,
}
