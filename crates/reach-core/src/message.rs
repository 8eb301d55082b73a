//! User-level messages and the pending-retry record
//!
//! A message is what the application sees; packets are how it travels.
//! The message id equals the originating packet's id, which is how ACKs
//! correlate back to delivery state.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::packet::Packet;

/// User-visible message delivery states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Submitted, no transport attempt resolved yet
    Sending,
    /// Emitted on at least one transport
    Sent,
    /// ACK received from the destination
    Delivered,
    /// Receiver-side application signaling; the core never produces it
    Read,
    /// Retry budget exhausted
    Failed,
    /// All transports unavailable, parked in the pending queue
    Queued,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sending => write!(f, "sending"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read => write!(f, "read"),
            Self::Failed => write!(f, "failed"),
            Self::Queued => write!(f, "queued"),
        }
    }
}

impl MessageStatus {
    /// Terminal states never transition further
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Read | Self::Failed)
    }
}

/// A user-level message record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Equals the originating packet's id
    pub id: String,
    /// Message body
    pub content: String,
    /// Originating node
    pub sender_id: NodeId,
    /// Destination node
    pub receiver_id: NodeId,
    /// Origin wall time, unix millis
    pub timestamp: i64,
    /// Route the delivered packet followed, origin first
    pub hops: Vec<NodeId>,
    /// Delivery state
    pub status: MessageStatus,
    /// Transport attempts consumed so far
    pub retry_count: u32,
    /// Uploaded to the rendezvous store
    pub synced: bool,
}

impl Message {
    /// The canonical conversation key for this message's participants
    pub fn conversation_key(&self) -> String {
        conversation_key(&self.sender_id, &self.receiver_id)
    }
}

/// Canonical conversation key: the two ids sorted and joined with `:`
pub fn conversation_key(a: &NodeId, b: &NodeId) -> String {
    if a.as_str() <= b.as_str() {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// An entry in the pending-retry queue
///
/// Created when a MESSAGE packet is emitted and no ACK has correlated
/// yet, or when no transport was available at send time. Removed on ACK
/// or terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Equals the message (and packet) id
    pub id: String,
    /// The message being retried
    pub message: Message,
    /// The original signed packet, re-emitted verbatim
    pub packet: Packet,
    /// Retry attempts so far
    pub retries: u32,
    /// Last emission attempt, unix millis
    pub last_attempt: i64,
}

impl PendingMessage {
    /// Create a fresh pending entry for a just-emitted packet
    pub fn new(message: Message, packet: Packet) -> Self {
        Self {
            id: message.id.clone(),
            message,
            packet,
            retries: 0,
            last_attempt: chrono::Utc::now().timestamp_millis(),
        }
    }
}
