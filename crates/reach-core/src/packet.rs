//! Packet types for mesh relay delivery
//!
//! A packet is a value: relaying produces a fresh copy with the sender
//! rewritten, the TTL decremented, the local node appended to the hop
//! list, and the integrity digest recomputed. The hop list records the
//! route the packet actually followed, originator first; it is never
//! reused for reply routing.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::identity::NodeId;

/// Default hop budget for new packets
pub const DEFAULT_TTL: u8 = 10;

/// Alphabet for the random id suffix
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of the random id suffix
const SUFFIX_LEN: usize = 7;

/// Wire-level packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PacketType {
    /// Active probe for nearby peers
    Discover,
    /// Periodic self-description broadcast
    Announce,
    /// User message toward a destination
    Message,
    /// Acknowledgement; payload carries the acknowledged packet id
    Ack,
    /// Forwarded copy marker (accepted on ingress, never originated)
    Relay,
    /// Liveness keepalive
    Ping,
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Announce => write!(f, "ANNOUNCE"),
            Self::Message => write!(f, "MESSAGE"),
            Self::Ack => write!(f, "ACK"),
            Self::Relay => write!(f, "RELAY"),
            Self::Ping => write!(f, "PING"),
        }
    }
}

/// A framed mesh packet
///
/// Field order is the canonical insertion order: the integrity digest is
/// computed over the JSON serialization of all fields except `signature`,
/// in exactly this order. Reordering fields breaks cross-implementation
/// digest compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Unique packet id: origin wall time plus a random suffix
    pub id: String,
    /// Packet kind
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    /// Most recent hop
    pub sender_id: NodeId,
    /// Originating node
    pub original_sender_id: NodeId,
    /// Destination node id, or `*` for every node
    pub target_id: NodeId,
    /// UTF-8 payload; semantics depend on the packet kind
    pub payload: String,
    /// Origin wall time, unix millis
    pub timestamp: i64,
    /// Hops remaining
    pub ttl: u8,
    /// Nodes this packet has traversed, originator first
    pub hops: Vec<NodeId>,
    /// 32-bit integrity digest, 8-char lowercase hex
    pub signature: String,
}

impl Packet {
    /// Build and sign a new packet originating at `sender`
    pub fn new(
        packet_type: PacketType,
        sender: NodeId,
        target: NodeId,
        payload: impl Into<String>,
        ttl: u8,
    ) -> Self {
        let mut packet = Self {
            id: Self::generate_id(),
            packet_type,
            sender_id: sender.clone(),
            original_sender_id: sender.clone(),
            target_id: target,
            payload: payload.into(),
            timestamp: Utc::now().timestamp_millis(),
            ttl,
            hops: vec![sender],
            signature: String::new(),
        };
        packet.signature = codec::digest_of(&packet);
        packet
    }

    /// Generate a unique packet id: unix millis plus a random suffix
    pub fn generate_id() -> String {
        let mut rng = rand::rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();
        format!("{}-{}", Utc::now().timestamp_millis(), suffix)
    }

    /// Whether this packet is addressed to `local` (directly or wildcard)
    pub fn is_for(&self, local: &NodeId) -> bool {
        self.target_id == *local || self.target_id.is_wildcard()
    }

    /// Whether `node` already appears in the hop list
    pub fn has_hop(&self, node: &NodeId) -> bool {
        self.hops.contains(node)
    }

    /// Structural invariants beyond what the codec checks
    ///
    /// The hop list must be non-empty and start at the originator.
    pub fn hops_valid(&self) -> bool {
        self.hops.first() == Some(&self.original_sender_id)
    }

    /// Whether a node should forward this packet
    ///
    /// True iff there is hop budget left, the packet did not originate
    /// here, this node has not already carried it, and it is not
    /// addressed here.
    pub fn should_relay(&self, local: &NodeId) -> bool {
        self.ttl > 0
            && self.original_sender_id != *local
            && !self.has_hop(local)
            && self.target_id != *local
    }

    /// Build the relay copy this node would forward
    ///
    /// Rewrites the sender, burns one TTL, appends the local node to the
    /// hop list, and re-signs. Call only after [`should_relay`] holds.
    ///
    /// [`should_relay`]: Self::should_relay
    pub fn relay_copy(&self, local: &NodeId) -> Self {
        let mut copy = self.clone();
        copy.sender_id = local.clone();
        copy.ttl = self.ttl.saturating_sub(1);
        copy.hops.push(local.clone());
        copy.signature = codec::digest_of(&copy);
        copy
    }
}
