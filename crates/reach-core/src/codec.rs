//! Packet wire codec and integrity digest
//!
//! Packets travel as compact UTF-8 JSON with fixed field names and a
//! maximum serialized size. The integrity digest is a 32-bit rolling
//! hash over the canonical string form (the serialized packet with the
//! `signature` field absent, fields in construction order). The hash
//! must be bit-exact across implementations or peers reject the packet.

use serde::Serialize;

use crate::error::PacketError;
use crate::identity::NodeId;
use crate::packet::{Packet, PacketType};

/// Default maximum serialized packet size, bytes
pub const MAX_PACKET_SIZE: usize = 512;

/// Shadow of [`Packet`] without the signature field
///
/// Serializing this yields the canonical digest input. Field order must
/// match [`Packet`] exactly.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalPacket<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    packet_type: PacketType,
    sender_id: &'a NodeId,
    original_sender_id: &'a NodeId,
    target_id: &'a NodeId,
    payload: &'a str,
    timestamp: i64,
    ttl: u8,
    hops: &'a [NodeId],
}

/// The canonical string form of a packet (signature absent)
pub fn canonical_form(packet: &Packet) -> String {
    let canonical = CanonicalPacket {
        id: &packet.id,
        packet_type: packet.packet_type,
        sender_id: &packet.sender_id,
        original_sender_id: &packet.original_sender_id,
        target_id: &packet.target_id,
        payload: &packet.payload,
        timestamp: packet.timestamp,
        ttl: packet.ttl,
        hops: &packet.hops,
    };
    // Serialization of a string-and-integer struct cannot fail
    serde_json::to_string(&canonical).unwrap_or_default()
}

/// 32-bit rolling hash over a string, rendered as 8-char lowercase hex
///
/// `h = ((h << 5) - h) + c` per code point, wrapping at 32 bits signed;
/// the tag is the absolute value.
pub fn rolling_hash(input: &str) -> String {
    let mut h: i32 = 0;
    for c in input.chars() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32);
    }
    hex::encode(h.unsigned_abs().to_be_bytes())
}

/// The integrity digest of a packet's current contents
pub fn digest_of(packet: &Packet) -> String {
    rolling_hash(&canonical_form(packet))
}

/// Recompute the digest and compare against the carried signature
pub fn verify(packet: &Packet) -> bool {
    digest_of(packet) == packet.signature
}

/// Serialize a packet for the wire
pub fn encode(packet: &Packet) -> Result<Vec<u8>, PacketError> {
    encode_with_limit(packet, MAX_PACKET_SIZE)
}

/// Serialize a packet, enforcing a size limit
pub fn encode_with_limit(packet: &Packet, limit: usize) -> Result<Vec<u8>, PacketError> {
    let bytes =
        serde_json::to_vec(packet).map_err(|e| PacketError::Malformed(e.to_string()))?;
    if bytes.len() > limit {
        return Err(PacketError::Oversize {
            limit,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Parse a packet from the wire
///
/// Structural errors and over-size frames are rejected here; digest
/// verification is the routing engine's first ingress step.
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
    decode_with_limit(bytes, MAX_PACKET_SIZE)
}

/// Parse a packet, enforcing a size limit
pub fn decode_with_limit(bytes: &[u8], limit: usize) -> Result<Packet, PacketError> {
    if bytes.len() > limit {
        return Err(PacketError::Oversize {
            limit,
            actual: bytes.len(),
        });
    }
    let packet: Packet =
        serde_json::from_slice(bytes).map_err(|e| PacketError::Malformed(e.to_string()))?;
    if packet.hops.is_empty() || !packet.hops_valid() {
        return Err(PacketError::BadHopList);
    }
    Ok(packet)
}
