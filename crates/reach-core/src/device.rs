//! Device records and self-description documents
//!
//! A device record is the merged view of one remote peer across every
//! transport that has observed it. Merging rules live in the peer
//! registry; this module only defines the data.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::transport::TransportKind;

/// Rough device categories, for display only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    Laptop,
    Desktop,
    #[default]
    Unknown,
}

/// The merged view of a remote device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Node identifier
    pub id: NodeId,
    /// Display name
    pub name: String,
    /// Best observed signal strength, 0-100
    pub signal_strength: u8,
    /// Heuristic distance in metres
    pub distance: f64,
    /// Bearing 0-360, visualization only
    pub angle: f64,
    /// A transport currently reports an active channel
    pub is_connected: bool,
    /// Seen within the liveness window
    pub is_online: bool,
    /// Last observation, unix millis
    pub last_seen: i64,
    /// Device category
    pub device_type: DeviceType,
    /// Transport that reported this device most recently
    pub connection_type: TransportKind,
    /// Whether this record describes the local node
    pub is_self: bool,
    /// Peer is currently composing a message to us
    pub is_typing: bool,
}

impl DeviceRecord {
    /// Create a record for a first observation
    pub fn new(id: NodeId, name: impl Into<String>, connection_type: TransportKind) -> Self {
        Self {
            id,
            name: name.into(),
            signal_strength: 0,
            distance: 0.0,
            angle: 0.0,
            is_connected: true,
            is_online: true,
            last_seen: chrono::Utc::now().timestamp_millis(),
            device_type: DeviceType::Unknown,
            connection_type,
            is_self: false,
            is_typing: false,
        }
    }
}

/// What a driver reports when it observes a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Node identifier
    pub id: NodeId,
    /// Display name, possibly a generated placeholder
    pub name: String,
    /// Device category if the transport knows it
    #[serde(default)]
    pub device_type: DeviceType,
    /// Driver-estimated signal strength, 0-100
    #[serde(default)]
    pub signal_strength: u8,
}

impl PeerDescriptor {
    /// Minimal descriptor when only the id is known
    pub fn bare(id: NodeId) -> Self {
        let name = format!("Device-{}", id.short_id());
        Self {
            id,
            name,
            device_type: DeviceType::Unknown,
            signal_strength: 0,
        }
    }
}

/// Self-description carried in DISCOVER and ANNOUNCE payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    /// Display name
    pub name: String,
    /// Device category
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Hardware brand, best effort
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_hint: Option<String>,
    /// Operating system, best effort
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_hint: Option<String>,
}

impl Announcement {
    /// Serialize for a packet payload
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse from a packet payload
    pub fn from_payload(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }

    /// The descriptor a registry observation is built from
    pub fn descriptor(&self, id: NodeId) -> PeerDescriptor {
        PeerDescriptor {
            id,
            name: self.name.clone(),
            device_type: self.device_type,
            signal_strength: 0,
        }
    }
}
