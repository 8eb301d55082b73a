//! Merged peer view across all transports
//!
//! Every transport reports peer observations here; the registry merges
//! them into one device record per node and tracks per-peer transport
//! availability and freshness. A periodic sweep flips connectivity
//! flags as peers go quiet; records are retained until an explicit
//! storage-level eviction pass.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use reach_core::{
    is_generic_name, DeviceRecord, DeviceType, MeshConfig, NodeId, PeerDescriptor, TransportKind,
};

/// What an observation or sweep did to the registry
#[derive(Debug, Clone)]
pub enum RegistryChange {
    /// First observation of this peer
    Discovered(DeviceRecord),
    /// Merged view changed
    Updated(DeviceRecord),
    /// Quiet past the hard timeout; record retained offline
    Lost(NodeId),
}

/// The merged view of every known remote device
pub struct PeerRegistry {
    local_id: NodeId,
    devices: DashMap<NodeId, DeviceRecord>,
    /// transport -> last observation unix millis, per peer
    transports: DashMap<NodeId, HashMap<TransportKind, i64>>,
    config: MeshConfig,
}

impl PeerRegistry {
    /// Create a registry for the given local node
    pub fn new(local_id: NodeId, config: MeshConfig) -> Self {
        Self {
            local_id,
            devices: DashMap::new(),
            transports: DashMap::new(),
            config,
        }
    }

    /// Merge an observation from a transport
    pub fn observe(&self, descriptor: PeerDescriptor, transport: TransportKind) -> RegistryChange {
        let now = Utc::now().timestamp_millis();
        self.transports
            .entry(descriptor.id.clone())
            .or_default()
            .insert(transport, now);

        match self.devices.get_mut(&descriptor.id) {
            Some(mut device) => {
                device.signal_strength = device.signal_strength.max(descriptor.signal_strength);
                device.is_connected = true;
                device.is_online = true;
                device.last_seen = now;
                device.connection_type = transport;
                // Placeholder names never clobber a concrete one
                if !is_generic_name(&descriptor.name) {
                    device.name = descriptor.name;
                }
                if descriptor.device_type != DeviceType::Unknown {
                    device.device_type = descriptor.device_type;
                }
                RegistryChange::Updated(device.clone())
            }
            None => {
                let mut device =
                    DeviceRecord::new(descriptor.id.clone(), descriptor.name, transport);
                device.signal_strength = descriptor.signal_strength;
                device.device_type = descriptor.device_type;
                debug!(peer = %device.id, %transport, "New peer observed");
                self.devices.insert(descriptor.id, device.clone());
                RegistryChange::Discovered(device)
            }
        }
    }

    /// Refresh a peer's liveness without changing the merged view
    ///
    /// PING ingress lands here.
    pub fn touch(&self, id: &NodeId) {
        if let Some(mut device) = self.devices.get_mut(id) {
            device.last_seen = Utc::now().timestamp_millis();
            device.is_online = true;
        }
    }

    /// Flip a peer's typing flag; returns the updated record on change
    pub fn set_typing(&self, id: &NodeId, typing: bool) -> Option<DeviceRecord> {
        let mut device = self.devices.get_mut(id)?;
        if device.is_typing == typing {
            return None;
        }
        device.is_typing = typing;
        Some(device.clone())
    }

    /// A transport's channel to this peer went away
    pub fn peer_lost_on(&self, id: &NodeId, transport: TransportKind) -> Option<DeviceRecord> {
        if let Some(mut map) = self.transports.get_mut(id) {
            map.remove(&transport);
        }
        let mut device = self.devices.get_mut(id)?;
        if device.connection_type == transport && device.is_connected {
            device.is_connected = false;
            return Some(device.clone());
        }
        None
    }

    /// Liveness sweep; call every few seconds with the current time
    ///
    /// Soft timeout marks a peer disconnected; three soft windows marks
    /// it lost. Lost records are retained offline and reported once.
    pub fn sweep(&self, now: i64) -> Vec<RegistryChange> {
        let mut changes = Vec::new();
        for mut device in self.devices.iter_mut() {
            if device.is_self {
                continue;
            }
            let soft = if device.connection_type.is_network() {
                self.config.remote_soft_peer_timeout.as_millis() as i64
            } else {
                self.config.soft_peer_timeout.as_millis() as i64
            };
            let quiet = now - device.last_seen;

            if quiet > soft * 3 {
                if device.is_online {
                    device.is_online = false;
                    device.is_connected = false;
                    debug!(peer = %device.id, "Peer lost");
                    changes.push(RegistryChange::Lost(device.id.clone()));
                }
            } else if quiet > soft && device.is_connected {
                device.is_connected = false;
                changes.push(RegistryChange::Updated(device.clone()));
            }
        }
        changes
    }

    /// One device record
    pub fn device(&self, id: &NodeId) -> Option<DeviceRecord> {
        self.devices.get(id).map(|d| d.clone())
    }

    /// All device records
    pub fn all_devices(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(|d| d.clone()).collect()
    }

    /// Peers currently marked connected
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.devices
            .iter()
            .filter(|d| d.is_connected)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Transports that have observed this peer
    pub fn supported_transports(&self, id: &NodeId) -> HashSet<TransportKind> {
        self.transports
            .get(id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Connected peer count per transport, for selector metrics
    pub fn count_for_transport(&self, kind: TransportKind) -> usize {
        self.devices
            .iter()
            .filter(|d| d.is_connected && d.connection_type == kind)
            .count()
    }

    /// Whether this peer is known at all
    pub fn knows(&self, id: &NodeId) -> bool {
        self.devices.contains_key(id)
    }

    /// The local node id the registry filters out of sweeps
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }
}
