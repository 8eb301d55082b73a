//! Configuration for the node coordinator

use std::time::Duration;

use reach_core::{DeviceType, MeshConfig};

/// Configuration for a [`MeshNode`](crate::MeshNode)
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Core mesh tunables (TTL, retry pacing, liveness windows)
    pub mesh: MeshConfig,
    /// What kind of device this node runs on
    pub device_type: DeviceType,
    /// Event broadcast channel capacity
    pub event_channel_capacity: usize,
    /// Ingress and outbound channel capacity
    pub channel_capacity: usize,
    /// How often the registry liveness sweep runs
    pub sweep_interval: Duration,
    /// How often the rendezvous sync task runs
    pub sync_interval: Duration,
    /// Device records unseen for this long are evicted from storage
    pub device_eviction_age: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            device_type: DeviceType::Unknown,
            event_channel_capacity: 256,
            channel_capacity: 256,
            sweep_interval: Duration::from_secs(5),
            sync_interval: Duration::from_secs(2),
            device_eviction_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl NodeConfig {
    /// Set the core mesh tunables
    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    /// Set the device category announced to peers
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Set the sweep cadence
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the rendezvous sync cadence
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}
