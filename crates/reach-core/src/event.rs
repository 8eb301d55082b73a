//! Events the core raises toward the application

use crate::device::DeviceRecord;
use crate::identity::NodeId;
use crate::message::{Message, MessageStatus};
use crate::transport::TransportKind;

/// Application-facing events
///
/// Delivered over a broadcast channel; slow subscribers lose the oldest
/// events rather than blocking the core.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A device was observed for the first time
    DeviceDiscovered { device: DeviceRecord },

    /// A known device's merged view changed
    DeviceUpdated { device: DeviceRecord },

    /// A device went quiet past the hard timeout
    DeviceLost { device_id: NodeId },

    /// A message addressed to this node arrived
    MessageReceived { message: Message },

    /// A message's delivery state changed
    MessageStatusChanged {
        message_id: String,
        status: MessageStatus,
    },

    /// Scanning started or stopped
    ScanStateChanged { scanning: bool },

    /// Overall connectivity changed
    ConnectionStatusChanged {
        online: bool,
        transports: Vec<TransportKind>,
    },
}
