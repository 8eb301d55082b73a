//! Rendezvous relay: record store contract and relay driver
//!
//! The rendezvous service is an external record store reachable over
//! the network. It plays three roles: fallback discovery (device and
//! presence records), signal exchange for P2P bootstrap, and
//! store-and-forward for peers currently offline (message records and
//! a per-peer packet mailbox). All writes are idempotent upserts.
//!
//! [`MemoryRendezvous`] is the in-process backend used by tests and
//! single-host deployments; a networked backend implements the same
//! trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use reach_core::{
    DeviceType, MessageStatus, NodeId, PeerDescriptor, TransportDriver, TransportError,
    TransportEvent, TransportEventSender, TransportKind,
};

/// Device record in the relay store, keyed by `device_id`
#[derive(Debug, Clone, PartialEq)]
pub struct RelayDeviceRecord {
    pub device_id: NodeId,
    pub device_name: String,
    pub device_type: DeviceType,
    pub is_online: bool,
    pub last_seen: i64,
}

/// Message record in the relay store, keyed by `message_id`
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessageRecord {
    pub message_id: String,
    pub sender_id: NodeId,
    pub receiver_id: NodeId,
    pub content: String,
    pub status: MessageStatus,
    pub hops: Vec<NodeId>,
    pub created_at: i64,
}

/// Presence record in the relay store, keyed by `device_id`
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPresenceRecord {
    pub device_id: NodeId,
    pub is_online: bool,
    pub is_typing: bool,
    pub typing_to: Option<NodeId>,
    pub last_heartbeat: i64,
}

/// The rendezvous record store contract
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Upsert a device record
    async fn upsert_device(&self, record: RelayDeviceRecord) -> Result<(), TransportError>;

    /// Devices currently flagged online
    async fn online_devices(&self) -> Result<Vec<RelayDeviceRecord>, TransportError>;

    /// Upsert a message record
    async fn upsert_message(&self, record: RelayMessageRecord) -> Result<(), TransportError>;

    /// One message record
    async fn message(&self, message_id: &str)
        -> Result<Option<RelayMessageRecord>, TransportError>;

    /// All message records addressed to a receiver
    async fn messages_for(
        &self,
        receiver: &NodeId,
    ) -> Result<Vec<RelayMessageRecord>, TransportError>;

    /// Update a message record's status
    async fn set_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), TransportError>;

    /// Upsert a presence record
    async fn upsert_presence(&self, record: RelayPresenceRecord) -> Result<(), TransportError>;

    /// One presence record
    async fn presence(&self, device_id: &NodeId)
        -> Result<Option<RelayPresenceRecord>, TransportError>;

    /// Publish a signaling blob for P2P bootstrap
    async fn publish_signal(&self, device_id: &NodeId, blob: String)
        -> Result<(), TransportError>;

    /// Fetch a peer's signaling blob
    async fn fetch_signal(&self, device_id: &NodeId) -> Result<Option<String>, TransportError>;

    /// Append an opaque frame to a peer's mailbox
    async fn push_packet(
        &self,
        to: &NodeId,
        from: &NodeId,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Take everything from a peer's mailbox
    async fn drain_packets(&self, to: &NodeId)
        -> Result<Vec<(NodeId, Vec<u8>)>, TransportError>;
}

/// In-process rendezvous backend
#[derive(Default)]
pub struct MemoryRendezvous {
    devices: DashMap<NodeId, RelayDeviceRecord>,
    messages: DashMap<String, RelayMessageRecord>,
    presence: DashMap<NodeId, RelayPresenceRecord>,
    signals: DashMap<NodeId, String>,
    mailboxes: DashMap<NodeId, Vec<(NodeId, Vec<u8>)>>,
    unreachable: AtomicBool,
}

impl MemoryRendezvous {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate an outage: every call fails until restored
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RendezvousStore for MemoryRendezvous {
    async fn upsert_device(&self, record: RelayDeviceRecord) -> Result<(), TransportError> {
        self.check()?;
        self.devices.insert(record.device_id.clone(), record);
        Ok(())
    }

    async fn online_devices(&self) -> Result<Vec<RelayDeviceRecord>, TransportError> {
        self.check()?;
        Ok(self
            .devices
            .iter()
            .filter(|d| d.is_online)
            .map(|d| d.clone())
            .collect())
    }

    async fn upsert_message(&self, record: RelayMessageRecord) -> Result<(), TransportError> {
        self.check()?;
        self.messages.insert(record.message_id.clone(), record);
        Ok(())
    }

    async fn message(
        &self,
        message_id: &str,
    ) -> Result<Option<RelayMessageRecord>, TransportError> {
        self.check()?;
        Ok(self.messages.get(message_id).map(|m| m.clone()))
    }

    async fn messages_for(
        &self,
        receiver: &NodeId,
    ) -> Result<Vec<RelayMessageRecord>, TransportError> {
        self.check()?;
        Ok(self
            .messages
            .iter()
            .filter(|m| m.receiver_id == *receiver)
            .map(|m| m.clone())
            .collect())
    }

    async fn set_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), TransportError> {
        self.check()?;
        if let Some(mut record) = self.messages.get_mut(message_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn upsert_presence(&self, record: RelayPresenceRecord) -> Result<(), TransportError> {
        self.check()?;
        self.presence.insert(record.device_id.clone(), record);
        Ok(())
    }

    async fn presence(
        &self,
        device_id: &NodeId,
    ) -> Result<Option<RelayPresenceRecord>, TransportError> {
        self.check()?;
        Ok(self.presence.get(device_id).map(|p| p.clone()))
    }

    async fn publish_signal(
        &self,
        device_id: &NodeId,
        blob: String,
    ) -> Result<(), TransportError> {
        self.check()?;
        self.signals.insert(device_id.clone(), blob);
        Ok(())
    }

    async fn fetch_signal(&self, device_id: &NodeId) -> Result<Option<String>, TransportError> {
        self.check()?;
        Ok(self.signals.get(device_id).map(|s| s.clone()))
    }

    async fn push_packet(
        &self,
        to: &NodeId,
        from: &NodeId,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.check()?;
        self.mailboxes
            .entry(to.clone())
            .or_default()
            .push((from.clone(), bytes));
        Ok(())
    }

    async fn drain_packets(
        &self,
        to: &NodeId,
    ) -> Result<Vec<(NodeId, Vec<u8>)>, TransportError> {
        self.check()?;
        Ok(self
            .mailboxes
            .remove(to)
            .map(|(_, frames)| frames)
            .unwrap_or_default())
    }
}

/// Relay-backed transport driver
///
/// Polls the store for mailbox frames and online devices; sending a
/// frame is an upsert into the receiver's mailbox, so delivery works
/// even when the two ends are never online together.
pub struct RendezvousTransport {
    descriptor: PeerDescriptor,
    store: Arc<dyn RendezvousStore>,
    events: TransportEventSender,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    known_online: Arc<DashSet<NodeId>>,
}

impl RendezvousTransport {
    /// Create a driver polling every `poll_interval`
    pub fn new(
        descriptor: PeerDescriptor,
        store: Arc<dyn RendezvousStore>,
        events: TransportEventSender,
        poll_interval: Duration,
    ) -> Self {
        Self {
            descriptor,
            store,
            events,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            poll_task: Mutex::new(None),
            known_online: Arc::new(DashSet::new()),
        }
    }

    /// The backing store, for the sync task and signal exchange
    pub fn store(&self) -> &Arc<dyn RendezvousStore> {
        &self.store
    }

    async fn announce_self(&self, online: bool) {
        let now = Utc::now().timestamp_millis();
        let device = RelayDeviceRecord {
            device_id: self.descriptor.id.clone(),
            device_name: self.descriptor.name.clone(),
            device_type: self.descriptor.device_type,
            is_online: online,
            last_seen: now,
        };
        if let Err(e) = self.store.upsert_device(device).await {
            warn!(error = %e, "Relay device upsert failed");
        }
        let presence = RelayPresenceRecord {
            device_id: self.descriptor.id.clone(),
            is_online: online,
            is_typing: false,
            typing_to: None,
            last_heartbeat: now,
        };
        if let Err(e) = self.store.upsert_presence(presence).await {
            warn!(error = %e, "Relay presence upsert failed");
        }
    }
}

#[async_trait]
impl TransportDriver for RendezvousTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rendezvous
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.announce_self(true).await;

        let store = self.store.clone();
        let events = self.events.clone();
        let local_id = self.descriptor.id.clone();
        let descriptor = self.descriptor.clone();
        let interval = self.poll_interval;
        let running = self.running.clone();
        let known_online = self.known_online.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                // Heartbeat keeps our presence fresh
                let now = Utc::now().timestamp_millis();
                let _ = store
                    .upsert_presence(RelayPresenceRecord {
                        device_id: local_id.clone(),
                        is_online: true,
                        is_typing: false,
                        typing_to: None,
                        last_heartbeat: now,
                    })
                    .await;
                let _ = store
                    .upsert_device(RelayDeviceRecord {
                        device_id: local_id.clone(),
                        device_name: descriptor.name.clone(),
                        device_type: descriptor.device_type,
                        is_online: true,
                        last_seen: now,
                    })
                    .await;

                // Inbound frames from our mailbox
                match store.drain_packets(&local_id).await {
                    Ok(frames) => {
                        for (from, bytes) in frames {
                            trace!(from = %from, "Relay frame drained");
                            let _ = events
                                .send(TransportEvent::Bytes {
                                    kind: TransportKind::Rendezvous,
                                    from,
                                    bytes: Bytes::from(bytes),
                                })
                                .await;
                        }
                    }
                    Err(e) => {
                        trace!(error = %e, "Relay mailbox unreachable");
                        continue;
                    }
                }

                // Discovery through the relay's device table
                let Ok(devices) = store.online_devices().await else {
                    continue;
                };
                let mut current = std::collections::HashSet::new();
                for device in devices {
                    if device.device_id == local_id {
                        continue;
                    }
                    current.insert(device.device_id.clone());
                    if known_online.insert(device.device_id.clone()) {
                        let _ = events
                            .send(TransportEvent::PeerObserved {
                                kind: TransportKind::Rendezvous,
                                peer: PeerDescriptor {
                                    id: device.device_id.clone(),
                                    name: device.device_name.clone(),
                                    device_type: device.device_type,
                                    signal_strength: 40,
                                },
                            })
                            .await;
                    }
                }
                let gone: Vec<NodeId> = known_online
                    .iter()
                    .filter(|id| !current.contains(id.key()))
                    .map(|id| id.key().clone())
                    .collect();
                for id in gone {
                    known_online.remove(&id);
                    let _ = events
                        .send(TransportEvent::PeerLost {
                            kind: TransportKind::Rendezvous,
                            peer_id: id,
                        })
                        .await;
                }
            }
        });
        *self.poll_task.lock().await = Some(task);

        debug!(id = %self.descriptor.id, "Rendezvous transport up");
        let _ = self
            .events
            .send(TransportEvent::AvailabilityChanged {
                kind: TransportKind::Rendezvous,
                available: true,
            })
            .await;
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        // Best-effort offline flush
        self.announce_self(false).await;
        self.known_online.clear();
        let _ = self
            .events
            .send(TransportEvent::AvailabilityChanged {
                kind: TransportKind::Rendezvous,
                available: false,
            })
            .await;
    }

    async fn broadcast(&self, bytes: Bytes) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        for peer in self.connected_peers() {
            let _ = self
                .store
                .push_packet(&peer, &self.descriptor.id, bytes.to_vec())
                .await;
        }
        Ok(())
    }

    async fn send(&self, peer: &NodeId, bytes: Bytes) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.store
            .push_packet(peer, &self.descriptor.id, bytes.to_vec())
            .await
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.known_online.iter().map(|id| id.key().clone()).collect()
    }

    fn is_available(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
