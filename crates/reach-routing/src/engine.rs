//! Packet ingress and relay decisions
//!
//! Every frame from every transport lands in [`RoutingEngine::receive`]:
//! integrity check, duplicate suppression, local delivery or registry
//! update, ACK correlation, then the relay decision. The engine never
//! touches drivers; outbound copies go onto a channel the node's
//! fan-out task drains.
//!
//! The seen-set test and insert happen under one lock, so concurrent
//! receipts of the same packet on different transports produce exactly
//! one delivery and at most one relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, trace, warn};

use reach_core::{
    codec, Announcement, DeviceType, MeshConfig, MeshEvent, Message, MessageStatus, NodeId,
    NodeIdentity, Packet, PacketError, PacketType, SeenSet, TransportKind,
};
use reach_storage::DurableStore;

use crate::pending::PendingTable;
use crate::registry::{PeerRegistry, RegistryChange};

/// How an outbound packet should be emitted
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Every available transport, every connected peer, minus the
    /// transport-peer pair the packet arrived on
    Flood {
        exclude: Option<(TransportKind, NodeId)>,
    },
    /// Selector-ordered attempts toward one peer
    Direct { peer: NodeId },
}

/// A packet queued for emission
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub packet: Packet,
    pub dispatch: Dispatch,
}

/// Typing indicator carried in a PING payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    /// Composing or stopped
    pub typing: bool,
    /// Who the indicator is for
    pub to: NodeId,
}

impl TypingSignal {
    /// Serialize for a packet payload
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse from a packet payload
    pub fn from_payload(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

/// Ingress drop and delivery counters
#[derive(Debug, Default)]
pub struct RoutingStats {
    malformed: AtomicU64,
    oversize: AtomicU64,
    bad_digest: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    relayed: AtomicU64,
    acks_correlated: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingStatsSnapshot {
    pub malformed: u64,
    pub oversize: u64,
    pub bad_digest: u64,
    pub duplicates: u64,
    pub delivered: u64,
    pub relayed: u64,
    pub acks_correlated: u64,
}

impl RoutingStats {
    fn snapshot(&self) -> RoutingStatsSnapshot {
        RoutingStatsSnapshot {
            malformed: self.malformed.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            bad_digest: self.bad_digest.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            acks_correlated: self.acks_correlated.load(Ordering::Relaxed),
        }
    }
}

/// The per-node routing and relay state machine
pub struct RoutingEngine {
    identity: Arc<RwLock<NodeIdentity>>,
    device_type: DeviceType,
    config: MeshConfig,
    seen: Mutex<SeenSet>,
    registry: Arc<PeerRegistry>,
    store: Arc<dyn DurableStore>,
    pending: Arc<PendingTable>,
    events: broadcast::Sender<MeshEvent>,
    outbound: mpsc::Sender<OutboundFrame>,
    stats: RoutingStats,
}

impl RoutingEngine {
    /// Wire up an engine
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<RwLock<NodeIdentity>>,
        device_type: DeviceType,
        config: MeshConfig,
        registry: Arc<PeerRegistry>,
        store: Arc<dyn DurableStore>,
        pending: Arc<PendingTable>,
        events: broadcast::Sender<MeshEvent>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        let seen = Mutex::new(SeenSet::new(config.seen_set_high, config.seen_set_low));
        Self {
            identity,
            device_type,
            config,
            seen,
            registry,
            store,
            pending,
            events,
            outbound,
            stats: RoutingStats::default(),
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> RoutingStatsSnapshot {
        self.stats.snapshot()
    }

    /// Raw frame ingress from a transport
    pub async fn receive(&self, bytes: &[u8], from_transport: TransportKind, from_peer: NodeId) {
        let packet = match codec::decode_with_limit(bytes, self.config.max_packet_size) {
            Ok(packet) => packet,
            Err(PacketError::Oversize { .. }) => {
                self.stats.oversize.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(_) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.ingest(packet, from_transport, from_peer).await;
    }

    /// Decoded packet ingress
    ///
    /// Also the admission path for store-and-forward records the sync
    /// task replays as if they had arrived over a transport.
    pub async fn ingest(&self, packet: Packet, from_transport: TransportKind, from_peer: NodeId) {
        if !codec::verify(&packet) {
            self.stats.bad_digest.fetch_add(1, Ordering::Relaxed);
            trace!(id = %packet.id, "Dropping packet with bad digest");
            return;
        }

        // Duplicate test and insert are one critical section: the first
        // arrival wins, every concurrent copy drops here.
        {
            let mut seen = self.seen.lock().await;
            if seen.contains(&packet.id) {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return;
            }
            seen.insert(packet.id.clone());
        }

        let local_id = self.local_id().await;

        // Our own packets echo back through relays; nothing to do
        if packet.original_sender_id == local_id {
            return;
        }

        match packet.packet_type {
            PacketType::Message | PacketType::Relay => {
                self.handle_message(&packet, &local_id).await;
            }
            PacketType::Ack => {
                self.handle_ack(&packet, &local_id).await;
            }
            PacketType::Discover | PacketType::Announce => {
                self.handle_presence(&packet, from_transport).await;
            }
            PacketType::Ping => {
                self.handle_ping(&packet, &local_id).await;
            }
        }

        if packet.should_relay(&local_id) {
            let relay = packet.relay_copy(&local_id);
            debug!(id = %relay.id, ttl = relay.ttl, "Relaying packet");
            self.stats.relayed.fetch_add(1, Ordering::Relaxed);
            self.emit(OutboundFrame {
                packet: relay,
                dispatch: Dispatch::Flood {
                    exclude: Some((from_transport, from_peer)),
                },
            })
            .await;
        }
    }

    async fn handle_message(&self, packet: &Packet, local_id: &NodeId) {
        if !packet.is_for(local_id) {
            return;
        }

        let already_stored = self
            .store
            .message_exists(&packet.id)
            .await
            .unwrap_or(false);

        if !already_stored {
            let message = Message {
                id: packet.id.clone(),
                content: packet.payload.clone(),
                sender_id: packet.original_sender_id.clone(),
                receiver_id: local_id.clone(),
                timestamp: packet.timestamp,
                hops: packet.hops.clone(),
                status: MessageStatus::Delivered,
                retry_count: 0,
                synced: true,
            };
            self.persist_message(&message).await;
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(id = %message.id, from = %message.sender_id, "Message delivered");
            let _ = self.events.send(MeshEvent::MessageReceived { message });
        }

        // ACK either way: the sender may have missed the first one
        let ack = Packet::new(
            PacketType::Ack,
            local_id.clone(),
            packet.original_sender_id.clone(),
            packet.id.clone(),
            self.config.initial_ttl(),
        );
        self.emit(OutboundFrame {
            packet: ack,
            dispatch: Dispatch::Flood { exclude: None },
        })
        .await;
    }

    async fn handle_ack(&self, packet: &Packet, local_id: &NodeId) {
        if !packet.is_for(local_id) {
            return;
        }

        let acked_id = packet.payload.as_str();
        let Some(_entry) = self.pending.take(acked_id) else {
            // Late or repeated ACK; the entry is already settled
            return;
        };

        self.stats.acks_correlated.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.store.remove_pending(acked_id).await {
            warn!(id = acked_id, error = %e, "Failed to clear durable pending entry");
        }
        match self
            .store
            .update_message_status(acked_id, MessageStatus::Delivered)
            .await
        {
            Ok(_) => {}
            Err(e) => warn!(id = acked_id, error = %e, "Failed to persist delivered status"),
        }
        debug!(id = acked_id, "ACK correlated, message delivered");
        let _ = self.events.send(MeshEvent::MessageStatusChanged {
            message_id: acked_id.to_string(),
            status: MessageStatus::Delivered,
        });
    }

    async fn handle_presence(&self, packet: &Packet, from_transport: TransportKind) {
        let Some(announcement) = Announcement::from_payload(&packet.payload) else {
            trace!(id = %packet.id, "Presence packet with unreadable payload");
            return;
        };

        let descriptor = announcement.descriptor(packet.original_sender_id.clone());
        let change = self.registry.observe(descriptor, from_transport);
        let newly_discovered = matches!(change, RegistryChange::Discovered(_));
        self.publish_registry_change(change).await;

        // Answer probes, and introduce ourselves to peers that just
        // appeared (one-shot; they already know us after this)
        if packet.packet_type == PacketType::Discover || newly_discovered {
            let announce = self.self_announce_packet().await;
            self.emit(OutboundFrame {
                packet: announce,
                dispatch: Dispatch::Flood { exclude: None },
            })
            .await;
        }
    }

    async fn handle_ping(&self, packet: &Packet, local_id: &NodeId) {
        self.registry.touch(&packet.sender_id);

        if let Some(signal) = TypingSignal::from_payload(&packet.payload) {
            if signal.to == *local_id {
                if let Some(device) = self
                    .registry
                    .set_typing(&packet.original_sender_id, signal.typing)
                {
                    let _ = self.events.send(MeshEvent::DeviceUpdated { device });
                }
            }
        }
    }

    /// Build a signed wildcard ANNOUNCE describing this node
    pub async fn self_announce_packet(&self) -> Packet {
        let identity = self.identity.read().await;
        let announcement = Announcement {
            name: identity.name.clone(),
            device_type: self.device_type,
            brand_hint: None,
            os_hint: Some(std::env::consts::OS.to_string()),
        };
        Packet::new(
            PacketType::Announce,
            identity.id.clone(),
            NodeId::wildcard(),
            announcement.to_payload(),
            self.config.initial_ttl(),
        )
    }

    /// Forward a registry change as the matching application event
    pub async fn publish_registry_change(&self, change: RegistryChange) {
        match change {
            RegistryChange::Discovered(device) => {
                self.persist_device(&device).await;
                let _ = self.events.send(MeshEvent::DeviceDiscovered { device });
            }
            RegistryChange::Updated(device) => {
                let _ = self.events.send(MeshEvent::DeviceUpdated { device });
            }
            RegistryChange::Lost(device_id) => {
                if let Ok(Some(mut device)) = self.store.device(&device_id).await {
                    device.is_online = false;
                    device.is_connected = false;
                    self.persist_device(&device).await;
                }
                let _ = self.events.send(MeshEvent::DeviceLost { device_id });
            }
        }
    }

    async fn emit(&self, frame: OutboundFrame) {
        if self.outbound.send(frame).await.is_err() {
            warn!("Outbound channel closed, dropping frame");
        }
    }

    async fn persist_message(&self, message: &Message) {
        // Three attempts, then deliver anyway; losing the record only
        // risks a re-delivery after restart
        for attempt in 0..3 {
            match self.store.put_message(message).await {
                Ok(()) => return,
                Err(e) if attempt == 2 => {
                    warn!(id = %message.id, error = %e, "Giving up persisting message");
                }
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    async fn persist_device(&self, device: &reach_core::DeviceRecord) {
        if let Err(e) = self.store.upsert_device(device).await {
            warn!(id = %device.id, error = %e, "Failed to persist device record");
        }
    }

    async fn local_id(&self) -> NodeId {
        self.identity.read().await.id.clone()
    }
}
