//! Delivery pipeline
//!
//! The user-level send path and its at-least-once machinery: status
//! lifecycle, the retry scheduler with exponential backoff, the
//! queued-on-no-transport path, and the reconnect drain. ACK
//! correlation lives in the routing engine; the pipeline and the
//! engine meet at the shared pending table.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use reach_core::{
    codec, MeshConfig, MeshEvent, Message, MessageStatus, NodeId, NodeIdentity, Packet,
    PacketType, PendingMessage,
};
use reach_routing::PendingTable;
use reach_storage::DurableStore;
use reach_transport::{RelayMessageRecord, RendezvousStore};

use crate::emitter::Emitter;
use crate::error::{NodeError, NodeResult};

/// User-level send/retry pipeline
pub struct DeliveryPipeline {
    config: MeshConfig,
    identity: Arc<RwLock<NodeIdentity>>,
    store: Arc<dyn DurableStore>,
    pending: Arc<PendingTable>,
    emitter: Arc<Emitter>,
    events: broadcast::Sender<MeshEvent>,
    rendezvous: Option<Arc<dyn RendezvousStore>>,
}

impl DeliveryPipeline {
    /// Wire up the pipeline
    pub fn new(
        config: MeshConfig,
        identity: Arc<RwLock<NodeIdentity>>,
        store: Arc<dyn DurableStore>,
        pending: Arc<PendingTable>,
        emitter: Arc<Emitter>,
        events: broadcast::Sender<MeshEvent>,
        rendezvous: Option<Arc<dyn RendezvousStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            identity,
            store,
            pending,
            emitter,
            events,
            rendezvous,
        })
    }

    /// Submit a message; returns its id
    pub async fn send(self: &Arc<Self>, content: &str, receiver: NodeId) -> NodeResult<String> {
        let local = self.identity.read().await.id.clone();
        let packet = Packet::new(
            PacketType::Message,
            local.clone(),
            receiver.clone(),
            content,
            self.config.initial_ttl(),
        );
        // Oversize content is the sender's problem, not the mesh's
        codec::encode_with_limit(&packet, self.config.max_packet_size)?;

        let message = Message {
            id: packet.id.clone(),
            content: content.to_string(),
            sender_id: local,
            receiver_id: receiver,
            timestamp: packet.timestamp,
            hops: packet.hops.clone(),
            status: MessageStatus::Sending,
            retry_count: 0,
            synced: false,
        };
        self.persist_new_message(&message).await?;
        self.upload_to_relay(&message).await;

        let status = self.emit_attempt(&packet, &message.receiver_id).await;
        self.set_status(&packet.id, status).await;

        let mut recorded = message;
        recorded.status = status;
        let entry = PendingMessage::new(recorded, packet);
        self.pending.insert(entry.clone());
        if let Err(e) = self.store.put_pending(&entry).await {
            warn!(id = %entry.id, error = %e, "Failed to persist pending entry");
        }
        self.schedule_retry(entry.id.clone(), 0);

        info!(id = %entry.id, status = %status, "Message submitted");
        Ok(entry.id)
    }

    /// One emission attempt; resolves the resulting status
    async fn emit_attempt(&self, packet: &Packet, receiver: &NodeId) -> MessageStatus {
        if receiver.is_wildcard() {
            self.emitter.flood(packet, None).await;
            return MessageStatus::Sent;
        }
        match self.emitter.send_direct(packet, receiver).await {
            Ok(_) => MessageStatus::Sent,
            Err(e) => {
                debug!(id = %packet.id, error = %e, "No transport took the packet, queueing");
                MessageStatus::Queued
            }
        }
    }

    /// Arm the retry timer for an entry
    fn schedule_retry(self: &Arc<Self>, id: String, retries: u32) {
        let delay = self.config.retry_delay(retries);
        let pipeline = self.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pipeline.retry_fire(&timer_id).await;
        });
        self.pending.attach_timer(&id, handle);
    }

    /// Timer fire: retry or declare failure
    async fn retry_fire(self: Arc<Self>, id: &str) {
        let Some(entry) = self.pending.get(id) else {
            // ACK won the race
            return;
        };

        if entry.retries >= self.config.max_retries {
            if self.pending.take(id).is_none() {
                return;
            }
            if let Err(e) = self.store.remove_pending(id).await {
                warn!(id, error = %e, "Failed to clear durable pending entry");
            }
            self.set_status(id, MessageStatus::Failed).await;
            info!(id, retries = entry.retries, "Retry budget exhausted");
            return;
        }

        let Some(retries) = self.pending.bump(id) else {
            return;
        };
        if let Some(updated) = self.pending.get(id) {
            if let Err(e) = self.store.put_pending(&updated).await {
                warn!(id, error = %e, "Failed to mirror pending entry");
            }
        }

        debug!(id, retries, "Retrying emission");
        let status = self.emit_attempt(&entry.packet, &entry.message.receiver_id).await;
        if status == MessageStatus::Sent {
            self.promote_queued(id).await;
        }
        self.schedule_retry(id.to_string(), retries);
    }

    /// Re-emit stale pending entries after a transport came back
    pub async fn drain(self: &Arc<Self>) {
        let floor = self.config.reconnect_drain_floor.as_millis() as i64;
        let now = Utc::now().timestamp_millis();
        for entry in self.pending.all() {
            if now - entry.last_attempt <= floor {
                continue;
            }
            if !self.pending.touch(&entry.id) {
                continue;
            }
            debug!(id = %entry.id, "Reconnect drain re-emitting");
            let status = self
                .emit_attempt(&entry.packet, &entry.message.receiver_id)
                .await;
            if status == MessageStatus::Sent {
                self.promote_queued(&entry.id).await;
            }
        }
    }

    /// Reload the durable pending queue after a restart
    pub async fn hydrate(self: &Arc<Self>) {
        let entries = match self.store.all_pending().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Could not read pending queue, starting empty");
                return;
            }
        };
        let count = entries.len();
        for entry in entries {
            let retries = entry.retries;
            let id = entry.id.clone();
            self.pending.insert(entry);
            self.schedule_retry(id, retries);
        }
        if count > 0 {
            info!(count, "Hydrated pending queue");
        }
    }

    /// Manual retry of a failed or stuck message
    pub async fn retry_message(self: &Arc<Self>, id: &str) -> NodeResult<bool> {
        // Still in flight: just force an attempt
        if let Some(entry) = self.pending.get(id) {
            let status = self
                .emit_attempt(&entry.packet, &entry.message.receiver_id)
                .await;
            self.pending.touch(id);
            if status == MessageStatus::Sent {
                self.promote_queued(id).await;
            }
            return Ok(true);
        }

        let Some(message) = self.store.message(id).await? else {
            return Ok(false);
        };
        if matches!(message.status, MessageStatus::Delivered | MessageStatus::Read) {
            return Ok(false);
        }

        // Rebuild the packet under the same id so the old ACK still matches
        let local = self.identity.read().await.id.clone();
        let mut packet = Packet {
            id: message.id.clone(),
            packet_type: PacketType::Message,
            sender_id: local.clone(),
            original_sender_id: local.clone(),
            target_id: message.receiver_id.clone(),
            payload: message.content.clone(),
            timestamp: message.timestamp,
            ttl: self.config.initial_ttl(),
            hops: vec![local],
            signature: String::new(),
        };
        packet.signature = codec::digest_of(&packet);

        let status = self.emit_attempt(&packet, &message.receiver_id).await;
        self.set_status(id, status).await;

        let mut fresh = message;
        fresh.status = status;
        fresh.retry_count = 0;
        let entry = PendingMessage::new(fresh, packet);
        self.pending.insert(entry.clone());
        if let Err(e) = self.store.put_pending(&entry).await {
            warn!(id, error = %e, "Failed to persist pending entry");
        }
        self.schedule_retry(entry.id, 0);
        Ok(true)
    }

    /// Cancel all retry timers
    pub fn shutdown(&self) {
        self.pending.clear();
    }

    async fn promote_queued(&self, id: &str) {
        match self.store.message(id).await {
            Ok(Some(message)) if message.status == MessageStatus::Queued => {
                self.set_status(id, MessageStatus::Sent).await;
            }
            _ => {}
        }
    }

    async fn set_status(&self, id: &str, status: MessageStatus) {
        match self.store.update_message_status(id, status).await {
            Ok(Some(_)) => {
                let _ = self.events.send(MeshEvent::MessageStatusChanged {
                    message_id: id.to_string(),
                    status,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(id, error = %e, "Failed to persist status change"),
        }
    }

    /// Store the freshly built message, retrying writes a few times
    async fn persist_new_message(&self, message: &Message) -> NodeResult<()> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.store.put_message(message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < 2 {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            10 * (attempt as u64 + 1),
                        ))
                        .await;
                    }
                }
            }
        }
        let err = last_err.map(NodeError::Storage).unwrap_or(NodeError::NotStarted);
        let _ = self.events.send(MeshEvent::MessageStatusChanged {
            message_id: message.id.clone(),
            status: MessageStatus::Failed,
        });
        Err(err)
    }

    /// Mirror an outgoing message into the relay's record store
    async fn upload_to_relay(&self, message: &Message) {
        let Some(relay) = &self.rendezvous else {
            return;
        };
        let record = RelayMessageRecord {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            status: message.status,
            hops: message.hops.clone(),
            created_at: message.timestamp,
        };
        match relay.upsert_message(record).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_synced(&message.id).await {
                    warn!(id = %message.id, error = %e, "Failed to flag message synced");
                }
            }
            Err(e) => {
                debug!(id = %message.id, error = %e, "Relay upload deferred");
            }
        }
    }
}
