//! Rendezvous store-and-forward sync
//!
//! Runs at startup and on an interval: uploads locally unsynced
//! messages to the relay's record store, admits inbound relay records
//! through the routing engine as if they had arrived over a transport,
//! and settles pending entries whose relay record already shows
//! delivery. The seen-set and the message-exists gate keep each
//! message's application delivery exactly once.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use reach_core::{
    codec, MeshEvent, MessageStatus, NodeIdentity, Packet, PacketType, TransportKind,
};
use reach_routing::{PendingTable, RoutingEngine};
use reach_storage::DurableStore;
use reach_transport::{RelayMessageRecord, RendezvousStore};

/// Everything the sync task needs
pub(crate) struct SyncContext {
    pub identity: Arc<RwLock<NodeIdentity>>,
    pub store: Arc<dyn DurableStore>,
    pub relay: Arc<dyn RendezvousStore>,
    pub engine: Arc<RoutingEngine>,
    pub pending: Arc<PendingTable>,
    pub events: broadcast::Sender<MeshEvent>,
}

/// Run the sync loop on an interval
pub(crate) fn spawn_sync_loop(ctx: Arc<SyncContext>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            sync_once(&ctx).await;
        }
    })
}

/// One full sync pass
pub(crate) async fn sync_once(ctx: &SyncContext) {
    upload_unsynced(ctx).await;
    fetch_inbound(ctx).await;
    settle_pending(ctx).await;
}

/// Push locally unsynced messages up to the relay
async fn upload_unsynced(ctx: &SyncContext) {
    let messages = match ctx.store.unsynced_messages().await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "Could not list unsynced messages");
            return;
        }
    };
    for message in messages {
        let record = RelayMessageRecord {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            status: message.status,
            hops: message.hops.clone(),
            created_at: message.timestamp,
        };
        match ctx.relay.upsert_message(record).await {
            Ok(()) => {
                if let Err(e) = ctx.store.mark_synced(&message.id).await {
                    warn!(id = %message.id, error = %e, "Failed to flag message synced");
                }
            }
            Err(e) => {
                debug!(id = %message.id, error = %e, "Relay unreachable, upload deferred");
                return;
            }
        }
    }
}

/// Admit relay records addressed to us through the routing engine
async fn fetch_inbound(ctx: &SyncContext) {
    let local = ctx.identity.read().await.id.clone();
    let records = match ctx.relay.messages_for(&local).await {
        Ok(records) => records,
        Err(_) => return,
    };
    for record in records {
        let exists = ctx
            .store
            .message_exists(&record.message_id)
            .await
            .unwrap_or(false);
        if !exists {
            let packet = packet_from_record(&record);
            let from = packet.sender_id.clone();
            debug!(id = %packet.id, "Admitting relay record");
            ctx.engine
                .ingest(packet, TransportKind::Rendezvous, from)
                .await;
        }
        // Either way the relay copy is now delivered
        if record.status != MessageStatus::Delivered {
            let _ = ctx
                .relay
                .set_message_status(&record.message_id, MessageStatus::Delivered)
                .await;
        }
    }
}

/// Settle pending entries whose relay record shows delivery
async fn settle_pending(ctx: &SyncContext) {
    for id in ctx.pending.ids() {
        let Ok(Some(record)) = ctx.relay.message(&id).await else {
            continue;
        };
        if record.status != MessageStatus::Delivered {
            continue;
        }
        if ctx.pending.take(&id).is_none() {
            continue;
        }
        debug!(id, "Relay shows delivery, settling");
        if let Err(e) = ctx.store.remove_pending(&id).await {
            warn!(id, error = %e, "Failed to clear durable pending entry");
        }
        if let Err(e) = ctx
            .store
            .update_message_status(&id, MessageStatus::Delivered)
            .await
        {
            warn!(id, error = %e, "Failed to persist delivered status");
        }
        let _ = ctx.events.send(MeshEvent::MessageStatusChanged {
            message_id: id,
            status: MessageStatus::Delivered,
        });
    }
}

/// Rebuild a wire packet from a relay record
///
/// Signed locally; the relay store is trusted only as much as any
/// transport, and the engine's verify step still runs.
fn packet_from_record(record: &RelayMessageRecord) -> Packet {
    let hops = if record.hops.first() == Some(&record.sender_id) {
        record.hops.clone()
    } else {
        vec![record.sender_id.clone()]
    };
    let sender = hops.last().cloned().unwrap_or_else(|| record.sender_id.clone());
    let mut packet = Packet {
        id: record.message_id.clone(),
        packet_type: PacketType::Message,
        sender_id: sender,
        original_sender_id: record.sender_id.clone(),
        target_id: record.receiver_id.clone(),
        payload: record.content.clone(),
        timestamp: record.created_at,
        ttl: 0,
        hops,
        signature: String::new(),
    };
    packet.signature = codec::digest_of(&packet);
    packet
}
