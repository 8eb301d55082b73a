//! Presence and discovery tasks
//!
//! Periodic wildcard ANNOUNCEs carry the node's self-description;
//! PINGs keep direct channels warm between announces; scanning mode
//! adds a short DISCOVER burst. Responsive announces (answering a
//! probe or greeting a new peer) are the routing engine's job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use reach_core::{MeshConfig, NodeId, NodeIdentity, Packet, PacketType};
use reach_routing::{PeerRegistry, RoutingEngine};

use crate::emitter::Emitter;

/// Everything the presence loop needs
pub(crate) struct PresenceContext {
    pub config: MeshConfig,
    pub identity: Arc<RwLock<NodeIdentity>>,
    pub engine: Arc<RoutingEngine>,
    pub emitter: Arc<Emitter>,
    pub registry: Arc<PeerRegistry>,
}

/// Periodic ANNOUNCE plus keepalive PINGs
pub(crate) fn spawn_presence_loop(ctx: PresenceContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.announce_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;

            let announce = ctx.engine.self_announce_packet().await;
            ctx.emitter.flood(&announce, None).await;

            // Ping peers drifting toward their soft timeout
            let local = ctx.identity.read().await.id.clone();
            let now = Utc::now().timestamp_millis();
            let half_soft = ctx.config.soft_peer_timeout.as_millis() as i64 / 2;
            for device in ctx.registry.all_devices() {
                if !device.is_connected || now - device.last_seen < half_soft {
                    continue;
                }
                let ping = Packet::new(
                    PacketType::Ping,
                    local.clone(),
                    device.id.clone(),
                    "",
                    ctx.config.initial_ttl(),
                );
                let _ = ctx.emitter.send_direct(&ping, &device.id).await;
            }
        }
    })
}

/// One DISCOVER per second for the configured burst length
pub(crate) fn spawn_scan_burst(
    config: MeshConfig,
    identity: Arc<RwLock<NodeIdentity>>,
    engine: Arc<RoutingEngine>,
    emitter: Arc<Emitter>,
    scanning: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for round in 0..config.scan_announce_burst {
            if !scanning.load(Ordering::SeqCst) {
                break;
            }
            let announce = engine.self_announce_packet().await;
            let local = identity.read().await.id.clone();
            let discover = Packet::new(
                PacketType::Discover,
                local,
                NodeId::wildcard(),
                announce.payload.clone(),
                config.initial_ttl(),
            );
            debug!(round, "Scan probe");
            emitter.flood(&discover, None).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}
