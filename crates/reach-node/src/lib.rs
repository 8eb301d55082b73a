//! # Reach Node
//!
//! High-level mesh node coordinator.
//!
//! [`MeshNode`] ties together the routing engine, the peer registry,
//! the transport drivers, the selector, durable storage, and the
//! rendezvous sync task. Building a node resolves its persistent
//! identity (the `initialize` operation); `start` brings up drivers
//! and background tasks; application events arrive on a broadcast
//! channel.
//!
//! ## Example
//!
//! ```rust,ignore
//! use reach_node::{MeshNode, NodeConfig};
//! use reach_transport::{LocalBus, LocalTransport};
//!
//! let node = MeshNode::builder(NodeConfig::default()).build().await?;
//! let bus = LocalBus::new();
//! node.add_driver(Arc::new(LocalTransport::new(
//!     node.descriptor().await,
//!     bus.clone(),
//!     node.driver_events(),
//! ))).await;
//! node.start().await?;
//!
//! let mut events = node.events();
//! let message_id = node.send_message("hello", peer_id).await?;
//! ```

mod config;
mod delivery;
mod emitter;
mod error;
mod presence;
mod sync;

pub use config::NodeConfig;
pub use delivery::DeliveryPipeline;
pub use emitter::Emitter;
pub use error::{NodeError, NodeResult};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use reach_core::{
    conversation_key, DeviceRecord, DeviceType, IdentityError, MeshEvent, Message, NodeId,
    NodeIdentity, Packet, PacketType, PeerDescriptor, TransportDriver, TransportEvent,
    TransportEventReceiver, TransportEventSender, TransportKind,
};
use reach_routing::{
    Dispatch, OutboundFrame, PeerRegistry, PendingTable, RoutingEngine, RoutingStatsSnapshot,
    TypingSignal,
};
use reach_storage::{DurableStore, MemoryStore};
use reach_transport::{
    MetricsTable, RelayPresenceRecord, RendezvousStore, TransportSelector,
};

use crate::presence::PresenceContext;
use crate::sync::SyncContext;

/// Builder for [`MeshNode`]
pub struct NodeBuilder {
    config: NodeConfig,
    store: Option<Arc<dyn DurableStore>>,
    rendezvous: Option<Arc<dyn RendezvousStore>>,
}

impl NodeBuilder {
    /// Use a specific durable store (defaults to in-memory)
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach a rendezvous record store for relay sync and signaling
    pub fn with_rendezvous(mut self, rendezvous: Arc<dyn RendezvousStore>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    /// Resolve the node identity and assemble the core
    ///
    /// This is the `initialize` operation: the persisted identifier is
    /// loaded, or generated and persisted on first run. A store that
    /// cannot produce a stable identity fails the build.
    pub async fn build(self) -> NodeResult<MeshNode> {
        let store: Arc<dyn DurableStore> =
            self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let identity = match store.load_identity().await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                let identity = NodeIdentity::generate();
                store
                    .save_identity(&identity)
                    .await
                    .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
                info!(id = %identity.id, "Generated node identity");
                identity
            }
            Err(e) => {
                return Err(NodeError::Identity(IdentityError::Unavailable(
                    e.to_string(),
                )));
            }
        };
        let local_id = identity.id.clone();

        let identity = Arc::new(RwLock::new(identity));
        let registry = Arc::new(PeerRegistry::new(local_id, self.config.mesh.clone()));
        let pending = Arc::new(PendingTable::new());
        let metrics = Arc::new(MetricsTable::new());
        let selector = Arc::new(TransportSelector::new(metrics.clone()));
        let (events, _) = broadcast::channel(self.config.event_channel_capacity);
        let (driver_events_tx, driver_events_rx) = mpsc::channel(self.config.channel_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.channel_capacity);

        let engine = Arc::new(RoutingEngine::new(
            identity.clone(),
            self.config.device_type,
            self.config.mesh.clone(),
            registry.clone(),
            store.clone(),
            pending.clone(),
            events.clone(),
            outbound_tx,
        ));

        Ok(MeshNode {
            config: self.config,
            identity,
            store,
            registry,
            pending,
            metrics,
            selector,
            engine,
            drivers: Mutex::new(Vec::new()),
            rendezvous: self.rendezvous,
            events,
            driver_events_tx,
            ingress_rx: Mutex::new(Some(driver_events_rx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            emitter: RwLock::new(None),
            pipeline: RwLock::new(None),
            scanning: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// A mesh node: routing, delivery, presence, and storage in one place
pub struct MeshNode {
    config: NodeConfig,
    identity: Arc<RwLock<NodeIdentity>>,
    store: Arc<dyn DurableStore>,
    registry: Arc<PeerRegistry>,
    pending: Arc<PendingTable>,
    metrics: Arc<MetricsTable>,
    selector: Arc<TransportSelector>,
    engine: Arc<RoutingEngine>,
    drivers: Mutex<Vec<Arc<dyn TransportDriver>>>,
    rendezvous: Option<Arc<dyn RendezvousStore>>,
    events: broadcast::Sender<MeshEvent>,
    driver_events_tx: TransportEventSender,
    ingress_rx: Mutex<Option<TransportEventReceiver>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundFrame>>>,
    emitter: RwLock<Option<Arc<Emitter>>>,
    pipeline: RwLock<Option<Arc<DeliveryPipeline>>>,
    scanning: Arc<AtomicBool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Start building a node
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            store: None,
            rendezvous: None,
        }
    }

    /// The node's persistent identity
    pub async fn identity(&self) -> NodeIdentity {
        self.identity.read().await.clone()
    }

    /// The node's identifier
    pub async fn local_id(&self) -> NodeId {
        self.identity.read().await.id.clone()
    }

    /// Self-description drivers hand to peers
    pub async fn descriptor(&self) -> PeerDescriptor {
        let identity = self.identity.read().await;
        PeerDescriptor {
            id: identity.id.clone(),
            name: identity.name.clone(),
            device_type: self.config.device_type,
            signal_strength: 100,
        }
    }

    /// Sender half of the shared driver event channel
    ///
    /// Hand this to every driver at construction.
    pub fn driver_events(&self) -> TransportEventSender {
        self.driver_events_tx.clone()
    }

    /// Register a driver; call before [`start`](Self::start)
    pub async fn add_driver(&self, driver: Arc<dyn TransportDriver>) {
        self.metrics.register(driver.kind());
        self.drivers.lock().await.push(driver);
    }

    /// Subscribe to application events
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Whether the node is running
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Bring up drivers and background tasks
    #[instrument(skip(self))]
    pub async fn start(&self) -> NodeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }

        let drivers = self.drivers.lock().await.clone();
        let emitter = Arc::new(Emitter::new(
            drivers.clone(),
            self.selector.clone(),
            self.registry.clone(),
            self.config.mesh.clone(),
        ));
        *self.emitter.write().await = Some(emitter.clone());

        let pipeline = DeliveryPipeline::new(
            self.config.mesh.clone(),
            self.identity.clone(),
            self.store.clone(),
            self.pending.clone(),
            emitter.clone(),
            self.events.clone(),
            self.rendezvous.clone(),
        );
        *self.pipeline.write().await = Some(pipeline.clone());
        pipeline.hydrate().await;

        // Age out device records nobody has seen in a week
        let cutoff = Utc::now().timestamp_millis() - self.config.device_eviction_age.as_millis() as i64;
        if let Err(e) = self.store.evict_devices_before(cutoff).await {
            warn!(error = %e, "Device eviction pass failed");
        }

        for driver in &drivers {
            match driver.start().await {
                Ok(()) => {
                    self.metrics.set_available(driver.kind(), driver.is_available());
                }
                Err(e) => {
                    warn!(kind = %driver.kind(), error = %e, "Driver failed to start");
                    self.metrics.set_available(driver.kind(), false);
                }
            }
        }

        let mut tasks = self.tasks.lock().await;

        // Sync context is shared by the loop and reconnect triggers
        let sync_ctx = self.rendezvous.clone().map(|relay| {
            Arc::new(SyncContext {
                identity: self.identity.clone(),
                store: self.store.clone(),
                relay,
                engine: self.engine.clone(),
                pending: self.pending.clone(),
                events: self.events.clone(),
            })
        });

        // Ingress pump: every driver event funnels into the engine
        if let Some(mut ingress) = self.ingress_rx.lock().await.take() {
            let engine = self.engine.clone();
            let registry = self.registry.clone();
            let metrics = self.metrics.clone();
            let events = self.events.clone();
            let pump_emitter = emitter.clone();
            let pump_pipeline = pipeline.clone();
            let pump_sync = sync_ctx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = ingress.recv().await {
                    match event {
                        TransportEvent::Bytes { kind, from, bytes } => {
                            engine.receive(&bytes, kind, from).await;
                        }
                        TransportEvent::PeerObserved { kind, peer } => {
                            let change = registry.observe(peer, kind);
                            metrics.set_device_count(kind, registry.count_for_transport(kind));
                            let discovered =
                                matches!(change, reach_routing::RegistryChange::Discovered(_));
                            engine.publish_registry_change(change).await;
                            if discovered {
                                // One-shot hello so the newcomer learns our name
                                let announce = engine.self_announce_packet().await;
                                pump_emitter.flood(&announce, None).await;
                            }
                        }
                        TransportEvent::PeerLost { kind, peer_id } => {
                            if let Some(device) = registry.peer_lost_on(&peer_id, kind) {
                                let _ = events.send(MeshEvent::DeviceUpdated { device });
                            }
                            metrics.set_device_count(kind, registry.count_for_transport(kind));
                        }
                        TransportEvent::AvailabilityChanged { kind, available } => {
                            metrics.set_available(kind, available);
                            let transports = metrics.available_kinds();
                            let _ = events.send(MeshEvent::ConnectionStatusChanged {
                                online: !transports.is_empty(),
                                transports,
                            });
                            if available {
                                pump_pipeline.drain().await;
                                if let Some(ctx) = &pump_sync {
                                    sync::sync_once(ctx).await;
                                }
                            }
                        }
                    }
                }
            }));
        }

        // Outbound pump: engine-built frames fan out through drivers
        if let Some(mut outbound) = self.outbound_rx.lock().await.take() {
            let pump_emitter = emitter.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(frame) = outbound.recv().await {
                    match frame.dispatch {
                        Dispatch::Flood { exclude } => {
                            pump_emitter.flood(&frame.packet, exclude.as_ref()).await;
                        }
                        Dispatch::Direct { peer } => {
                            let _ = pump_emitter.send_direct(&frame.packet, &peer).await;
                        }
                    }
                }
            }));
        }

        tasks.push(presence::spawn_presence_loop(PresenceContext {
            config: self.config.mesh.clone(),
            identity: self.identity.clone(),
            engine: self.engine.clone(),
            emitter: emitter.clone(),
            registry: self.registry.clone(),
        }));

        // Liveness sweep
        {
            let registry = self.registry.clone();
            let engine = self.engine.clone();
            let interval = self.config.sweep_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let changes = registry.sweep(Utc::now().timestamp_millis());
                    for change in changes {
                        engine.publish_registry_change(change).await;
                    }
                }
            }));
        }

        if let Some(ctx) = sync_ctx {
            sync::sync_once(&ctx).await;
            tasks.push(sync::spawn_sync_loop(ctx, self.config.sync_interval));
        }

        let transports = self.metrics.available_kinds();
        let _ = self.events.send(MeshEvent::ConnectionStatusChanged {
            online: !transports.is_empty(),
            transports,
        });

        info!("Node started");
        Ok(())
    }

    /// Stop drivers and background work; flushes offline presence
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scanning.store(false, Ordering::SeqCst);

        if let Some(pipeline) = self.pipeline.write().await.take() {
            pipeline.shutdown();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        // Driver stop flushes the rendezvous offline presence
        for driver in self.drivers.lock().await.iter() {
            driver.stop().await;
        }
        if let Some(relay) = &self.rendezvous {
            let local = self.identity.read().await.id.clone();
            let _ = relay
                .upsert_presence(RelayPresenceRecord {
                    device_id: local,
                    is_online: false,
                    is_typing: false,
                    typing_to: None,
                    last_heartbeat: Utc::now().timestamp_millis(),
                })
                .await;
        }
        *self.emitter.write().await = None;

        let _ = self.events.send(MeshEvent::ConnectionStatusChanged {
            online: false,
            transports: Vec::new(),
        });
        info!("Node stopped");
    }

    /// Stop and release; the durable store keeps identity and history
    pub async fn cleanup(&self) {
        self.stop().await;
    }

    /// Send a text message; returns the message id
    pub async fn send_message(&self, content: &str, receiver: NodeId) -> NodeResult<String> {
        let pipeline = self
            .pipeline
            .read()
            .await
            .clone()
            .ok_or(NodeError::NotStarted)?;
        pipeline.send(content, receiver).await
    }

    /// Re-drive a failed or stuck message
    pub async fn retry_message(&self, message_id: &str) -> NodeResult<bool> {
        let pipeline = self
            .pipeline
            .read()
            .await
            .clone()
            .ok_or(NodeError::NotStarted)?;
        pipeline.retry_message(message_id).await
    }

    /// Tell a peer we are (or stopped) composing a message to them
    pub async fn send_typing_indicator(&self, receiver: NodeId, typing: bool) -> NodeResult<()> {
        let emitter = self
            .emitter
            .read()
            .await
            .clone()
            .ok_or(NodeError::NotStarted)?;
        let local = self.local_id().await;
        let signal = TypingSignal {
            typing,
            to: receiver.clone(),
        };
        let ping = Packet::new(
            PacketType::Ping,
            local.clone(),
            receiver.clone(),
            signal.to_payload(),
            self.config.mesh.initial_ttl(),
        );
        let _ = emitter.send_direct(&ping, &receiver).await;

        if let Some(relay) = &self.rendezvous {
            let _ = relay
                .upsert_presence(RelayPresenceRecord {
                    device_id: local,
                    is_online: true,
                    is_typing: typing,
                    typing_to: typing.then_some(receiver),
                    last_heartbeat: Utc::now().timestamp_millis(),
                })
                .await;
        }
        Ok(())
    }

    /// Begin a scan burst
    pub async fn start_scanning(&self) -> NodeResult<()> {
        let emitter = self
            .emitter
            .read()
            .await
            .clone()
            .ok_or(NodeError::NotStarted)?;
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.events.send(MeshEvent::ScanStateChanged { scanning: true });
        let handle = presence::spawn_scan_burst(
            self.config.mesh.clone(),
            self.identity.clone(),
            self.engine.clone(),
            emitter,
            self.scanning.clone(),
        );
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// End scanning mode
    pub async fn stop_scanning(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            let _ = self
                .events
                .send(MeshEvent::ScanStateChanged { scanning: false });
        }
    }

    /// Whether a scan burst is active
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Rename this node; persists and announces the change
    pub async fn set_device_name(&self, name: impl Into<String>) -> NodeResult<()> {
        let name = name.into();
        {
            let mut identity = self.identity.write().await;
            identity.name = name;
        }
        let identity = self.identity.read().await.clone();
        self.store.save_identity(&identity).await?;

        if let Some(emitter) = self.emitter.read().await.clone() {
            let announce = self.engine.self_announce_packet().await;
            emitter.flood(&announce, None).await;
        }
        debug!(name = %identity.name, "Device renamed");
        Ok(())
    }

    /// Every known device, the local node first
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        let identity = self.identity.read().await;
        let mut self_record = DeviceRecord::new(
            identity.id.clone(),
            identity.name.clone(),
            TransportKind::Local,
        );
        self_record.is_self = true;
        self_record.device_type = self.config.device_type;
        self_record.signal_strength = 100;
        drop(identity);

        let mut devices = vec![self_record];
        devices.extend(self.registry.all_devices());
        devices
    }

    /// Conversation history with a peer, oldest first
    pub async fn conversation(&self, peer: &NodeId) -> NodeResult<Vec<Message>> {
        let local = self.local_id().await;
        let key = conversation_key(&local, peer);
        Ok(self.store.messages_for_conversation(&key).await?)
    }

    /// One stored message
    pub async fn message(&self, id: &str) -> NodeResult<Option<Message>> {
        Ok(self.store.message(id).await?)
    }

    /// Routing engine counters
    pub fn stats(&self) -> RoutingStatsSnapshot {
        self.engine.stats()
    }

    /// Entries waiting for an ACK or a transport
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The node's device category
    pub fn device_type(&self) -> DeviceType {
        self.config.device_type
    }
}
