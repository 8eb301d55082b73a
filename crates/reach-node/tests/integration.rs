//! End-to-end scenarios over real node stacks
//!
//! Nodes run with the same-host bus in explicit topologies (chains,
//! diamonds, partitions) plus the in-memory rendezvous relay. Every
//! test drives full nodes through the public API and observes the
//! application event stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use reach_core::{
    codec, MeshConfig, MeshEvent, Message, MessageStatus, NodeId, NodeIdentity, Packet,
    PacketType, TransportDriver, TransportEvent, TransportKind,
};
use reach_node::{MeshNode, NodeConfig};
use reach_storage::{DurableStore, MemoryStore, RedbStorageConfig, RedbStore};
use reach_transport::{LocalBus, LocalTransport, MemoryRendezvous, RendezvousTransport};

const WAIT: Duration = Duration::from_secs(10);

fn fast_mesh() -> MeshConfig {
    let mut mesh = MeshConfig::default()
        .with_retry(
            Duration::from_millis(50),
            1.5,
            Duration::from_millis(200),
            6,
        )
        .with_announce_period(Duration::from_secs(60));
    mesh.reconnect_drain_floor = Duration::from_millis(0);
    mesh
}

fn fast_node_config() -> NodeConfig {
    NodeConfig::default()
        .with_mesh(fast_mesh())
        .with_sync_interval(Duration::from_millis(50))
}

async fn seeded_store(id: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let identity = NodeIdentity::from_parts(NodeId::new(id), format!("Node {id}"));
    store.save_identity(&identity).await.unwrap();
    store
}

/// A full node on the shared bus with a known id
async fn bus_node(bus: &Arc<LocalBus>, id: &str, config: NodeConfig) -> MeshNode {
    let store = seeded_store(id).await;
    let node = MeshNode::builder(config)
        .with_store(store)
        .build()
        .await
        .unwrap();
    let driver = LocalTransport::new(node.descriptor().await, bus.clone(), node.driver_events());
    node.add_driver(Arc::new(driver)).await;
    node
}

async fn next_received(rx: &mut broadcast::Receiver<MeshEvent>) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await.expect("event stream open") {
                MeshEvent::MessageReceived { message } => return message,
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

async fn wait_for_status(rx: &mut broadcast::Receiver<MeshEvent>, id: &str, status: MessageStatus) {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await.expect("event stream open") {
                MeshEvent::MessageStatusChanged {
                    message_id,
                    status: seen,
                } if message_id == id && seen == status => return,
                _ => continue,
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for status {status}"));
}

fn ids(list: &[&str]) -> Vec<NodeId> {
    list.iter().map(|s| NodeId::new(*s)).collect()
}

// --- Scenario: relay delivery over a chain -------------------------------

#[tokio::test]
async fn relayed_message_reaches_destination() {
    let bus = LocalBus::new();
    let a = bus_node(&bus, "NODEAAAA", fast_node_config()).await;
    let b = bus_node(&bus, "NODEBBBB", fast_node_config()).await;
    let c = bus_node(&bus, "NODECCCC", fast_node_config()).await;
    bus.chain(&ids(&["NODEAAAA", "NODEBBBB", "NODECCCC"]));

    a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();

    let mut a_events = a.events();
    let mut c_events = c.events();

    let message_id = a
        .send_message("hello", NodeId::new("NODECCCC"))
        .await
        .unwrap();

    // C sees the content with the relay path recorded, origin first
    let message = next_received(&mut c_events).await;
    assert_eq!(message.content, "hello");
    assert_eq!(message.sender_id, NodeId::new("NODEAAAA"));
    assert_eq!(
        message.hops,
        vec![NodeId::new("NODEAAAA"), NodeId::new("NODEBBBB")]
    );
    assert_eq!(message.status, MessageStatus::Delivered);

    // The ACK walks back and settles A's pending entry
    wait_for_status(&mut a_events, &message_id, MessageStatus::Delivered).await;
    assert_eq!(a.pending_count(), 0);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

// --- Scenario: unreachable destination fails after retries ---------------

#[tokio::test]
async fn unreachable_destination_eventually_fails() {
    let bus = LocalBus::new();
    let a = bus_node(&bus, "NODEAAAA", fast_node_config()).await;
    let b = bus_node(&bus, "NODEBBBB", fast_node_config()).await;
    bus.chain(&ids(&["NODEAAAA", "NODEBBBB"]));

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut a_events = a.events();
    let mut b_events = b.events();

    // D does not exist anywhere on the mesh
    let message_id = a
        .send_message("anyone home?", NodeId::new("NODEDDDD"))
        .await
        .unwrap();

    wait_for_status(&mut a_events, &message_id, MessageStatus::Failed).await;
    assert_eq!(a.pending_count(), 0);
    assert_eq!(
        a.message(&message_id).await.unwrap().unwrap().status,
        MessageStatus::Failed
    );

    // Nobody delivered it
    let mut b_received = 0;
    while let Ok(event) = b_events.try_recv() {
        if matches!(event, MeshEvent::MessageReceived { .. }) {
            b_received += 1;
        }
    }
    assert_eq!(b_received, 0);

    a.stop().await;
    b.stop().await;
}

// --- Scenario: duplicate path, single delivery ---------------------------

#[tokio::test]
async fn diamond_routes_deliver_once() {
    // A-B-C and A-D-C: two relay paths, no direct A-C link
    let bus = LocalBus::new();
    let a = bus_node(&bus, "NODEAAAA", fast_node_config()).await;
    let b = bus_node(&bus, "NODEBBBB", fast_node_config()).await;
    let c = bus_node(&bus, "NODECCCC", fast_node_config()).await;
    let d = bus_node(&bus, "NODEDDDD", fast_node_config()).await;
    bus.chain(&ids(&["NODEAAAA", "NODEBBBB", "NODECCCC"]));
    bus.chain(&ids(&["NODEAAAA", "NODEDDDD", "NODECCCC"]));

    a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();
    d.start().await.unwrap();

    let mut a_events = a.events();
    let mut c_events = c.events();

    let message_id = a
        .send_message("both ways", NodeId::new("NODECCCC"))
        .await
        .unwrap();

    let message = next_received(&mut c_events).await;
    assert_eq!(message.content, "both ways");
    wait_for_status(&mut a_events, &message_id, MessageStatus::Delivered).await;

    // Let the second copy arrive and settle
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Exactly one delivery and one ACK emission at C
    assert_eq!(c.stats().delivered, 1);
    let mut extra_deliveries = 0;
    while let Ok(event) = c_events.try_recv() {
        if matches!(event, MeshEvent::MessageReceived { .. }) {
            extra_deliveries += 1;
        }
    }
    assert_eq!(extra_deliveries, 0);
    // The twin copy was suppressed by the seen-set
    assert!(c.stats().duplicates >= 1);

    // A saw exactly one delivered transition
    let mut delivered = 0;
    while let Ok(event) = a_events.try_recv() {
        if matches!(
            event,
            MeshEvent::MessageStatusChanged {
                status: MessageStatus::Delivered,
                ..
            }
        ) {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 0, "no second delivered transition");

    a.stop().await;
    b.stop().await;
    c.stop().await;
    d.stop().await;
}

// --- Scenario: rendezvous-only delivery with a restart -------------------

#[tokio::test]
async fn rendezvous_survives_sender_restart() {
    let relay = MemoryRendezvous::new();
    let store_a = seeded_store("NODEAAAA").await;
    let store_c = seeded_store("NODECCCC").await;

    // A comes up relay-only and sends while C is absent
    let a = MeshNode::builder(fast_node_config())
        .with_store(store_a.clone())
        .with_rendezvous(relay.clone())
        .build()
        .await
        .unwrap();
    a.add_driver(Arc::new(RendezvousTransport::new(
        a.descriptor().await,
        relay.clone(),
        a.driver_events(),
        Duration::from_millis(25),
    )))
    .await;
    a.start().await.unwrap();

    let message_id = a
        .send_message("catch up later", NodeId::new("NODECCCC"))
        .await
        .unwrap();
    assert_eq!(a.pending_count(), 1);

    // A dies before any ACK can arrive
    a.stop().await;
    drop(a);

    // C comes up and drains the relay
    let c = MeshNode::builder(fast_node_config())
        .with_store(store_c)
        .with_rendezvous(relay.clone())
        .build()
        .await
        .unwrap();
    c.add_driver(Arc::new(RendezvousTransport::new(
        c.descriptor().await,
        relay.clone(),
        c.driver_events(),
        Duration::from_millis(25),
    )))
    .await;
    let mut c_events = c.events();
    c.start().await.unwrap();

    let message = next_received(&mut c_events).await;
    assert_eq!(message.content, "catch up later");
    assert_eq!(message.sender_id, NodeId::new("NODEAAAA"));

    // A restarts on the same store: the pending queue re-hydrates and
    // the relay record now shows delivery
    let a2 = MeshNode::builder(fast_node_config())
        .with_store(store_a.clone())
        .with_rendezvous(relay.clone())
        .build()
        .await
        .unwrap();
    a2.add_driver(Arc::new(RendezvousTransport::new(
        a2.descriptor().await,
        relay.clone(),
        a2.driver_events(),
        Duration::from_millis(25),
    )))
    .await;
    let mut a2_events = a2.events();
    a2.start().await.unwrap();

    wait_for_status(&mut a2_events, &message_id, MessageStatus::Delivered).await;
    assert_eq!(a2.pending_count(), 0);
    assert_eq!(
        store_a.message(&message_id).await.unwrap().unwrap().status,
        MessageStatus::Delivered
    );

    a2.stop().await;
    c.stop().await;
}

// --- Scenario: TTL exhaustion on a long chain ----------------------------

async fn chain_delivery(node_count: usize, max_ttl: u8) -> bool {
    let bus = LocalBus::new();
    let names: Vec<String> = (0..node_count).map(|i| format!("NODE{i:04}")).collect();
    let chain: Vec<NodeId> = names.iter().map(|n| NodeId::new(n.as_str())).collect();

    let mut mesh = fast_mesh();
    mesh.max_ttl = max_ttl;
    let config = NodeConfig::default()
        .with_mesh(mesh)
        .with_sync_interval(Duration::from_millis(50));

    let mut nodes = Vec::new();
    for name in &names {
        nodes.push(bus_node(&bus, name, config.clone()).await);
    }
    bus.chain(&chain);
    for node in &nodes {
        node.start().await.unwrap();
    }

    let last = chain[node_count - 1].clone();
    let mut last_events = nodes[node_count - 1].events();
    nodes[0].send_message("end of the line", last).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match last_events.recv().await.expect("event stream open") {
                MeshEvent::MessageReceived { message } if message.content == "end of the line" => {
                    return true;
                }
                _ => continue,
            }
        }
    })
    .await
    .unwrap_or(false);

    for node in &nodes {
        node.stop().await;
    }
    outcome
}

#[tokio::test]
async fn ttl_budget_exactly_spans_eleven_nodes() {
    // 11 nodes linearly connected need the full default budget of 10
    assert!(chain_delivery(11, 10).await);
}

#[tokio::test]
async fn ttl_budget_one_short_never_arrives() {
    assert!(!chain_delivery(11, 9).await);
}

// --- Scenario: corrupted packet dropped silently -------------------------

#[tokio::test]
async fn corrupted_packet_is_dropped_silently() {
    let bus = LocalBus::new();
    let b = bus_node(&bus, "NODEBBBB", fast_node_config()).await;
    b.start().await.unwrap();
    let mut b_events = b.events();

    let packet = Packet::new(
        PacketType::Message,
        NodeId::new("NODEXXXX"),
        NodeId::new("NODEBBBB"),
        "tampered",
        9,
    );
    let mut bytes = codec::encode(&packet).unwrap();
    let pos = bytes
        .windows(8)
        .position(|w| w == b"tampered")
        .expect("payload present");
    bytes[pos] ^= 0x01;

    // Inject through the driver channel, as if a transport delivered it
    b.driver_events()
        .send(TransportEvent::Bytes {
            kind: TransportKind::Local,
            from: NodeId::new("NODEXXXX"),
            bytes: bytes.into(),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.stats().bad_digest, 1);
    assert_eq!(b.stats().delivered, 0);
    let mut received = 0;
    while let Ok(event) = b_events.try_recv() {
        if matches!(event, MeshEvent::MessageReceived { .. }) {
            received += 1;
        }
    }
    assert_eq!(received, 0);

    // The seen-set was untouched: the intact packet still delivers
    b.driver_events()
        .send(TransportEvent::Bytes {
            kind: TransportKind::Local,
            from: NodeId::new("NODEXXXX"),
            bytes: codec::encode(&packet).unwrap().into(),
        })
        .await
        .unwrap();

    let message = next_received(&mut b_events).await;
    assert_eq!(message.content, "tampered");

    b.stop().await;
}

// --- Queued on transport outage, drained on reconnect --------------------

#[tokio::test]
async fn queued_message_drains_when_transport_returns() {
    let bus = LocalBus::new();
    let store_a = seeded_store("NODEAAAA").await;
    let a = MeshNode::builder(fast_node_config())
        .with_store(store_a)
        .build()
        .await
        .unwrap();
    let a_driver = Arc::new(LocalTransport::new(
        a.descriptor().await,
        bus.clone(),
        a.driver_events(),
    ));
    a.add_driver(a_driver.clone()).await;

    let b = bus_node(&bus, "NODEBBBB", fast_node_config()).await;
    bus.chain(&ids(&["NODEAAAA", "NODEBBBB"]));

    a.start().await.unwrap();
    b.start().await.unwrap();
    let mut a_events = a.events();
    let mut b_events = b.events();

    // Take A's only transport down
    a_driver.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let message_id = a
        .send_message("park me", NodeId::new("NODEBBBB"))
        .await
        .unwrap();
    assert_eq!(
        a.message(&message_id).await.unwrap().unwrap().status,
        MessageStatus::Queued
    );

    // Transport comes back; the drain re-emits and delivery completes
    a_driver.start().await.unwrap();

    let message = next_received(&mut b_events).await;
    assert_eq!(message.content, "park me");
    wait_for_status(&mut a_events, &message_id, MessageStatus::Delivered).await;

    a.stop().await;
    b.stop().await;
}

// --- Status lifecycle is monotonic ---------------------------------------

#[tokio::test]
async fn status_never_moves_backward() {
    let bus = LocalBus::new();
    let a = bus_node(&bus, "NODEAAAA", fast_node_config()).await;
    let b = bus_node(&bus, "NODEBBBB", fast_node_config()).await;
    bus.chain(&ids(&["NODEAAAA", "NODEBBBB"]));

    a.start().await.unwrap();
    b.start().await.unwrap();
    let mut a_events = a.events();

    let message_id = a
        .send_message("straight line", NodeId::new("NODEBBBB"))
        .await
        .unwrap();
    wait_for_status(&mut a_events, &message_id, MessageStatus::Delivered).await;

    // Give any stray retry a chance to misbehave
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        a.message(&message_id).await.unwrap().unwrap().status,
        MessageStatus::Delivered
    );
    let mut backward = false;
    while let Ok(event) = a_events.try_recv() {
        if let MeshEvent::MessageStatusChanged {
            message_id: id,
            status,
        } = event
        {
            backward |= id == message_id && status != MessageStatus::Delivered;
        }
    }
    assert!(!backward, "status regressed after delivery");

    a.stop().await;
    b.stop().await;
}

// --- Typing indicators ----------------------------------------------------

#[tokio::test]
async fn typing_indicator_reaches_peer() {
    let bus = LocalBus::new();
    let a = bus_node(&bus, "NODEAAAA", fast_node_config()).await;
    let b = bus_node(&bus, "NODEBBBB", fast_node_config()).await;
    bus.chain(&ids(&["NODEAAAA", "NODEBBBB"]));

    a.start().await.unwrap();
    b.start().await.unwrap();
    let mut b_events = b.events();
    // Let the bus introductions land in B's registry
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.send_typing_indicator(NodeId::new("NODEBBBB"), true)
        .await
        .unwrap();

    let typing = tokio::time::timeout(WAIT, async {
        loop {
            match b_events.recv().await.expect("event stream open") {
                MeshEvent::DeviceUpdated { device }
                    if device.id == NodeId::new("NODEAAAA") && device.is_typing =>
                {
                    return true;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for typing indicator");
    assert!(typing);

    a.stop().await;
    b.stop().await;
}

// --- Discovery and loss through the registry ------------------------------

#[tokio::test]
async fn peers_discovered_and_lost() {
    let bus = LocalBus::new();
    let mut mesh = fast_mesh();
    mesh = mesh.with_peer_timeouts(Duration::from_millis(150), Duration::from_millis(300));
    mesh = mesh.with_announce_period(Duration::from_secs(60));
    let config = NodeConfig::default()
        .with_mesh(mesh)
        .with_sweep_interval(Duration::from_millis(100));

    let a = bus_node(&bus, "NODEAAAA", config.clone()).await;
    let b = bus_node(&bus, "NODEBBBB", config.clone()).await;
    bus.chain(&ids(&["NODEAAAA", "NODEBBBB"]));

    a.start().await.unwrap();
    let mut a_events = a.events();
    b.start().await.unwrap();

    let discovered = tokio::time::timeout(WAIT, async {
        loop {
            match a_events.recv().await.expect("event stream open") {
                MeshEvent::DeviceDiscovered { device } if device.id == NodeId::new("NODEBBBB") => {
                    return device;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for discovery");
    assert!(discovered.is_connected);

    // B goes silent; the sweep walks it through disconnected to lost
    b.stop().await;
    let lost = tokio::time::timeout(WAIT, async {
        loop {
            match a_events.recv().await.expect("event stream open") {
                MeshEvent::DeviceLost { device_id } if device_id == NodeId::new("NODEBBBB") => {
                    return true;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for device loss");
    assert!(lost);

    // The record is retained, flagged offline
    let devices = a.devices().await;
    let record = devices
        .iter()
        .find(|d| d.id == NodeId::new("NODEBBBB"))
        .expect("record retained");
    assert!(!record.is_online);

    a.stop().await;
}

// --- Restart preserves identity and history -------------------------------

#[tokio::test]
async fn cleanup_then_initialize_preserves_state() {
    let temp = tempfile::TempDir::new().unwrap();
    let db_config = RedbStorageConfig {
        db_path: temp.path().join("node.redb"),
    };

    let bus = LocalBus::new();
    let (node_id, message_id);
    {
        let store: Arc<dyn DurableStore> = Arc::new(RedbStore::open(db_config.clone()).unwrap());
        let node = MeshNode::builder(fast_node_config())
            .with_store(store)
            .build()
            .await
            .unwrap();
        node.add_driver(Arc::new(LocalTransport::new(
            node.descriptor().await,
            bus.clone(),
            node.driver_events(),
        )))
        .await;
        node.start().await.unwrap();
        node_id = node.local_id().await;
        message_id = node
            .send_message("remember me", NodeId::new("NODEZZZZ"))
            .await
            .unwrap();
        node.cleanup().await;
        // Let aborted tasks drop their store handles before reopening
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let store: Arc<dyn DurableStore> = Arc::new(RedbStore::open(db_config).unwrap());
    let node = MeshNode::builder(fast_node_config())
        .with_store(store)
        .build()
        .await
        .unwrap();
    assert_eq!(node.local_id().await, node_id);
    let message = node.message(&message_id).await.unwrap().unwrap();
    assert_eq!(message.content, "remember me");
}
