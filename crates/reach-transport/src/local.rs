//! Same-host bus transport
//!
//! Co-located processes share a [`LocalBus`]: an in-process registry of
//! endpoints with explicit link control. Linking drives peer-observed
//! notifications, unlinking drives peer-lost, and partitions/heals make
//! this the topology harness the integration suites build meshes on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

use reach_core::{
    NodeId, PeerDescriptor, TransportDriver, TransportError, TransportEvent, TransportEventSender,
    TransportKind,
};

struct BusEndpoint {
    descriptor: PeerDescriptor,
    events: TransportEventSender,
}

/// Shared in-process bus connecting co-located nodes
#[derive(Default)]
pub struct LocalBus {
    endpoints: DashMap<NodeId, BusEndpoint>,
    links: DashSet<(NodeId, NodeId)>,
}

impl LocalBus {
    /// Create an empty bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
        if a.as_str() <= b.as_str() {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    /// Whether two nodes can currently reach each other
    pub fn linked(&self, a: &NodeId, b: &NodeId) -> bool {
        self.links.contains(&Self::link_key(a, b))
    }

    /// Connect two nodes; both sides observe each other if registered
    pub fn link(&self, a: &NodeId, b: &NodeId) {
        if a == b || !self.links.insert(Self::link_key(a, b)) {
            return;
        }
        self.notify_observed(a, b);
        self.notify_observed(b, a);
    }

    /// Disconnect two nodes; both sides see a peer-lost
    pub fn unlink(&self, a: &NodeId, b: &NodeId) {
        if self.links.remove(&Self::link_key(a, b)).is_none() {
            return;
        }
        self.notify_lost(a, b);
        self.notify_lost(b, a);
    }

    /// Cut every link between two groups of nodes
    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for a in group_a {
            for b in group_b {
                self.unlink(a, b);
            }
        }
    }

    /// Restore every link between two groups of nodes
    pub fn heal(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for a in group_a {
            for b in group_b {
                self.link(a, b);
            }
        }
    }

    /// Registered peers linked to `id`
    pub fn peers_of(&self, id: &NodeId) -> Vec<NodeId> {
        self.endpoints
            .iter()
            .filter(|e| e.key() != id && self.linked(id, e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    fn register(&self, descriptor: PeerDescriptor, events: TransportEventSender) {
        let id = descriptor.id.clone();
        self.endpoints.insert(id.clone(), BusEndpoint { descriptor, events });
        // Introduce the newcomer to everyone already linked
        for peer in self.peers_of(&id) {
            self.notify_observed(&id, &peer);
            self.notify_observed(&peer, &id);
        }
    }

    fn deregister(&self, id: &NodeId) {
        self.endpoints.remove(id);
        for peer in self.peers_of(id) {
            self.notify_lost(&peer, id);
        }
    }

    /// Tell `to` that `about` is reachable
    fn notify_observed(&self, about: &NodeId, to: &NodeId) {
        let Some(descriptor) = self.endpoints.get(about).map(|e| e.descriptor.clone()) else {
            return;
        };
        if let Some(target) = self.endpoints.get(to) {
            let _ = target.events.try_send(TransportEvent::PeerObserved {
                kind: TransportKind::Local,
                peer: descriptor,
            });
        }
    }

    fn notify_lost(&self, to: &NodeId, lost: &NodeId) {
        if let Some(target) = self.endpoints.get(to) {
            let _ = target.events.try_send(TransportEvent::PeerLost {
                kind: TransportKind::Local,
                peer_id: lost.clone(),
            });
        }
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, bytes: Bytes) -> Result<(), TransportError> {
        if !self.linked(from, to) {
            return Err(TransportError::PeerNotReachable(to.to_string()));
        }
        let Some(target) = self.endpoints.get(to) else {
            return Err(TransportError::PeerNotReachable(to.to_string()));
        };
        target
            .events
            .try_send(TransportEvent::Bytes {
                kind: TransportKind::Local,
                from: from.clone(),
                bytes,
            })
            .map_err(|_| TransportError::QueueFull)
    }
}

/// One node's endpoint on the same-host bus
pub struct LocalTransport {
    descriptor: PeerDescriptor,
    bus: Arc<LocalBus>,
    events: TransportEventSender,
    running: AtomicBool,
}

impl LocalTransport {
    /// Create an endpoint; call [`start`](TransportDriver::start) to join the bus
    pub fn new(
        descriptor: PeerDescriptor,
        bus: Arc<LocalBus>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            descriptor,
            bus,
            events,
            running: AtomicBool::new(false),
        }
    }

    fn local_id(&self) -> &NodeId {
        &self.descriptor.id
    }
}

#[async_trait]
impl TransportDriver for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.bus
            .register(self.descriptor.clone(), self.events.clone());
        debug!(id = %self.local_id(), "Local bus endpoint up");
        let _ = self
            .events
            .try_send(TransportEvent::AvailabilityChanged {
                kind: TransportKind::Local,
                available: true,
            });
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.bus.deregister(self.local_id());
        let _ = self
            .events
            .try_send(TransportEvent::AvailabilityChanged {
                kind: TransportKind::Local,
                available: false,
            });
    }

    async fn broadcast(&self, bytes: Bytes) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        for peer in self.bus.peers_of(self.local_id()) {
            if let Err(e) = self.bus.deliver(self.local_id(), &peer, bytes.clone()) {
                trace!(peer = %peer, error = %e, "Broadcast delivery skipped");
            }
        }
        Ok(())
    }

    async fn send(&self, peer: &NodeId, bytes: Bytes) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.bus.deliver(self.local_id(), peer, bytes)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        if !self.running.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.bus.peers_of(self.local_id())
    }

    fn is_available(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Convenience constructors for bus topologies
///
/// Link every consecutive pair (chain), every pair (mesh), or spokes to
/// a hub (star). Endpoints must be registered by starting their
/// transports; links can be made before or after.
impl LocalBus {
    /// Link nodes pairwise along a chain: a-b, b-c, ...
    pub fn chain(&self, ids: &[NodeId]) {
        for window in ids.windows(2) {
            self.link(&window[0], &window[1]);
        }
    }

    /// Link every pair of nodes
    pub fn full_mesh(&self, ids: &[NodeId]) {
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                self.link(a, b);
            }
        }
    }

    /// Link every spoke to the hub only
    pub fn star(&self, hub: &NodeId, spokes: &[NodeId]) {
        for spoke in spokes {
            self.link(hub, spoke);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn descriptor(id: &str) -> PeerDescriptor {
        PeerDescriptor {
            id: NodeId::new(id),
            name: format!("node {id}"),
            device_type: Default::default(),
            signal_strength: 90,
        }
    }

    async fn endpoint(
        bus: &Arc<LocalBus>,
        id: &str,
    ) -> (LocalTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let transport = LocalTransport::new(descriptor(id), bus.clone(), tx);
        transport.start().await.unwrap();
        (transport, rx)
    }

    async fn drain_until_bytes(rx: &mut mpsc::Receiver<TransportEvent>) -> (NodeId, Bytes) {
        loop {
            match rx.recv().await.unwrap() {
                TransportEvent::Bytes { from, bytes, .. } => return (from, bytes),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_linked_send() {
        let bus = LocalBus::new();
        let (a, _rx_a) = endpoint(&bus, "AAAA0001").await;
        let (_b, mut rx_b) = endpoint(&bus, "BBBB0002").await;
        bus.link(&NodeId::new("AAAA0001"), &NodeId::new("BBBB0002"));

        a.send(&NodeId::new("BBBB0002"), Bytes::from_static(b"hi"))
            .await
            .unwrap();

        let (from, bytes) = drain_until_bytes(&mut rx_b).await;
        assert_eq!(from, NodeId::new("AAAA0001"));
        assert_eq!(&bytes[..], b"hi");
    }

    #[tokio::test]
    async fn test_unlinked_send_fails() {
        let bus = LocalBus::new();
        let (a, _rx_a) = endpoint(&bus, "AAAA0001").await;
        let (_b, _rx_b) = endpoint(&bus, "BBBB0002").await;

        let result = a
            .send(&NodeId::new("BBBB0002"), Bytes::from_static(b"hi"))
            .await;
        assert!(matches!(result, Err(TransportError::PeerNotReachable(_))));
    }

    #[tokio::test]
    async fn test_link_notifies_both_sides() {
        let bus = LocalBus::new();
        let (_a, mut rx_a) = endpoint(&bus, "AAAA0001").await;
        let (_b, mut rx_b) = endpoint(&bus, "BBBB0002").await;

        bus.link(&NodeId::new("AAAA0001"), &NodeId::new("BBBB0002"));

        let mut a_saw_b = false;
        while let Ok(event) = rx_a.try_recv() {
            if let TransportEvent::PeerObserved { peer, .. } = event {
                a_saw_b |= peer.id == NodeId::new("BBBB0002");
            }
        }
        assert!(a_saw_b);

        let mut b_saw_a = false;
        while let Ok(event) = rx_b.try_recv() {
            if let TransportEvent::PeerObserved { peer, .. } = event {
                b_saw_a |= peer.id == NodeId::new("AAAA0001");
            }
        }
        assert!(b_saw_a);
    }

    #[tokio::test]
    async fn test_chain_topology_scopes_broadcast() {
        let bus = LocalBus::new();
        let ids: Vec<NodeId> = ["AAAA0001", "BBBB0002", "CCCC0003"]
            .iter()
            .map(|s| NodeId::new(*s))
            .collect();
        let (a, _rx_a) = endpoint(&bus, "AAAA0001").await;
        let (_b, mut rx_b) = endpoint(&bus, "BBBB0002").await;
        let (_c, mut rx_c) = endpoint(&bus, "CCCC0003").await;
        bus.chain(&ids);

        assert_eq!(a.connected_peers(), vec![NodeId::new("BBBB0002")]);

        a.broadcast(Bytes::from_static(b"hello")).await.unwrap();

        let (_, bytes) = drain_until_bytes(&mut rx_b).await;
        assert_eq!(&bytes[..], b"hello");

        // C is two hops away; nothing arrives directly
        let mut c_got_bytes = false;
        while let Ok(event) = rx_c.try_recv() {
            c_got_bytes |= matches!(event, TransportEvent::Bytes { .. });
        }
        assert!(!c_got_bytes);
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let bus = LocalBus::new();
        let a_id = NodeId::new("AAAA0001");
        let b_id = NodeId::new("BBBB0002");
        let (a, _rx_a) = endpoint(&bus, "AAAA0001").await;
        let (_b, mut rx_b) = endpoint(&bus, "BBBB0002").await;
        bus.link(&a_id, &b_id);

        bus.partition(std::slice::from_ref(&a_id), std::slice::from_ref(&b_id));
        assert!(a
            .send(&b_id, Bytes::from_static(b"hi"))
            .await
            .is_err());

        // B learned the peer went away
        let mut b_lost_a = false;
        while let Ok(event) = rx_b.try_recv() {
            if let TransportEvent::PeerLost { peer_id, .. } = event {
                b_lost_a |= peer_id == a_id;
            }
        }
        assert!(b_lost_a);

        bus.heal(std::slice::from_ref(&a_id), std::slice::from_ref(&b_id));
        assert!(a.send(&b_id, Bytes::from_static(b"hi")).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_deregisters() {
        let bus = LocalBus::new();
        let a_id = NodeId::new("AAAA0001");
        let b_id = NodeId::new("BBBB0002");
        let (a, _rx_a) = endpoint(&bus, "AAAA0001").await;
        let (b, _rx_b) = endpoint(&bus, "BBBB0002").await;
        bus.link(&a_id, &b_id);

        b.stop().await;
        assert!(a.send(&b_id, Bytes::from_static(b"hi")).await.is_err());
        assert!(!b.is_available());
    }
}
