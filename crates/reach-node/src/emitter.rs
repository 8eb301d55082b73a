//! Outbound fan-out
//!
//! The emitter is the only place driver send methods are called. Flood
//! emission walks every available driver and every connected peer,
//! skipping the transport-peer pair a packet arrived on; directed
//! emission walks the selector's attempt order until one transport
//! takes the packet. Every outcome feeds the metrics table.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use reach_core::{codec, MeshConfig, NodeId, Packet, TransportDriver, TransportError, TransportKind};
use reach_routing::PeerRegistry;
use reach_transport::TransportSelector;

/// Fan-out half of packet emission
pub struct Emitter {
    drivers: Vec<Arc<dyn TransportDriver>>,
    selector: Arc<TransportSelector>,
    registry: Arc<PeerRegistry>,
    config: MeshConfig,
}

impl Emitter {
    /// Create an emitter over a fixed driver set
    pub fn new(
        drivers: Vec<Arc<dyn TransportDriver>>,
        selector: Arc<TransportSelector>,
        registry: Arc<PeerRegistry>,
        config: MeshConfig,
    ) -> Self {
        Self {
            drivers,
            selector,
            registry,
            config,
        }
    }

    /// The drivers this emitter fans out over
    pub fn drivers(&self) -> &[Arc<dyn TransportDriver>] {
        &self.drivers
    }

    fn driver_for(&self, kind: TransportKind) -> Option<&Arc<dyn TransportDriver>> {
        self.drivers.iter().find(|d| d.kind() == kind)
    }

    fn encode(&self, packet: &Packet) -> Option<Bytes> {
        match codec::encode_with_limit(packet, self.config.max_packet_size) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                warn!(id = %packet.id, error = %e, "Refusing to emit oversize packet");
                None
            }
        }
    }

    /// Broadcast to every connected peer on every available transport
    ///
    /// `exclude` is the transport-peer pair the packet arrived on; the
    /// hop list remains the general cycle guard.
    pub async fn flood(&self, packet: &Packet, exclude: Option<&(TransportKind, NodeId)>) {
        let Some(bytes) = self.encode(packet) else {
            return;
        };
        for driver in &self.drivers {
            if !driver.is_available() {
                continue;
            }
            let kind = driver.kind();
            for peer in driver.connected_peers() {
                if let Some((ex_kind, ex_peer)) = exclude {
                    if *ex_kind == kind && *ex_peer == peer {
                        continue;
                    }
                }
                match driver.send(&peer, bytes.clone()).await {
                    Ok(()) => self.selector.metrics().record_success(kind),
                    Err(e) => {
                        trace!(peer = %peer, %kind, error = %e, "Flood send skipped");
                        self.selector.metrics().record_failure(kind);
                    }
                }
            }
        }
    }

    /// Emit toward one peer along the selector's attempt order
    ///
    /// A transport "takes" the packet either by a direct channel to the
    /// peer or by handing it to connected neighbours for relay. Returns
    /// the transport that accepted it.
    pub async fn send_direct(
        &self,
        packet: &Packet,
        peer: &NodeId,
    ) -> Result<TransportKind, TransportError> {
        let Some(bytes) = self.encode(packet) else {
            return Err(TransportError::SendFailed("oversize packet".into()));
        };

        let supported = self.registry.supported_transports(peer);
        let order = self.selector.select(peer, &supported);
        if order.is_empty() {
            return Err(TransportError::NoTransport(peer.to_string()));
        }

        for kind in order {
            let Some(driver) = self.driver_for(kind) else {
                continue;
            };
            match self.attempt(driver.as_ref(), peer, bytes.clone()).await {
                Ok(()) => {
                    debug!(peer = %peer, %kind, id = %packet.id, "Packet emitted");
                    self.selector.metrics().record_success(kind);
                    return Ok(kind);
                }
                Err(e) => {
                    trace!(peer = %peer, %kind, error = %e, "Attempt failed, falling back");
                    self.selector.metrics().record_failure(kind);
                }
            }
        }
        Err(TransportError::NoTransport(peer.to_string()))
    }

    /// One transport attempt: direct channel first, neighbours as relay
    async fn attempt(
        &self,
        driver: &dyn TransportDriver,
        peer: &NodeId,
        bytes: Bytes,
    ) -> Result<(), TransportError> {
        match driver.send(peer, bytes.clone()).await {
            Ok(()) => Ok(()),
            Err(direct_err) => {
                if driver.connected_peers().is_empty() {
                    Err(direct_err)
                } else {
                    driver.broadcast(bytes).await
                }
            }
        }
    }
}
