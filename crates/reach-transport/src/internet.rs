//! P2P-over-internet transport
//!
//! Direct node-to-node TCP sessions bootstrapped by signaling blobs: a
//! node publishes its candidate socket addresses through a rendezvous
//! channel, a peer dials the candidates in order and the two ends
//! exchange hello frames. Frames are length-prefixed; the first frame
//! on every connection is the hello, everything after is opaque packet
//! bytes.
//!
//! Each connection has a bounded send queue that drops the oldest
//! frame on overflow and surfaces the failure so the selector can
//! devalue the transport.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use reach_core::{
    NodeId, PeerDescriptor, TransportDriver, TransportError, TransportEvent, TransportEventSender,
    TransportKind,
};

/// Tuning for the internet driver
#[derive(Debug, Clone)]
pub struct InternetConfig {
    /// Address to listen on; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,
    /// Frames buffered per peer before the oldest is dropped
    pub send_queue_capacity: usize,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
}

impl Default for InternetConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            send_queue_capacity: 64,
            max_frame_size: 64 * 1024,
        }
    }
}

/// Candidate addresses plus identity, exchanged out of band
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalBlob {
    /// The advertising node
    pub id: NodeId,
    /// Display name
    pub name: String,
    /// Socket addresses to try, in order
    pub addrs: Vec<SocketAddr>,
}

impl SignalBlob {
    /// Encode for carriage through a rendezvous channel
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode a blob received from a rendezvous channel
    pub fn decode(blob: &str) -> Result<Self, TransportError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|e| TransportError::BadSignaling(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::BadSignaling(e.to_string()))
    }
}

/// Bounded per-peer send queue, oldest dropped on overflow
struct SendQueue {
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a frame; reports whether the oldest was evicted to make room
    async fn push(&self, bytes: Bytes) -> bool {
        let mut frames = self.frames.lock().await;
        let mut dropped = false;
        if frames.len() >= self.capacity {
            frames.pop_front();
            dropped = true;
        }
        frames.push_back(bytes);
        drop(frames);
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut frames = self.frames.lock().await;
                if let Some(bytes) = frames.pop_front() {
                    return Some(bytes);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct PeerConnection {
    queue: Arc<SendQueue>,
    tasks: Vec<JoinHandle<()>>,
}

type PeerMap = Arc<DashMap<NodeId, PeerConnection>>;

/// TCP-based P2P-over-internet driver
pub struct InternetTransport {
    descriptor: PeerDescriptor,
    config: InternetConfig,
    events: TransportEventSender,
    listen_addr: RwLock<Option<SocketAddr>>,
    peers: PeerMap,
    running: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl InternetTransport {
    /// Create a driver; call [`start`](TransportDriver::start) to bind
    pub fn new(
        descriptor: PeerDescriptor,
        config: InternetConfig,
        events: TransportEventSender,
    ) -> Self {
        Self {
            descriptor,
            config,
            events,
            listen_addr: RwLock::new(None),
            peers: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            accept_task: Mutex::new(None),
        }
    }

    /// The bound listen address, once started
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.read().await
    }

    /// The signaling blob peers need to dial us
    pub async fn signal_blob(&self) -> Option<SignalBlob> {
        let addr = self.listen_addr().await?;
        Some(SignalBlob {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            addrs: vec![addr],
        })
    }

    /// Dial a peer from its signaling blob
    pub async fn connect(&self, blob: &SignalBlob) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        if self.peers.contains_key(&blob.id) {
            return Ok(());
        }
        for addr in &blob.addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(peer = %blob.id, %addr, "Dialed peer");
                    spawn_connection(
                        stream,
                        self.descriptor.clone(),
                        self.config.clone(),
                        self.events.clone(),
                        self.peers.clone(),
                    );
                    return Ok(());
                }
                Err(e) => {
                    trace!(peer = %blob.id, %addr, error = %e, "Candidate failed");
                }
            }
        }
        Err(TransportError::PeerNotReachable(blob.id.to_string()))
    }
}

/// Drive one connection: hello handshake, then reader/writer pumps
fn spawn_connection(
    stream: TcpStream,
    hello: PeerDescriptor,
    config: InternetConfig,
    events: TransportEventSender,
    peers: PeerMap,
) {
    tokio::spawn(async move {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        // Hello goes first in both directions
        let hello_bytes = match serde_json::to_vec(&hello) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if write_frame(&mut writer, &hello_bytes).await.is_err() {
            return;
        }
        let peer: PeerDescriptor = match read_frame(&mut reader, config.max_frame_size).await {
            Ok(frame) => match serde_json::from_slice(&frame) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(error = %e, "Bad hello frame, dropping connection");
                    return;
                }
            },
            Err(_) => return,
        };
        let peer_id = peer.id.clone();

        let queue = Arc::new(SendQueue::new(config.send_queue_capacity));

        // Writer drains the bounded queue
        let writer_queue = queue.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = writer_queue.pop().await {
                if write_frame(&mut writer, &bytes).await.is_err() {
                    break;
                }
            }
        });

        // Reader pumps frames into the shared ingress channel
        let reader_events = events.clone();
        let reader_peer = peer_id.clone();
        let reader_peers = peers.clone();
        let reader_queue = queue.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, config.max_frame_size).await {
                    Ok(frame) => {
                        let event = TransportEvent::Bytes {
                            kind: TransportKind::Internet,
                            from: reader_peer.clone(),
                            bytes: Bytes::from(frame),
                        };
                        if reader_events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            // Connection gone
            reader_queue.close();
            if reader_peers.remove(&reader_peer).is_some() {
                let _ = reader_events
                    .send(TransportEvent::PeerLost {
                        kind: TransportKind::Internet,
                        peer_id: reader_peer.clone(),
                    })
                    .await;
            }
        });

        peers.insert(
            peer_id.clone(),
            PeerConnection {
                queue,
                tasks: vec![writer_task, reader_task],
            },
        );

        let _ = events
            .send(TransportEvent::PeerObserved {
                kind: TransportKind::Internet,
                peer,
            })
            .await;
    });
}

async fn write_frame(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frame(reader: &mut OwnedReadHalf, max_frame_size: usize) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > max_frame_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

#[async_trait]
impl TransportDriver for InternetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Internet
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        *self.listen_addr.write().await = Some(addr);
        info!(%addr, "Internet transport listening");

        let descriptor = self.descriptor.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let peers = self.peers.clone();
        let running = self.running.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        trace!(%remote, "Inbound connection");
                        spawn_connection(
                            stream,
                            descriptor.clone(),
                            config.clone(),
                            events.clone(),
                            peers.clone(),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().await = Some(accept);

        let _ = self
            .events
            .send(TransportEvent::AvailabilityChanged {
                kind: TransportKind::Internet,
                available: true,
            })
            .await;
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        for entry in self.peers.iter() {
            entry.queue.close();
            for task in &entry.tasks {
                task.abort();
            }
        }
        self.peers.clear();
        *self.listen_addr.write().await = None;
        let _ = self
            .events
            .send(TransportEvent::AvailabilityChanged {
                kind: TransportKind::Internet,
                available: false,
            })
            .await;
    }

    async fn broadcast(&self, bytes: Bytes) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        let mut dropped_any = false;
        for entry in self.peers.iter() {
            dropped_any |= entry.queue.push(bytes.clone()).await;
        }
        if dropped_any {
            Err(TransportError::QueueFull)
        } else {
            Ok(())
        }
    }

    async fn send(&self, peer: &NodeId, bytes: Bytes) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        let Some(connection) = self.peers.get(peer) else {
            return Err(TransportError::PeerNotReachable(peer.to_string()));
        };
        if connection.queue.push(bytes).await {
            Err(TransportError::QueueFull)
        } else {
            Ok(())
        }
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    fn is_available(&self) -> bool {
        self.running.load(Ordering::SeqCst)
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
            signal_strength: 60,
        }
    }

    async fn driver(id: &str) -> (InternetTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let transport = InternetTransport::new(descriptor(id), InternetConfig::default(), tx);
        transport.start().await.unwrap();
        (transport, rx)
    }

    async fn wait_for_bytes(rx: &mut mpsc::Receiver<TransportEvent>) -> (NodeId, Bytes) {
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel open")
            {
                TransportEvent::Bytes { from, bytes, .. } => return (from, bytes),
                _ => continue,
            }
        }
    }

    async fn wait_for_peer(rx: &mut mpsc::Receiver<TransportEvent>) -> PeerDescriptor {
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel open")
            {
                TransportEvent::PeerObserved { peer, .. } => return peer,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_signal_blob_roundtrip() {
        let blob = SignalBlob {
            id: NodeId::new("AAAA0001"),
            name: "alice".into(),
            addrs: vec![SocketAddr::from(([127, 0, 0, 1], 4242))],
        };
        let encoded = blob.encode();
        let decoded = SignalBlob::decode(&encoded).unwrap();
        assert_eq!(decoded.id, blob.id);
        assert_eq!(decoded.addrs, blob.addrs);

        assert!(SignalBlob::decode("!!!not base64!!!").is_err());
    }

    #[tokio::test]
    async fn test_dial_and_exchange() {
        let (a, mut rx_a) = driver("AAAA0001").await;
        let (b, mut rx_b) = driver("BBBB0002").await;

        let blob = b.signal_blob().await.unwrap();
        a.connect(&blob).await.unwrap();

        // Both ends observe each other after the hello exchange
        let seen_by_a = wait_for_peer(&mut rx_a).await;
        assert_eq!(seen_by_a.id, NodeId::new("BBBB0002"));
        let seen_by_b = wait_for_peer(&mut rx_b).await;
        assert_eq!(seen_by_b.id, NodeId::new("AAAA0001"));

        a.send(&NodeId::new("BBBB0002"), Bytes::from_static(b"over tcp"))
            .await
            .unwrap();
        let (from, bytes) = wait_for_bytes(&mut rx_b).await;
        assert_eq!(from, NodeId::new("AAAA0001"));
        assert_eq!(&bytes[..], b"over tcp");

        // And the other direction
        b.send(&NodeId::new("AAAA0001"), Bytes::from_static(b"reply"))
            .await
            .unwrap();
        let (from, bytes) = wait_for_bytes(&mut rx_a).await;
        assert_eq!(from, NodeId::new("BBBB0002"));
        assert_eq!(&bytes[..], b"reply");
    }

    #[tokio::test]
    async fn test_peer_lost_on_disconnect() {
        let (a, mut rx_a) = driver("AAAA0001").await;
        let (b, mut rx_b) = driver("BBBB0002").await;

        let blob = b.signal_blob().await.unwrap();
        a.connect(&blob).await.unwrap();
        wait_for_peer(&mut rx_a).await;
        wait_for_peer(&mut rx_b).await;

        b.stop().await;

        let lost = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx_a.recv().await {
                    Some(TransportEvent::PeerLost { peer_id, .. }) => return peer_id,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("timed out");
        assert_eq!(lost, NodeId::new("BBBB0002"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (a, _rx_a) = driver("AAAA0001").await;
        let result = a
            .send(&NodeId::new("NOPE0000"), Bytes::from_static(b"hi"))
            .await;
        assert!(matches!(result, Err(TransportError::PeerNotReachable(_))));
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_connection() {
        let (a, mut rx_a) = driver("AAAA0001").await;
        let addr = a.listen_addr().await.unwrap();

        // Raw client that sends a hello then an absurd frame length
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = serde_json::to_vec(&descriptor("EVIL0001")).unwrap();
        stream.write_u32(hello.len() as u32).await.unwrap();
        stream.write_all(&hello).await.unwrap();
        wait_for_peer(&mut rx_a).await;

        stream.write_u32(u32::MAX).await.unwrap();
        stream.flush().await.unwrap();

        let lost = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx_a.recv().await {
                    Some(TransportEvent::PeerLost { peer_id, .. }) => return peer_id,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("timed out");
        assert_eq!(lost, NodeId::new("EVIL0001"));
    }
}
