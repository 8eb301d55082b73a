//! In-memory store backend
//!
//! Backs tests and ephemeral nodes. Same contract as the redb backend,
//! no persistence across restarts.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use reach_core::{DeviceRecord, Message, MessageStatus, NodeId, NodeIdentity, PendingMessage};

use crate::error::StorageResult;
use crate::DurableStore;

/// Concurrent in-memory implementation of [`DurableStore`]
#[derive(Default)]
pub struct MemoryStore {
    identity: RwLock<Option<NodeIdentity>>,
    devices: DashMap<NodeId, DeviceRecord>,
    messages: DashMap<String, Message>,
    pending: DashMap<String, PendingMessage>,
    config: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of pending entries
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_identity(&self) -> StorageResult<Option<NodeIdentity>> {
        Ok(self.identity.read().await.clone())
    }

    async fn save_identity(&self, identity: &NodeIdentity) -> StorageResult<()> {
        *self.identity.write().await = Some(identity.clone());
        Ok(())
    }

    async fn upsert_device(&self, device: &DeviceRecord) -> StorageResult<()> {
        self.devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn device(&self, id: &NodeId) -> StorageResult<Option<DeviceRecord>> {
        Ok(self.devices.get(id).map(|d| d.clone()))
    }

    async fn all_devices(&self) -> StorageResult<Vec<DeviceRecord>> {
        Ok(self.devices.iter().map(|d| d.clone()).collect())
    }

    async fn evict_devices_before(&self, cutoff: i64) -> StorageResult<usize> {
        let stale: Vec<NodeId> = self
            .devices
            .iter()
            .filter(|d| d.last_seen < cutoff)
            .map(|d| d.id.clone())
            .collect();
        for id in &stale {
            self.devices.remove(id);
        }
        Ok(stale.len())
    }

    async fn put_message(&self, message: &Message) -> StorageResult<()> {
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn message(&self, id: &str) -> StorageResult<Option<Message>> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn message_exists(&self, id: &str) -> StorageResult<bool> {
        Ok(self.messages.contains_key(id))
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> StorageResult<Option<Message>> {
        match self.messages.get_mut(id) {
            Some(mut entry) => {
                entry.status = status;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn mark_synced(&self, id: &str) -> StorageResult<()> {
        if let Some(mut entry) = self.messages.get_mut(id) {
            entry.synced = true;
        }
        Ok(())
    }

    async fn messages_for_conversation(&self, key: &str) -> StorageResult<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.conversation_key() == key)
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| (m.timestamp, m.id.clone()));
        Ok(messages)
    }

    async fn unsynced_messages(&self) -> StorageResult<Vec<Message>> {
        Ok(self
            .messages
            .iter()
            .filter(|m| !m.synced)
            .map(|m| m.clone())
            .collect())
    }

    async fn put_pending(&self, pending: &PendingMessage) -> StorageResult<()> {
        self.pending.insert(pending.id.clone(), pending.clone());
        Ok(())
    }

    async fn pending(&self, id: &str) -> StorageResult<Option<PendingMessage>> {
        Ok(self.pending.get(id).map(|p| p.clone()))
    }

    async fn remove_pending(&self, id: &str) -> StorageResult<Option<PendingMessage>> {
        Ok(self.pending.remove(id).map(|(_, p)| p))
    }

    async fn all_pending(&self) -> StorageResult<Vec<PendingMessage>> {
        Ok(self.pending.iter().map(|p| p.clone()).collect())
    }

    async fn get_config(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.config.get(key).map(|v| v.clone()))
    }

    async fn set_config(&self, key: &str, value: &str) -> StorageResult<()> {
        self.config.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reach_core::{conversation_key, Packet, PacketType, TransportKind};

    fn make_message(id: &str, from: &str, to: &str, ts: i64) -> Message {
        Message {
            id: id.into(),
            content: "hi".into(),
            sender_id: NodeId::new(from),
            receiver_id: NodeId::new(to),
            timestamp: ts,
            hops: vec![NodeId::new(from)],
            status: MessageStatus::Sending,
            retry_count: 0,
            synced: false,
        }
    }

    #[tokio::test]
    async fn test_identity_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load_identity().await.unwrap().is_none());

        let identity = NodeIdentity::generate();
        store.save_identity(&identity).await.unwrap();
        assert_eq!(store.load_identity().await.unwrap(), Some(identity));
    }

    #[tokio::test]
    async fn test_message_status_update() {
        let store = MemoryStore::new();
        let message = make_message("m1", "AAAA0001", "BBBB0002", 100);
        store.put_message(&message).await.unwrap();

        let updated = store
            .update_message_status("m1", MessageStatus::Delivered)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, MessageStatus::Delivered);

        // Unknown ids update nothing
        assert!(store
            .update_message_status("nope", MessageStatus::Failed)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_conversation_query_ordered() {
        let store = MemoryStore::new();
        let key = conversation_key(&NodeId::new("AAAA0001"), &NodeId::new("BBBB0002"));

        store
            .put_message(&make_message("m2", "BBBB0002", "AAAA0001", 200))
            .await
            .unwrap();
        store
            .put_message(&make_message("m1", "AAAA0001", "BBBB0002", 100))
            .await
            .unwrap();
        // Different conversation stays out
        store
            .put_message(&make_message("m3", "AAAA0001", "CCCC0003", 50))
            .await
            .unwrap();

        let messages = store.messages_for_conversation(&key).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[1].id, "m2");
    }

    #[tokio::test]
    async fn test_unsynced_and_mark_synced() {
        let store = MemoryStore::new();
        store
            .put_message(&make_message("m1", "AAAA0001", "BBBB0002", 100))
            .await
            .unwrap();
        assert_eq!(store.unsynced_messages().await.unwrap().len(), 1);

        store.mark_synced("m1").await.unwrap();
        assert!(store.unsynced_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_queue() {
        let store = MemoryStore::new();
        let message = make_message("m1", "AAAA0001", "BBBB0002", 100);
        let packet = Packet::new(
            PacketType::Message,
            NodeId::new("AAAA0001"),
            NodeId::new("BBBB0002"),
            "hi",
            10,
        );
        let pending = PendingMessage::new(message, packet);

        store.put_pending(&pending).await.unwrap();
        assert!(store.pending("m1").await.unwrap().is_some());

        let removed = store.remove_pending("m1").await.unwrap();
        assert!(removed.is_some());
        assert!(store.remove_pending("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_eviction() {
        let store = MemoryStore::new();
        let mut old = DeviceRecord::new(NodeId::new("OLDX0001"), "old", TransportKind::Local);
        old.last_seen = 1000;
        let mut fresh = DeviceRecord::new(NodeId::new("NEWX0002"), "new", TransportKind::Local);
        fresh.last_seen = 9000;

        store.upsert_device(&old).await.unwrap();
        store.upsert_device(&fresh).await.unwrap();

        let evicted = store.evict_devices_before(5000).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(store.device(&NodeId::new("OLDX0001")).await.unwrap().is_none());
        assert!(store.device(&NodeId::new("NEWX0002")).await.unwrap().is_some());
    }
}
