//! redb-backed implementation of the durable store
//!
//! Records are postcard-encoded. The conversation index keeps a
//! composite key `conversation_key 0x00 timestamp_be 0x00 message_id`
//! so a prefix scan yields a conversation already in timestamp order.

use async_trait::async_trait;
use tracing::debug;

use reach_core::{DeviceRecord, Message, MessageStatus, NodeId, NodeIdentity, PendingMessage};

use crate::error::{StorageError, StorageResult};
use crate::tables::{
    RedbStorage, RedbStorageConfig, CONFIG, DEVICES, IDENTITY, MESSAGES,
    MESSAGES_BY_CONVERSATION, PENDING_MESSAGES,
};
use crate::DurableStore;

const IDENTITY_KEY: &[u8] = b"node_identity";

/// Durable store backed by a single redb file
pub struct RedbStore {
    storage: RedbStorage,
}

impl RedbStore {
    /// Open or create the backing database
    pub fn open(config: RedbStorageConfig) -> StorageResult<Self> {
        Ok(Self {
            storage: RedbStorage::open(config)?,
        })
    }

    fn encode<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
        postcard::to_allocvec(value).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
        postcard::from_bytes(bytes).map_err(|e| StorageError::Deserialization(e.to_string()))
    }

    fn conversation_index_key(message: &Message) -> Vec<u8> {
        let key = message.conversation_key();
        let mut index = Vec::with_capacity(key.len() + 1 + 8 + 1 + message.id.len());
        index.extend_from_slice(key.as_bytes());
        index.push(0);
        index.extend_from_slice(&message.timestamp.to_be_bytes());
        index.push(0);
        index.extend_from_slice(message.id.as_bytes());
        index
    }
}

#[async_trait]
impl DurableStore for RedbStore {
    async fn load_identity(&self) -> StorageResult<Option<NodeIdentity>> {
        match self.storage.get(IDENTITY, IDENTITY_KEY)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_identity(&self, identity: &NodeIdentity) -> StorageResult<()> {
        let value = Self::encode(identity)?;
        self.storage.put(IDENTITY, IDENTITY_KEY, &value)?;
        debug!(id = %identity.id, "Persisted node identity");
        Ok(())
    }

    async fn upsert_device(&self, device: &DeviceRecord) -> StorageResult<()> {
        let value = Self::encode(device)?;
        self.storage.put(DEVICES, device.id.as_str().as_bytes(), &value)
    }

    async fn device(&self, id: &NodeId) -> StorageResult<Option<DeviceRecord>> {
        match self.storage.get(DEVICES, id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn all_devices(&self) -> StorageResult<Vec<DeviceRecord>> {
        let entries = self.storage.scan(DEVICES, &[])?;
        let mut devices = Vec::with_capacity(entries.len());
        for (_key, value) in entries {
            devices.push(Self::decode(&value)?);
        }
        Ok(devices)
    }

    async fn evict_devices_before(&self, cutoff: i64) -> StorageResult<usize> {
        let mut evicted = 0;
        for device in self.all_devices().await? {
            if device.last_seen < cutoff
                && self.storage.remove(DEVICES, device.id.as_str().as_bytes())?
            {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "Evicted stale device records");
        }
        Ok(evicted)
    }

    async fn put_message(&self, message: &Message) -> StorageResult<()> {
        let value = Self::encode(message)?;
        let index_key = Self::conversation_index_key(message);
        self.storage.put_all(&[
            (MESSAGES, message.id.as_bytes(), &value),
            (
                MESSAGES_BY_CONVERSATION,
                &index_key,
                message.id.as_bytes(),
            ),
        ])
    }

    async fn message(&self, id: &str) -> StorageResult<Option<Message>> {
        match self.storage.get(MESSAGES, id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn message_exists(&self, id: &str) -> StorageResult<bool> {
        Ok(self.storage.get(MESSAGES, id.as_bytes())?.is_some())
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> StorageResult<Option<Message>> {
        let Some(mut message) = self.message(id).await? else {
            return Ok(None);
        };
        message.status = status;
        let value = Self::encode(&message)?;
        self.storage.put(MESSAGES, id.as_bytes(), &value)?;
        Ok(Some(message))
    }

    async fn mark_synced(&self, id: &str) -> StorageResult<()> {
        if let Some(mut message) = self.message(id).await? {
            message.synced = true;
            let value = Self::encode(&message)?;
            self.storage.put(MESSAGES, id.as_bytes(), &value)?;
        }
        Ok(())
    }

    async fn messages_for_conversation(&self, key: &str) -> StorageResult<Vec<Message>> {
        let mut prefix = key.as_bytes().to_vec();
        prefix.push(0);

        let entries = self.storage.scan(MESSAGES_BY_CONVERSATION, &prefix)?;
        let mut messages = Vec::with_capacity(entries.len());
        for (_index_key, message_id) in entries {
            let id = String::from_utf8_lossy(&message_id);
            if let Some(message) = self.message(&id).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    async fn unsynced_messages(&self) -> StorageResult<Vec<Message>> {
        let entries = self.storage.scan(MESSAGES, &[])?;
        let mut messages = Vec::new();
        for (_key, value) in entries {
            let message: Message = Self::decode(&value)?;
            if !message.synced {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    async fn put_pending(&self, pending: &PendingMessage) -> StorageResult<()> {
        let value = Self::encode(pending)?;
        self.storage.put(PENDING_MESSAGES, pending.id.as_bytes(), &value)
    }

    async fn pending(&self, id: &str) -> StorageResult<Option<PendingMessage>> {
        match self.storage.get(PENDING_MESSAGES, id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn remove_pending(&self, id: &str) -> StorageResult<Option<PendingMessage>> {
        let existing = self.pending(id).await?;
        if existing.is_some() {
            self.storage.remove(PENDING_MESSAGES, id.as_bytes())?;
        }
        Ok(existing)
    }

    async fn all_pending(&self) -> StorageResult<Vec<PendingMessage>> {
        let entries = self.storage.scan(PENDING_MESSAGES, &[])?;
        let mut pending = Vec::with_capacity(entries.len());
        for (_key, value) in entries {
            pending.push(Self::decode(&value)?);
        }
        Ok(pending)
    }

    async fn get_config(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .storage
            .get(CONFIG, key.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn set_config(&self, key: &str, value: &str) -> StorageResult<()> {
        self.storage.put(CONFIG, key.as_bytes(), value.as_bytes())
    }
}
