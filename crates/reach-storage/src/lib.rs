//! # Reach Storage
//!
//! Durable local storage for the Reach mesh.
//!
//! The [`DurableStore`] trait covers the five object stores the core
//! depends on: identity, devices, messages, the pending-retry queue,
//! and a config namespace. Two backends are provided:
//!
//! - [`MemoryStore`]: concurrent in-memory maps, for tests and
//!   ephemeral nodes
//! - [`RedbStore`]: redb-backed persistence with secondary indexes by
//!   conversation key and timestamp
//!
//! All operations are asynchronous and single-writer per key; reads
//! that fail are treated as empty by callers, writes are the caller's
//! responsibility to retry.

pub mod error;
pub mod memory;
pub mod redb_store;
pub mod tables;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use tables::{RedbStorage, RedbStorageConfig};

use async_trait::async_trait;

use reach_core::{DeviceRecord, Message, MessageStatus, NodeId, NodeIdentity, PendingMessage};

/// The durable local store contract
///
/// `messages` is queryable by conversation key (timestamp order) and by
/// sync flag; `pendingMessages` is a flat queue keyed by message id.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // --- identity ---

    /// Load the persisted node identity, if any
    async fn load_identity(&self) -> StorageResult<Option<NodeIdentity>>;

    /// Persist the node identity
    async fn save_identity(&self, identity: &NodeIdentity) -> StorageResult<()>;

    // --- devices ---

    /// Insert or replace a device record
    async fn upsert_device(&self, device: &DeviceRecord) -> StorageResult<()>;

    /// Fetch one device record
    async fn device(&self, id: &NodeId) -> StorageResult<Option<DeviceRecord>>;

    /// All known device records
    async fn all_devices(&self) -> StorageResult<Vec<DeviceRecord>>;

    /// Delete devices not seen since `cutoff` (unix millis); returns count
    async fn evict_devices_before(&self, cutoff: i64) -> StorageResult<usize>;

    // --- messages ---

    /// Insert or replace a message record
    async fn put_message(&self, message: &Message) -> StorageResult<()>;

    /// Fetch one message
    async fn message(&self, id: &str) -> StorageResult<Option<Message>>;

    /// Whether a message id is already recorded
    async fn message_exists(&self, id: &str) -> StorageResult<bool>;

    /// Update a message's status; returns the updated record if present
    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> StorageResult<Option<Message>>;

    /// Flag a message as uploaded to the rendezvous store
    async fn mark_synced(&self, id: &str) -> StorageResult<()>;

    /// Messages in a conversation, oldest first
    async fn messages_for_conversation(&self, key: &str) -> StorageResult<Vec<Message>>;

    /// Messages not yet uploaded to the rendezvous store
    async fn unsynced_messages(&self) -> StorageResult<Vec<Message>>;

    // --- pending-retry queue ---

    /// Insert or replace a pending entry
    async fn put_pending(&self, pending: &PendingMessage) -> StorageResult<()>;

    /// Fetch one pending entry
    async fn pending(&self, id: &str) -> StorageResult<Option<PendingMessage>>;

    /// Remove a pending entry, returning it if present
    async fn remove_pending(&self, id: &str) -> StorageResult<Option<PendingMessage>>;

    /// The whole pending queue
    async fn all_pending(&self) -> StorageResult<Vec<PendingMessage>>;

    // --- config namespace ---

    /// Read a config value
    async fn get_config(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a config value
    async fn set_config(&self, key: &str, value: &str) -> StorageResult<()>;
}
