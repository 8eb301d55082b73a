//! redb tables and the storage manager
//!
//! One table per object store plus the conversation index. Keys are
//! raw bytes; values are postcard records, except the config store
//! which holds UTF-8. Index rows live in their own table and are
//! written in the same transaction as the record they point at, so a
//! crash can never leave a dangling index entry.

use std::fmt::Display;
use std::ops::Bound;
use std::path::PathBuf;

use redb::{Database, TableDefinition};
use tracing::{debug, info, instrument};

use crate::error::StorageError;

/// Type alias for scan results
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

// Key: node_id bytes, Value: serialized DeviceRecord
pub const DEVICES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("devices");

// Key: message_id bytes, Value: serialized Message
pub const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

// Key: conversation_key 0x00 timestamp_be 0x00 message_id, Value: message_id
pub const MESSAGES_BY_CONVERSATION: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("messages_by_conversation");

// Key: message_id bytes, Value: serialized PendingMessage
pub const PENDING_MESSAGES: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("pending_messages");

// Key: config key bytes, Value: UTF-8 value
pub const CONFIG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("config");

// Key: fixed field name, Value: serialized NodeIdentity
pub const IDENTITY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("identity");

const ALL_TABLES: [TableDefinition<'static, &[u8], &[u8]>; 6] = [
    DEVICES,
    MESSAGES,
    MESSAGES_BY_CONVERSATION,
    PENDING_MESSAGES,
    CONFIG,
    IDENTITY,
];

/// Every redb failure surfaces as a storage I/O error
fn store_err<E: Display>(e: E) -> StorageError {
    StorageError::Io(e.to_string())
}

/// Smallest byte string greater than every key with this prefix
///
/// None when no such bound exists (empty or all-0xFF prefix); in that
/// case every key at or above the prefix also starts with it, so an
/// open upper bound is still exact.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

/// Configuration for redb storage
#[derive(Debug, Clone)]
pub struct RedbStorageConfig {
    /// Path to the database file
    pub db_path: PathBuf,
}

impl Default for RedbStorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/reach.redb"),
        }
    }
}

/// Owner of the redb database file
pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    /// Open or create the database, declaring every table up front so
    /// later reads never race table creation
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStorageConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
        let db = Database::create(&config.db_path).map_err(store_err)?;

        let txn = db.begin_write().map_err(store_err)?;
        for table in ALL_TABLES {
            txn.open_table(table).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;

        info!(tables = ALL_TABLES.len(), "Opened redb database");
        Ok(Self { db })
    }

    /// Write one entry
    pub fn put(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        self.put_all(&[(table, key, value)])
    }

    /// Write a batch of entries in one transaction
    ///
    /// Records and their index rows go through here together.
    pub fn put_all(
        &self,
        entries: &[(TableDefinition<&[u8], &[u8]>, &[u8], &[u8])],
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        for (table, key, value) in entries {
            txn.open_table(*table)
                .map_err(store_err)?
                .insert(*key, *value)
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;
        debug!(count = entries.len(), "Committed batch");
        Ok(())
    }

    /// Read one entry
    pub fn get(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let found = txn
            .open_table(table)
            .map_err(store_err)?
            .get(key)
            .map_err(store_err)?
            .map(|guard| guard.value().to_vec());
        Ok(found)
    }

    /// Delete one entry; reports whether it existed
    pub fn remove(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let existed = txn
            .open_table(table)
            .map_err(store_err)?
            .remove(key)
            .map_err(store_err)?
            .is_some();
        txn.commit().map_err(store_err)?;
        Ok(existed)
    }

    /// All entries whose key starts with `prefix`, in key order
    ///
    /// The prefix becomes a half-open key range, so the conversation
    /// index comes back already sorted by its embedded timestamp.
    pub fn scan(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        prefix: &[u8],
    ) -> Result<ScanResults, StorageError> {
        let upper = prefix_end(prefix);
        let bounds = (
            Bound::Included(prefix),
            match upper.as_deref() {
                Some(end) => Bound::Excluded(end),
                None => Bound::Unbounded,
            },
        );

        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(table).map_err(store_err)?;
        let mut rows = Vec::new();
        for entry in table.range::<&[u8]>(bounds).map_err(store_err)? {
            let (key, value) = entry.map_err(store_err)?;
            rows.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (RedbStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = RedbStorageConfig {
            db_path: temp_dir.path().join("test.redb"),
        };
        let storage = RedbStorage::open(config).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_put_get() {
        let (storage, _temp) = create_test_storage();

        storage.put(MESSAGES, b"m1", b"value").unwrap();
        assert_eq!(storage.get(MESSAGES, b"m1").unwrap(), Some(b"value".to_vec()));
        assert!(storage.get(MESSAGES, b"m2").unwrap().is_none());
    }

    #[test]
    fn test_remove() {
        let (storage, _temp) = create_test_storage();

        storage.put(DEVICES, b"d1", b"value").unwrap();
        assert!(storage.remove(DEVICES, b"d1").unwrap());
        assert!(!storage.remove(DEVICES, b"d1").unwrap());
        assert!(storage.get(DEVICES, b"d1").unwrap().is_none());
    }

    #[test]
    fn test_scan_is_prefix_exact() {
        let (storage, _temp) = create_test_storage();

        storage
            .put(MESSAGES_BY_CONVERSATION, b"a:b\x00k1", b"m1")
            .unwrap();
        storage
            .put(MESSAGES_BY_CONVERSATION, b"a:b\x00k2", b"m2")
            .unwrap();
        // Sorts directly after the a:b rows; a naive open-ended range
        // would sweep it up
        storage
            .put(MESSAGES_BY_CONVERSATION, b"a:c\x00k1", b"m3")
            .unwrap();

        let rows = storage.scan(MESSAGES_BY_CONVERSATION, b"a:b\x00").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, b"m1");
        assert_eq!(rows[1].1, b"m2");
    }

    #[test]
    fn test_scan_empty_prefix_returns_everything() {
        let (storage, _temp) = create_test_storage();

        storage.put(CONFIG, b"alpha", b"1").unwrap();
        storage.put(CONFIG, b"beta", b"2").unwrap();

        let rows = storage.scan(CONFIG, &[]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_prefix_end_edge_cases() {
        assert_eq!(prefix_end(b"a:b"), Some(b"a:c".to_vec()));
        // Carry past a trailing 0xFF
        assert_eq!(prefix_end(&[0x61, 0xFF]), Some(vec![0x62]));
        // No bound exists above these
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_end(&[]), None);
    }

    #[test]
    fn test_put_all_atomic() {
        let (storage, _temp) = create_test_storage();

        storage
            .put_all(&[
                (MESSAGES, b"m1".as_slice(), b"v1".as_slice()),
                (MESSAGES_BY_CONVERSATION, b"a:b\x00m1".as_slice(), b"m1".as_slice()),
            ])
            .unwrap();

        assert!(storage.get(MESSAGES, b"m1").unwrap().is_some());
        assert_eq!(storage.scan(MESSAGES_BY_CONVERSATION, b"a:b").unwrap().len(), 1);
    }
}
