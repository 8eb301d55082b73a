//! In-memory pending-retry table
//!
//! One entry per unacknowledged MESSAGE packet, plus the retry timer
//! driving its re-emission. The durable mirror lives in the storage
//! layer; this table is the hot-path view the ACK handler races
//! against. Only the delivery pipeline inserts; the routing engine
//! removes on ACK.

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use reach_core::PendingMessage;

/// Pending-retry entries keyed by message id
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<String, PendingMessage>,
    timers: DashMap<String, JoinHandle<()>>,
}

impl PendingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry
    pub fn insert(&self, entry: PendingMessage) {
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Look up an entry
    pub fn get(&self, id: &str) -> Option<PendingMessage> {
        self.entries.get(id).map(|e| e.clone())
    }

    /// Whether an entry exists
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove an entry and cancel its timer
    ///
    /// The ACK path: returns the entry if the ACK won the race.
    pub fn take(&self, id: &str) -> Option<PendingMessage> {
        if let Some((_, timer)) = self.timers.remove(id) {
            timer.abort();
        }
        self.entries.remove(id).map(|(_, e)| e)
    }

    /// Record another attempt; returns the new retry count
    pub fn bump(&self, id: &str) -> Option<u32> {
        let mut entry = self.entries.get_mut(id)?;
        entry.retries += 1;
        entry.last_attempt = Utc::now().timestamp_millis();
        Some(entry.retries)
    }

    /// Refresh an entry's last-attempt time without spending a retry
    ///
    /// The reconnect drain re-emits without touching the retry budget.
    pub fn touch(&self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.last_attempt = Utc::now().timestamp_millis();
                true
            }
            None => false,
        }
    }

    /// Attach (or replace) the retry timer for an entry
    pub fn attach_timer(&self, id: &str, handle: JoinHandle<()>) {
        if let Some(old) = self.timers.insert(id.to_string(), handle) {
            old.abort();
        }
    }

    /// All entry ids
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    /// All entries
    pub fn all(&self) -> Vec<PendingMessage> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancel every timer and drop all entries
    pub fn clear(&self) {
        for timer in self.timers.iter() {
            timer.abort();
        }
        self.timers.clear();
        self.entries.clear();
    }
}

impl Drop for PendingTable {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reach_core::{Message, MessageStatus, NodeId, Packet, PacketType};

    fn make_entry(id: &str) -> PendingMessage {
        let packet = Packet::new(
            PacketType::Message,
            NodeId::new("AAAA0001"),
            NodeId::new("BBBB0002"),
            "hi",
            10,
        );
        let message = Message {
            id: id.into(),
            content: "hi".into(),
            sender_id: NodeId::new("AAAA0001"),
            receiver_id: NodeId::new("BBBB0002"),
            timestamp: 0,
            hops: vec![NodeId::new("AAAA0001")],
            status: MessageStatus::Sent,
            retry_count: 0,
            synced: false,
        };
        let mut entry = PendingMessage::new(message, packet);
        entry.id = id.into();
        entry
    }

    #[tokio::test]
    async fn test_insert_take() {
        let table = PendingTable::new();
        table.insert(make_entry("m1"));
        assert!(table.contains("m1"));

        let taken = table.take("m1").unwrap();
        assert_eq!(taken.id, "m1");
        assert!(!table.contains("m1"));
        // Second take loses the race
        assert!(table.take("m1").is_none());
    }

    #[tokio::test]
    async fn test_bump_counts() {
        let table = PendingTable::new();
        table.insert(make_entry("m1"));

        assert_eq!(table.bump("m1"), Some(1));
        assert_eq!(table.bump("m1"), Some(2));
        assert_eq!(table.bump("missing"), None);
    }

    #[tokio::test]
    async fn test_take_aborts_timer() {
        let table = PendingTable::new();
        table.insert(make_entry("m1"));

        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        table.attach_timer("m1", handle);

        table.take("m1");
        // Yield so the abort lands
        tokio::task::yield_now().await;
        let timer = table.timers.get("m1");
        assert!(timer.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let table = PendingTable::new();
        table.insert(make_entry("m1"));
        table.insert(make_entry("m2"));
        assert_eq!(table.len(), 2);

        table.clear();
        assert!(table.is_empty());
    }
}
