//! In-memory backend
//!
//! Implements every store trait without durability. Used for volatile
//! deployments (`storage.backend = "memory"`) and throughout the test
//! suite. Semantics (cumulative ack, max-seq tracking, purge) mirror the
//! durable backend exactly.

use std::collections::BTreeMap;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ArchiveRecord, ArchiveStore, QueueStore, Result, RetainedStore, SessionRecord, SessionStore,
    StoredMessage,
};

#[derive(Default)]
struct ClientQueue {
    entries: BTreeMap<u64, StoredMessage>,
    max_seq: u64,
}

/// Volatile store backend.
#[derive(Default)]
pub struct MemoryBackend {
    retained: Mutex<AHashMap<String, StoredMessage>>,
    sessions: Mutex<AHashMap<String, SessionRecord>>,
    queues: Mutex<AHashMap<String, ClientQueue>>,
    archive: Mutex<Vec<ArchiveRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived records so far (test observability).
    pub fn archived(&self) -> Vec<ArchiveRecord> {
        self.archive.lock().clone()
    }
}

#[async_trait]
impl RetainedStore for MemoryBackend {
    async fn put(&self, topic: &str, message: Option<&StoredMessage>) -> Result<()> {
        let mut retained = self.retained.lock();
        match message {
            Some(msg) => {
                retained.insert(topic.to_string(), msg.clone());
            }
            None => {
                retained.remove(topic);
            }
        }
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<StoredMessage>> {
        Ok(self.retained.lock().get(topic).cloned())
    }

    async fn load_all(&self) -> Result<Vec<(String, StoredMessage)>> {
        Ok(self
            .retained
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[async_trait]
impl SessionStore for MemoryBackend {
    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        self.sessions
            .lock()
            .insert(record.client_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, client_id: &str) -> Result<()> {
        self.sessions.lock().remove(client_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.sessions.lock().values().cloned().collect())
    }
}

#[async_trait]
impl QueueStore for MemoryBackend {
    async fn enqueue(&self, client_id: &str, seq: u64, message: &StoredMessage) -> Result<()> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(client_id.to_string()).or_default();
        queue.entries.insert(seq, message.clone());
        queue.max_seq = queue.max_seq.max(seq);
        Ok(())
    }

    async fn read_from(
        &self,
        client_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<(u64, StoredMessage)>> {
        let queues = self.queues.lock();
        let Some(queue) = queues.get(client_id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .entries
            .range(after_seq.saturating_add(1)..)
            .take(limit)
            .map(|(&seq, msg)| (seq, msg.clone()))
            .collect())
    }

    async fn ack(&self, client_id: &str, seq: u64) -> Result<()> {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(client_id) {
            queue.entries = queue.entries.split_off(&seq.saturating_add(1));
        }
        Ok(())
    }

    async fn purge(&self, client_id: &str) -> Result<()> {
        self.queues.lock().remove(client_id);
        Ok(())
    }

    async fn max_seq(&self, client_id: &str) -> Result<u64> {
        Ok(self
            .queues
            .lock()
            .get(client_id)
            .map(|q| q.max_seq)
            .unwrap_or(0))
    }
}

#[async_trait]
impl ArchiveStore for MemoryBackend {
    async fn append(&self, record: &ArchiveRecord) -> Result<()> {
        self.archive.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredProperties;

    fn msg(topic: &str) -> StoredMessage {
        StoredMessage {
            topic: topic.into(),
            payload: b"x".to_vec(),
            qos: 1,
            retain: false,
            properties: StoredProperties::default(),
            expires_at_secs: None,
            stored_at_secs: 0,
        }
    }

    #[tokio::test]
    async fn retained_put_get_delete() {
        let store = MemoryBackend::new();
        store.put("t", Some(&msg("t"))).await.unwrap();
        assert!(RetainedStore::get(&store, "t").await.unwrap().is_some());
        store.put("t", None).await.unwrap();
        assert!(RetainedStore::get(&store, "t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_ordering_and_cumulative_ack() {
        let store = MemoryBackend::new();
        for seq in 1..=5u64 {
            store.enqueue("c", seq, &msg("t")).await.unwrap();
        }

        let all = store.read_from("c", 0, 10).await.unwrap();
        assert_eq!(all.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        store.ack("c", 3).await.unwrap();
        let rest = store.read_from("c", 0, 10).await.unwrap();
        assert_eq!(rest.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![4, 5]);

        // ack is idempotent
        store.ack("c", 3).await.unwrap();
        let rest = store.read_from("c", 0, 10).await.unwrap();
        assert_eq!(rest.len(), 2);

        // max_seq survives acks
        assert_eq!(store.max_seq("c").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn read_from_respects_cursor_and_limit() {
        let store = MemoryBackend::new();
        for seq in 1..=10u64 {
            store.enqueue("c", seq, &msg("t")).await.unwrap();
        }
        let page = store.read_from("c", 4, 3).await.unwrap();
        assert_eq!(page.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn purge_clears_queue() {
        let store = MemoryBackend::new();
        store.enqueue("c", 1, &msg("t")).await.unwrap();
        store.purge("c").await.unwrap();
        assert!(store.read_from("c", 0, 10).await.unwrap().is_empty());
        assert_eq!(store.max_seq("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sessions_round_trip() {
        let store = MemoryBackend::new();
        let record = SessionRecord {
            client_id: "c1".into(),
            protocol_version: 4,
            session_expiry_interval: 10,
            keep_alive: 60,
            subscriptions: Vec::new(),
            will: None,
            queue_cursor: 0,
            disconnected_at_secs: None,
        };
        store.upsert(&record).await.unwrap();
        let all = SessionStore::load_all(&store).await.unwrap();
        assert_eq!(all, vec![record]);
        store.delete("c1").await.unwrap();
        assert!(SessionStore::load_all(&store).await.unwrap().is_empty());
    }
}
