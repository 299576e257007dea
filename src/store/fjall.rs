//! Fjall-backed durable stores
//!
//! One LSM keyspace with a partition per concern. Queue entries are keyed
//! `client_id \0 seq_be64` so per-client ranges are contiguous and ordered;
//! MQTT client ids cannot contain NUL, the codec enforces that.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::{
    ArchiveRecord, ArchiveStore, QueueStore, Result, RetainedStore, SessionRecord, SessionStore,
    StoredMessage,
};

/// Durable store backend over a fjall keyspace.
pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    sessions: PartitionHandle,
    queues: PartitionHandle,
    queue_meta: PartitionHandle,
    archive: PartitionHandle,
    archive_seq: AtomicU64,
}

impl FjallBackend {
    /// Open (or create) the keyspace at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;
        let queues = keyspace.open_partition("queues", PartitionCreateOptions::default())?;
        let queue_meta =
            keyspace.open_partition("queue_meta", PartitionCreateOptions::default())?;
        let archive = keyspace.open_partition("archive", PartitionCreateOptions::default())?;

        // Resume the archive counter after the last written record.
        let archive_seq = match archive.last_key_value()? {
            Some((key, _)) => u64_from_key(&key) + 1,
            None => 0,
        };

        Ok(Self {
            keyspace,
            retained,
            sessions,
            queues,
            queue_meta,
            archive,
            archive_seq: AtomicU64::new(archive_seq),
        })
    }

    /// Fsync everything; called on graceful shutdown.
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
    }

    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        Ok(bincode::decode_from_slice(bytes, bincode::config::standard())?.0)
    }
}

fn queue_key(client_id: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(client_id.len() + 9);
    key.extend_from_slice(client_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn queue_prefix(client_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 1);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(0);
    prefix
}

fn seq_from_queue_key(key: &[u8]) -> u64 {
    let tail = &key[key.len().saturating_sub(8)..];
    let mut bytes = [0u8; 8];
    bytes[8 - tail.len()..].copy_from_slice(tail);
    u64::from_be_bytes(bytes)
}

fn u64_from_key(key: &[u8]) -> u64 {
    seq_from_queue_key(key)
}

#[async_trait]
impl RetainedStore for FjallBackend {
    async fn put(&self, topic: &str, message: Option<&StoredMessage>) -> Result<()> {
        match message {
            Some(msg) => {
                self.retained.insert(topic, Self::serialize(msg)?)?;
            }
            None => {
                self.retained.remove(topic)?;
            }
        }
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<StoredMessage>> {
        match self.retained.get(topic)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> Result<Vec<(String, StoredMessage)>> {
        let mut out = Vec::new();
        for item in self.retained.iter() {
            let (key, value) = item?;
            let topic = String::from_utf8_lossy(&key).to_string();
            out.push((topic, Self::deserialize(&value)?));
        }
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for FjallBackend {
    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        self.sessions
            .insert(&record.client_id, Self::serialize(record)?)?;
        Ok(())
    }

    async fn delete(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id)?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let mut out = Vec::new();
        for item in self.sessions.iter() {
            let (_, value) = item?;
            out.push(Self::deserialize(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl QueueStore for FjallBackend {
    async fn enqueue(&self, client_id: &str, seq: u64, message: &StoredMessage) -> Result<()> {
        let mut batch = self.keyspace.batch();
        batch.insert(&self.queues, queue_key(client_id, seq), Self::serialize(message)?);
        batch.insert(&self.queue_meta, client_id, seq.to_be_bytes().to_vec());
        batch.commit()?;
        Ok(())
    }

    async fn read_from(
        &self,
        client_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<(u64, StoredMessage)>> {
        let mut out = Vec::new();
        for item in self.queues.prefix(queue_prefix(client_id)) {
            let (key, value) = item?;
            let seq = seq_from_queue_key(&key);
            if seq <= after_seq {
                continue;
            }
            out.push((seq, Self::deserialize(&value)?));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn ack(&self, client_id: &str, seq: u64) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for item in self.queues.prefix(queue_prefix(client_id)) {
            let (key, _) = item?;
            if seq_from_queue_key(&key) > seq {
                break;
            }
            batch.remove(&self.queues, key);
        }
        batch.commit()?;
        Ok(())
    }

    async fn purge(&self, client_id: &str) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for item in self.queues.prefix(queue_prefix(client_id)) {
            let (key, _) = item?;
            batch.remove(&self.queues, key);
        }
        batch.remove(&self.queue_meta, client_id);
        batch.commit()?;
        Ok(())
    }

    async fn max_seq(&self, client_id: &str) -> Result<u64> {
        match self.queue_meta.get(client_id)? {
            Some(bytes) => {
                let mut be = [0u8; 8];
                be.copy_from_slice(&bytes[..8]);
                Ok(u64::from_be_bytes(be))
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl ArchiveStore for FjallBackend {
    async fn append(&self, record: &ArchiveRecord) -> Result<()> {
        let seq = self.archive_seq.fetch_add(1, Ordering::Relaxed);
        self.archive
            .insert(seq.to_be_bytes().to_vec(), Self::serialize(record)?)?;
        Ok(())
    }
}
