//! Offline delivery queues
//!
//! Per-client FIFO of deliveries awaiting a detached session, durable via
//! the `QueueStore`. Sequences are strictly increasing per client and
//! never reused within a session lifetime; `ack` is cumulative. Operations
//! for one client are serialized through a per-client async lock, while
//! different clients proceed independently.
//!
//! Backpressure: each client has a bounded quota of stored entries. QoS 0
//! deliveries are never queued for detached sessions (they are dropped by
//! the router), so hitting the quota means QoS 1/2 overload and the
//! publisher is refused with "quota exceeded".

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::protocol::Publish;
use crate::store::{
    with_retries, with_timeout, QueueStore, Result, StoredMessage, QUEUE_WRITE_TIMEOUT,
};

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Durably stored under this sequence
    Stored(u64),
    /// Per-client quota hit; publisher gets "quota exceeded"
    QuotaExceeded,
}

#[derive(Debug, Default)]
struct ClientState {
    /// Last sequence handed out; 0 means none yet
    last_seq: u64,
    /// Live (unacked) entries in the store
    depth: usize,
    /// Lazily initialized from the store on first touch
    initialized: bool,
}

/// Offline queue manager over a durable `QueueStore`.
pub struct OfflineQueues {
    store: Arc<dyn QueueStore>,
    states: DashMap<Arc<str>, Arc<Mutex<ClientState>>>,
    /// Maximum unacked entries per client (0 = unbounded)
    quota: usize,
}

impl OfflineQueues {
    pub fn new(store: Arc<dyn QueueStore>, quota: usize) -> Self {
        Self {
            store,
            states: DashMap::new(),
            quota,
        }
    }

    fn state(&self, client_id: &Arc<str>) -> Arc<Mutex<ClientState>> {
        self.states
            .entry(client_id.clone())
            .or_default()
            .clone()
    }

    async fn ensure_initialized(&self, client_id: &str, state: &mut ClientState) -> Result<()> {
        if state.initialized {
            return Ok(());
        }
        state.last_seq = self.store.max_seq(client_id).await?;
        state.depth = self.count_live(client_id, 0).await?;
        state.initialized = true;
        Ok(())
    }

    async fn count_live(&self, client_id: &str, after_seq: u64) -> Result<usize> {
        // Quota-bounded count; with an unbounded quota only the emptiness
        // matters for the depth heuristic.
        let probe = if self.quota > 0 { self.quota + 1 } else { 1024 };
        Ok(self.store.read_from(client_id, after_seq, probe).await?.len())
    }

    /// Durably queue one delivery for a detached client.
    pub async fn enqueue(&self, client_id: &Arc<str>, publish: &Publish) -> Result<EnqueueOutcome> {
        let state = self.state(client_id);
        let mut state = state.lock().await;
        self.ensure_initialized(client_id, &mut state).await?;

        if self.quota > 0 && state.depth >= self.quota {
            debug!(
                "offline queue quota ({}) reached for '{}'",
                self.quota, client_id
            );
            return Ok(EnqueueOutcome::QuotaExceeded);
        }

        let seq = state.last_seq + 1;
        let message = StoredMessage::from_publish(publish);
        with_retries("queue enqueue", || {
            with_timeout(QUEUE_WRITE_TIMEOUT, self.store.enqueue(client_id, seq, &message))
        })
        .await?;
        state.last_seq = seq;
        state.depth += 1;
        Ok(EnqueueOutcome::Stored(seq))
    }

    /// Read up to `limit` queued deliveries after `cursor`, oldest first.
    pub async fn read_batch(
        &self,
        client_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<(u64, StoredMessage)>> {
        self.store.read_from(client_id, cursor, limit).await
    }

    /// Cumulatively acknowledge everything up to and including `seq`.
    pub async fn ack(&self, client_id: &Arc<str>, seq: u64) -> Result<()> {
        let state = self.state(client_id);
        let mut state = state.lock().await;
        self.store.ack(client_id, seq).await?;
        if state.initialized {
            state.depth = self.count_live(client_id, 0).await?;
        }
        Ok(())
    }

    /// Drop the queue entirely (session expiry or clean start). Sequence
    /// numbering restarts with the next session lifetime.
    pub async fn purge(&self, client_id: &str) -> Result<()> {
        self.store.purge(client_id).await?;
        self.states.remove(client_id);
        Ok(())
    }

    /// Whether any undelivered entries remain after `cursor`.
    pub async fn has_pending(&self, client_id: &str, cursor: u64) -> Result<bool> {
        Ok(!self.store.read_from(client_id, cursor, 1).await?.is_empty())
    }
}
