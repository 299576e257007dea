//! Pluggable persistence
//!
//! The broker core depends only on the four traits here: retained
//! messages, session records, per-client offline queues, and the optional
//! archive stream. Backends are selected at startup from configuration;
//! `FjallBackend` is the durable default, `MemoryBackend` serves volatile
//! deployments and tests.
//!
//! Failure policy: transient errors are retried with bounded backoff;
//! after the retries a store is marked unhealthy, QoS 1/2 publishes are
//! refused while it stays so, and the next successful operation clears
//! the flag.

mod error;
mod fjall;
mod memory;
mod models;

pub use error::{Result, StoreError};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{
    now_unix_secs, ArchiveRecord, SessionRecord, StoredMessage, StoredProperties,
    StoredSubscription, StoredWill,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

/// Durable key/value store for retained messages, one per topic.
#[async_trait]
pub trait RetainedStore: Send + Sync {
    /// Store or replace the retained message for `topic`; `None` deletes.
    async fn put(&self, topic: &str, message: Option<&StoredMessage>) -> Result<()>;

    /// Fetch one topic's retained message.
    async fn get(&self, topic: &str) -> Result<Option<StoredMessage>>;

    /// Enumerate all retained messages, for rebuilding the matcher trie
    /// at startup.
    async fn load_all(&self) -> Result<Vec<(String, StoredMessage)>>;
}

/// Durable store of session records keyed by client id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, record: &SessionRecord) -> Result<()>;

    async fn delete(&self, client_id: &str) -> Result<()>;

    /// Enumerate all records, for rehydrating detached sessions at startup.
    async fn load_all(&self) -> Result<Vec<SessionRecord>>;
}

/// Durable at-least-once queue of deliveries for detached clients.
///
/// Sequences are assigned by the caller, strictly increasing per client,
/// and never reused within a session lifetime. `ack` is cumulative.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append one entry; returns once the write is durable.
    async fn enqueue(&self, client_id: &str, seq: u64, message: &StoredMessage) -> Result<()>;

    /// Read up to `limit` entries with sequence > `after_seq`, in order.
    async fn read_from(
        &self,
        client_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<(u64, StoredMessage)>>;

    /// Remove all entries with sequence <= `seq`. Idempotent.
    async fn ack(&self, client_id: &str, seq: u64) -> Result<()>;

    /// Drop the whole queue (session expiry or clean start).
    async fn purge(&self, client_id: &str) -> Result<()>;

    /// Highest sequence ever stored for `client_id`, to re-seed the
    /// allocator after a restart.
    async fn max_seq(&self, client_id: &str) -> Result<u64>;
}

/// Optional append-only archive of routed envelopes.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn append(&self, record: &ArchiveRecord) -> Result<()>;
}

/// Retry schedule for transient store errors.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// Deadline for queue writes; a breach refuses the publish.
pub const QUEUE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for retained reads and writes.
pub const RETAINED_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound `fut` by `deadline`, mapping a breach to `StoreError::Timeout`.
pub async fn with_timeout<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

/// Run `op` with the bounded retry schedule. Non-transient errors fail
/// immediately.
pub async fn with_retries<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for (attempt, backoff) in RETRY_BACKOFF.iter().enumerate() {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(
                    "store op '{}' failed (attempt {}): {}",
                    label,
                    attempt + 1,
                    e
                );
                last = Some(e);
                if attempt + 1 < RETRY_BACKOFF.len() {
                    tokio::time::sleep(*backoff).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or(StoreError::Unhealthy))
}

/// Shared health flag for a store. While unhealthy, QoS >= 1 publishes
/// that depend on the store are refused; QoS 0 traffic continues.
#[derive(Debug, Default)]
pub struct StoreHealth {
    unhealthy: AtomicBool,
}

impl StoreHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Acquire)
    }

    pub fn record_success(&self) {
        if self.unhealthy.swap(false, Ordering::AcqRel) {
            warn!("store recovered, resuming QoS 1/2 acceptance");
        }
    }

    pub fn record_failure(&self, context: &str) {
        if !self.unhealthy.swap(true, Ordering::AcqRel) {
            error!("store marked unhealthy after {context}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Timeout)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Backend("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Decode("corrupt".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Decode(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn health_flag_toggles() {
        let health = StoreHealth::new();
        assert!(health.is_healthy());
        health.record_failure("test");
        assert!(!health.is_healthy());
        health.record_success();
        assert!(health.is_healthy());
    }
}
