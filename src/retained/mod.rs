//! Retained messages
//!
//! Exactly one message per topic, held in a topic-keyed trie for wildcard
//! matching and written through to the `RetainedStore` for durability. A
//! zero-length payload deletes. Expired entries are skipped (and dropped)
//! on match, and a periodic sweep purges the rest; the trie is rebuilt
//! from the store on startup.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::Publish;
use crate::store::{
    now_unix_secs, with_retries, with_timeout, Result, RetainedStore, StoredMessage,
    RETAINED_OP_TIMEOUT,
};
use crate::topic::TopicTrie;

/// Retained message cache over a durable store.
pub struct RetainedMessages {
    trie: RwLock<TopicTrie<StoredMessage>>,
    store: Arc<dyn RetainedStore>,
}

impl RetainedMessages {
    /// Build the matcher from whatever the store holds. Entries that
    /// expired while the broker was down are dropped here.
    pub async fn load(store: Arc<dyn RetainedStore>) -> Result<Self> {
        let mut trie = TopicTrie::new();
        let now = now_unix_secs();
        let mut expired = Vec::new();
        for (topic, message) in store.load_all().await? {
            if message.is_expired(now) {
                expired.push(topic);
            } else {
                trie.insert(&topic, message);
            }
        }
        info!(
            "loaded {} retained messages ({} expired while down)",
            trie.len(),
            expired.len()
        );
        for topic in expired {
            store.put(&topic, None).await?;
        }
        Ok(Self {
            trie: RwLock::new(trie),
            store,
        })
    }

    /// Store, replace, or (for empty payloads) delete the retained message
    /// for a topic. The durable write happens before the cache update so a
    /// crash can lose an update but never resurrect a deleted one.
    pub async fn put(&self, publish: &Publish) -> Result<()> {
        let topic = publish.topic.as_ref();
        if publish.payload.is_empty() {
            with_retries("retained delete", || {
                with_timeout(RETAINED_OP_TIMEOUT, self.store.put(topic, None))
            })
            .await?;
            if self.trie.write().remove(topic).is_some() {
                debug!("retained message deleted for '{topic}'");
            }
            return Ok(());
        }

        let mut message = StoredMessage::from_publish(publish);
        message.retain = true;
        with_retries("retained put", || {
            with_timeout(RETAINED_OP_TIMEOUT, self.store.put(topic, Some(&message)))
        })
        .await?;
        self.trie.write().insert(topic, message);
        Ok(())
    }

    /// All unexpired retained messages matching `filter`, as PUBLISH
    /// packets with RETAIN=1 and the message-expiry countdown already
    /// applied. Expired entries found along the way are deleted.
    pub async fn matching(&self, filter: &str) -> Vec<Publish> {
        let now = now_unix_secs();
        let mut live = Vec::new();
        let mut dead = Vec::new();
        {
            let trie = self.trie.read();
            trie.matches_filter(filter, |message| {
                if message.is_expired(now) {
                    dead.push(message.topic.clone());
                } else {
                    live.push(message.to_publish(now));
                }
            });
        }
        self.drop_expired(dead).await;
        live
    }

    /// Purge every expired entry. Run periodically; matching alone only
    /// catches topics someone subscribes to.
    pub async fn sweep(&self) {
        let now = now_unix_secs();
        let mut dead = Vec::new();
        {
            let trie = self.trie.read();
            trie.for_each(|_, message| {
                if message.is_expired(now) {
                    dead.push(message.topic.clone());
                }
            });
        }
        if !dead.is_empty() {
            debug!("retained sweep dropping {} expired messages", dead.len());
            self.drop_expired(dead).await;
        }
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let retained = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                retained.sweep().await;
            }
        })
    }

    pub fn len(&self) -> usize {
        self.trie.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }

    async fn drop_expired(&self, topics: Vec<String>) {
        if topics.is_empty() {
            return;
        }
        {
            let mut trie = self.trie.write();
            for topic in &topics {
                trie.remove(topic);
            }
        }
        for topic in topics {
            if let Err(e) = self.store.put(&topic, None).await {
                warn!("failed to drop expired retained message '{topic}': {e}");
            }
        }
    }
}
