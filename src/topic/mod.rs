//! Topic matching and the subscription index
//!
//! The index maps topic filters to subscriber sets via a trie, resolves
//! wildcard matches for publishes, and handles shared-subscription groups
//! (`$share/<group>/<filter>`) with per-group round-robin delivery.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    parse_shared_filter, topic_matches_filter, validate_topic_filter, validate_topic_name,
    TopicError, MAX_TOPIC_LENGTH,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::SubscriptionOptions;

/// One stored subscription.
#[derive(Debug, Clone)]
pub struct IndexedSubscription {
    pub client_id: Arc<str>,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
    /// Present for `$share/<group>/...` subscriptions
    pub share_group: Option<Arc<str>>,
}

/// A subscription selected for delivery of one publish.
#[derive(Debug, Clone)]
pub struct MatchedSubscription {
    pub client_id: Arc<str>,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
    /// Set for deliveries picked out of a shared group
    pub shared: bool,
}

/// Members of one shared group on one filter, in insertion order, with the
/// round-robin cursor. The cursor is atomic so matching can advance it
/// under the trie read lock.
#[derive(Debug, Default)]
struct SharedGroup {
    members: Vec<IndexedSubscription>,
    cursor: AtomicUsize,
}

/// Subscribers stored at one trie leaf.
#[derive(Debug, Default)]
struct FilterEntry {
    direct: Vec<IndexedSubscription>,
    shared: AHashMap<Arc<str>, SharedGroup>,
}

impl FilterEntry {
    fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.shared.is_empty()
    }
}

/// Outcome of a subscribe call, used to drive cluster filter propagation
/// and retain-handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// No subscription existed for this filter on this node before
    pub first_for_filter: bool,
    /// This client already held this exact subscription (options replaced)
    pub replaced: bool,
}

/// Outcome of an unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    pub removed: bool,
    /// The filter has no local subscribers left
    pub last_for_filter: bool,
}

/// Thread-safe subscription index.
///
/// Writers take the trie lock for O(filter depth); matching takes a read
/// lock only, shared-group cursors being atomics inside the entries.
pub struct SubscriptionIndex {
    trie: RwLock<TopicTrie<FilterEntry>>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Insert or replace the subscription of `client_id` on `filter`.
    ///
    /// `filter` may carry a `$share/<group>/` prefix; the trie is keyed by
    /// the inner filter in that case.
    pub fn subscribe(
        &self,
        filter: &str,
        client_id: Arc<str>,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> SubscribeOutcome {
        let (group, inner): (Option<Arc<str>>, &str) = match parse_shared_filter(filter) {
            Some((g, inner)) => (Some(Arc::from(g)), inner),
            None => (None, filter),
        };

        let sub = IndexedSubscription {
            client_id,
            options,
            subscription_id,
            share_group: group.clone(),
        };

        let mut trie = self.trie.write();
        let first_for_filter = trie.get(inner).is_none();
        if first_for_filter {
            trie.insert(inner, FilterEntry::default());
        }
        let entry = trie.get_mut(inner).expect("entry just ensured");

        let slot = match group {
            Some(g) => &mut entry.shared.entry(g).or_default().members,
            None => &mut entry.direct,
        };
        let replaced = match slot.iter_mut().find(|m| m.client_id == sub.client_id) {
            Some(existing) => {
                *existing = sub;
                true
            }
            None => {
                slot.push(sub);
                false
            }
        };

        SubscribeOutcome {
            first_for_filter,
            replaced,
        }
    }

    /// Remove the subscription of `client_id` on `filter`.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> UnsubscribeOutcome {
        let (group, inner) = match parse_shared_filter(filter) {
            Some((g, inner)) => (Some(g), inner),
            None => (None, filter),
        };

        let mut trie = self.trie.write();
        let Some(entry) = trie.get_mut(inner) else {
            return UnsubscribeOutcome {
                removed: false,
                last_for_filter: false,
            };
        };

        let removed = match group {
            Some(g) => {
                let mut removed = false;
                if let Some(shared) = entry.shared.get_mut(g) {
                    let before = shared.members.len();
                    shared.members.retain(|m| m.client_id.as_ref() != client_id);
                    removed = shared.members.len() != before;
                    if shared.members.is_empty() {
                        entry.shared.remove(g);
                    }
                }
                removed
            }
            None => {
                let before = entry.direct.len();
                entry.direct.retain(|m| m.client_id.as_ref() != client_id);
                entry.direct.len() != before
            }
        };

        let last_for_filter = removed && entry.is_empty();
        if last_for_filter {
            trie.remove(inner);
        }

        UnsubscribeOutcome {
            removed,
            last_for_filter,
        }
    }

    /// Remove every subscription of `client_id`. Returns the filters that
    /// now have no local subscribers (for cluster map maintenance).
    pub fn unsubscribe_all(&self, client_id: &str) -> Vec<String> {
        let mut emptied = Vec::new();
        let mut trie = self.trie.write();
        // First pass records which filters become empty, second pass prunes.
        trie.for_each(|filter, entry| {
            let holds = entry
                .direct
                .iter()
                .chain(entry.shared.values().flat_map(|g| g.members.iter()))
                .any(|m| m.client_id.as_ref() == client_id);
            let others = entry
                .direct
                .iter()
                .chain(entry.shared.values().flat_map(|g| g.members.iter()))
                .any(|m| m.client_id.as_ref() != client_id);
            if holds && !others {
                emptied.push(filter.to_string());
            }
        });
        trie.retain_values(|entry| {
            entry.direct.retain(|m| m.client_id.as_ref() != client_id);
            entry.shared.retain(|_, g| {
                g.members.retain(|m| m.client_id.as_ref() != client_id);
                !g.members.is_empty()
            });
            !entry.is_empty()
        });
        emptied
    }

    /// Resolve the delivery set for one publish.
    ///
    /// Direct matches yield every subscriber once per matching filter.
    /// Each shared group contributes exactly one member, chosen round-robin
    /// over members for which `connected` returns true; a group with no
    /// connected member contributes nothing.
    pub fn matches<F>(&self, topic: &str, connected: F) -> SmallVec<[MatchedSubscription; 8]>
    where
        F: Fn(&str) -> bool,
    {
        let trie = self.trie.read();
        let mut out: SmallVec<[MatchedSubscription; 8]> = SmallVec::new();

        trie.matches(topic, |entry| {
            for sub in &entry.direct {
                out.push(MatchedSubscription {
                    client_id: sub.client_id.clone(),
                    options: sub.options,
                    subscription_id: sub.subscription_id,
                    shared: false,
                });
            }
            for group in entry.shared.values() {
                if group.members.is_empty() {
                    continue;
                }
                let start = group.cursor.fetch_add(1, Ordering::Relaxed);
                // Probe forward from the cursor for a connected member.
                let picked = (0..group.members.len())
                    .map(|i| &group.members[(start + i) % group.members.len()])
                    .find(|m| connected(&m.client_id));
                if let Some(sub) = picked {
                    out.push(MatchedSubscription {
                        client_id: sub.client_id.clone(),
                        options: sub.options,
                        subscription_id: sub.subscription_id,
                        shared: true,
                    });
                }
            }
        });

        out
    }

    /// Distinct filters currently held (inner filters for shared subs),
    /// for cluster synchronization and rehydration checks.
    pub fn filters(&self) -> Vec<String> {
        let trie = self.trie.read();
        let mut out = Vec::with_capacity(trie.len());
        trie.for_each(|filter, _| out.push(filter.to_string()));
        out
    }

    /// Number of distinct filters.
    pub fn filter_count(&self) -> usize {
        self.trie.read().len()
    }
}
