//! Replicated cluster maps
//!
//! The two eventually-consistent maps every node keeps:
//!
//! - `client → node`: advisory session ownership, last-writer-wins on a
//!   logical timestamp (node-local counter, node id tie-break).
//! - `filter → node set`: which nodes host at least one subscription for
//!   a filter, updated by incremental add/remove deltas and full syncs.
//!
//! Staleness is tolerated by design: a stale entry costs an extra or a
//! briefly missing remote delivery, never a duplicate within one publish
//! on one node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::protocol::LogicalTimestamp;
use crate::topic::TopicTrie;

#[derive(Debug, Clone)]
struct OwnerEntry {
    node_id: Arc<str>,
    ts: LogicalTimestamp,
    /// False once a detach for the same owner was applied
    attached: bool,
}

/// Node-local logical clock for ownership writes.
pub struct LogicalClock {
    node_id: Arc<str>,
    counter: AtomicU64,
}

impl LogicalClock {
    pub fn new(node_id: Arc<str>) -> Self {
        Self {
            node_id,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> LogicalTimestamp {
        LogicalTimestamp {
            counter: self.counter.fetch_add(1, Ordering::Relaxed),
            node_id: self.node_id.to_string(),
        }
    }

    /// Keep the local counter ahead of any timestamp seen from peers.
    pub fn observe(&self, ts: &LogicalTimestamp) {
        self.counter.fetch_max(ts.counter + 1, Ordering::Relaxed);
    }
}

/// Both replicated maps plus the clock that stamps local writes.
pub struct ClusterMaps {
    clock: LogicalClock,
    client_owners: DashMap<Arc<str>, OwnerEntry>,
    filter_nodes: RwLock<TopicTrie<AHashSet<Arc<str>>>>,
}

impl ClusterMaps {
    pub fn new(node_id: Arc<str>) -> Self {
        Self {
            clock: LogicalClock::new(node_id),
            client_owners: DashMap::new(),
            filter_nodes: RwLock::new(TopicTrie::new()),
        }
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    // ------------------------------------------------------------------
    // client → node
    // ------------------------------------------------------------------

    /// Apply an attach (local or remote). Returns true if the entry
    /// changed; older timestamps lose.
    pub fn apply_client_attached(
        &self,
        client_id: &str,
        node_id: &str,
        ts: LogicalTimestamp,
    ) -> bool {
        self.clock.observe(&ts);
        let client_id: Arc<str> = Arc::from(client_id);
        match self.client_owners.entry(client_id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if ts > entry.ts {
                    entry.node_id = Arc::from(node_id);
                    entry.ts = ts;
                    entry.attached = true;
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(OwnerEntry {
                    node_id: Arc::from(node_id),
                    ts,
                    attached: true,
                });
                true
            }
        }
    }

    /// Apply a detach. Only the current owner's detach flips the flag;
    /// a stale detach from a previous owner is ignored.
    pub fn apply_client_detached(&self, client_id: &str, node_id: &str, ts: LogicalTimestamp) {
        self.clock.observe(&ts);
        if let Some(mut entry) = self.client_owners.get_mut(client_id) {
            if entry.node_id.as_ref() == node_id && ts >= entry.ts {
                entry.ts = ts;
                entry.attached = false;
            }
        }
    }

    /// Current advisory owner of a client's session.
    pub fn owner_of(&self, client_id: &str) -> Option<Arc<str>> {
        self.client_owners
            .get(client_id)
            .filter(|e| e.attached)
            .map(|e| e.node_id.clone())
    }

    /// Forget everything attributed to a dead node.
    pub fn forget_node(&self, node_id: &str) {
        self.client_owners
            .retain(|_, entry| entry.node_id.as_ref() != node_id);
        self.filter_nodes.write().retain_values(|nodes| {
            nodes.remove(node_id);
            !nodes.is_empty()
        });
    }

    // ------------------------------------------------------------------
    // filter → node set
    // ------------------------------------------------------------------

    pub fn add_filter(&self, node_id: &str, filter: &str) {
        let mut trie = self.filter_nodes.write();
        let node: Arc<str> = Arc::from(node_id);
        match trie.get_mut(filter) {
            Some(nodes) => {
                nodes.insert(node);
            }
            None => {
                let mut nodes = AHashSet::new();
                nodes.insert(node);
                trie.insert(filter, nodes);
            }
        }
    }

    pub fn remove_filter(&self, node_id: &str, filter: &str) {
        let mut trie = self.filter_nodes.write();
        if let Some(nodes) = trie.get_mut(filter) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                trie.remove(filter);
            }
        }
    }

    /// Replace a node's whole filter set (post-handshake sync).
    pub fn sync_filters(&self, node_id: &str, filters: &[String]) {
        let mut trie = self.filter_nodes.write();
        trie.retain_values(|nodes| {
            nodes.remove(node_id);
            !nodes.is_empty()
        });
        let node: Arc<str> = Arc::from(node_id);
        for filter in filters {
            match trie.get_mut(filter) {
                Some(nodes) => {
                    nodes.insert(node.clone());
                }
                None => {
                    let mut nodes = AHashSet::new();
                    nodes.insert(node.clone());
                    trie.insert(filter, nodes);
                }
            }
        }
    }

    /// Every node holding at least one filter matching `topic`, each
    /// exactly once.
    pub fn nodes_for_topic(&self, topic: &str) -> Vec<Arc<str>> {
        let trie = self.filter_nodes.read();
        let mut seen: AHashSet<Arc<str>> = AHashSet::new();
        trie.matches(topic, |nodes| {
            for node in nodes {
                seen.insert(node.clone());
            }
        });
        seen.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(counter: u64, node: &str) -> LogicalTimestamp {
        LogicalTimestamp {
            counter,
            node_id: node.into(),
        }
    }

    #[test]
    fn attach_last_writer_wins() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        assert!(maps.apply_client_attached("c1", "n1", ts(1, "n1")));
        assert_eq!(maps.owner_of("c1").unwrap().as_ref(), "n1");

        // Newer write from another node wins.
        assert!(maps.apply_client_attached("c1", "n2", ts(5, "n2")));
        assert_eq!(maps.owner_of("c1").unwrap().as_ref(), "n2");

        // Stale write loses.
        assert!(!maps.apply_client_attached("c1", "n3", ts(2, "n3")));
        assert_eq!(maps.owner_of("c1").unwrap().as_ref(), "n2");
    }

    #[test]
    fn equal_counter_tie_breaks_on_node_id() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.apply_client_attached("c1", "na", ts(3, "na"));
        // Same counter, lexicographically larger node id wins.
        assert!(maps.apply_client_attached("c1", "nb", ts(3, "nb")));
        assert!(!maps.apply_client_attached("c1", "na", ts(3, "na")));
    }

    #[test]
    fn detach_clears_ownership_only_for_current_owner() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.apply_client_attached("c1", "n1", ts(1, "n1"));
        // Detach from a node that no longer owns it: ignored.
        maps.apply_client_detached("c1", "n9", ts(2, "n9"));
        assert!(maps.owner_of("c1").is_some());

        maps.apply_client_detached("c1", "n1", ts(3, "n1"));
        assert!(maps.owner_of("c1").is_none());

        // Reattach after detach works.
        maps.apply_client_attached("c1", "n2", ts(4, "n2"));
        assert_eq!(maps.owner_of("c1").unwrap().as_ref(), "n2");
    }

    #[test]
    fn observe_keeps_clock_ahead() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.apply_client_attached("c1", "n2", ts(100, "n2"));
        let next = maps.clock().next();
        assert!(next.counter > 100);
    }

    #[test]
    fn filter_map_matches_wildcards() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.add_filter("n2", "lab/#");
        maps.add_filter("n3", "lab/temp");
        maps.add_filter("n3", "other");

        let mut nodes: Vec<_> = maps
            .nodes_for_topic("lab/temp")
            .iter()
            .map(|n| n.to_string())
            .collect();
        nodes.sort();
        assert_eq!(nodes, vec!["n2", "n3"]);
        assert!(maps.nodes_for_topic("unrelated").is_empty());
    }

    #[test]
    fn node_appears_once_for_multiple_matching_filters() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.add_filter("n2", "a/#");
        maps.add_filter("n2", "a/+");
        assert_eq!(maps.nodes_for_topic("a/b").len(), 1);
    }

    #[test]
    fn remove_filter_prunes_empty_sets() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.add_filter("n2", "t");
        maps.add_filter("n3", "t");
        maps.remove_filter("n2", "t");
        assert_eq!(maps.nodes_for_topic("t").len(), 1);
        maps.remove_filter("n3", "t");
        assert!(maps.nodes_for_topic("t").is_empty());
    }

    #[test]
    fn sync_replaces_node_filters() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.add_filter("n2", "old/#");
        maps.sync_filters("n2", &["new/#".to_string(), "x".to_string()]);
        assert!(maps.nodes_for_topic("old/a").is_empty());
        assert_eq!(maps.nodes_for_topic("new/a").len(), 1);
        assert_eq!(maps.nodes_for_topic("x").len(), 1);
    }

    #[test]
    fn forget_node_drops_both_maps() {
        let maps = ClusterMaps::new(Arc::from("n1"));
        maps.apply_client_attached("c1", "n2", ts(1, "n2"));
        maps.add_filter("n2", "t/#");
        maps.forget_node("n2");
        assert!(maps.owner_of("c1").is_none());
        assert!(maps.nodes_for_topic("t/x").is_empty());
    }
}
