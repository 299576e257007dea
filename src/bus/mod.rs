//! In-process event bus
//!
//! Hierarchical, best-effort publish/subscribe used to decouple modules.
//! Addresses are dot-separated, `mq.<namespace>.<category>.<operation>[.<id>]`;
//! a subscriber to any prefix receives everything published at or below
//! it. Delivery is best-effort within this process: lagging or dropped
//! receivers lose messages silently.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::protocol::QoS;

/// Address namespace roots used by the core.
pub mod address {
    /// Per-client command channel: `mq.client.cmd.<clientId>`
    pub const CLIENT_CMD: &str = "mq.client.cmd";
    /// Per-client message channel: `mq.client.msg.<clientId>`
    pub const CLIENT_MSG: &str = "mq.client.msg";
    /// Cluster subscription map deltas
    pub const CLUSTER_SUBSCRIPTION_ADD: &str = "mq.cluster.subscription.add";
    pub const CLUSTER_SUBSCRIPTION_DELETE: &str = "mq.cluster.subscription.delete";
    /// Cluster client ownership changes
    pub const CLUSTER_CLIENT_STATUS: &str = "mq.cluster.client.status";
    /// Replicated state traffic
    pub const CLUSTER_REPLICATION: &str = "mq.cluster.replication";
    /// Per-node message channel: `mq.node.msg.<nodeId>`
    pub const NODE_MSG: &str = "mq.node.msg";
    pub const SYSTEM_HEALTH: &str = "mq.system.health";
    pub const SYSTEM_SHUTDOWN: &str = "mq.system.shutdown";
}

/// Events carried on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A client attached to or detached from this node
    ClientStatus { client_id: Arc<str>, online: bool },
    /// First local subscription appeared for a filter
    SubscriptionAdded { filter: String },
    /// Last local subscription for a filter went away
    SubscriptionRemoved { filter: String },
    /// An envelope passed the publish router
    MessagePublished {
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A store changed health
    StoreHealth { healthy: bool },
    /// Broker is draining; consumers should wind down
    Shutdown,
}

/// A delivered bus message: the full address it was published at, plus the
/// event.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub address: Arc<str>,
    pub event: BusEvent,
}

const CHANNEL_CAPACITY: usize = 256;

/// Best-effort hierarchical event bus.
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Publish `event` at `address`. Every subscriber of the address
    /// itself or any dot-prefix of it receives the message.
    pub fn publish(&self, address: &str, event: BusEvent) {
        let message = BusMessage {
            address: Arc::from(address),
            event,
        };
        for prefix in prefixes(address) {
            if let Some(sender) = self.channels.get(prefix) {
                // Best-effort: no receivers is fine.
                let _ = sender.send(message.clone());
            }
        }
    }

    /// Subscribe to an address or address prefix.
    pub fn subscribe(&self, prefix: &str) -> broadcast::Receiver<BusMessage> {
        self.channels
            .entry(prefix.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

/// Iterate `a.b.c.d` as `a.b.c.d`, `a.b.c`, `a.b`, `a`.
fn prefixes(address: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(address);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.rfind('.').map(|i| &current[..i]);
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_walk_up() {
        let all: Vec<&str> = prefixes("mq.client.cmd.c1").collect();
        assert_eq!(all, vec!["mq.client.cmd.c1", "mq.client.cmd", "mq.client", "mq"]);
    }

    #[tokio::test]
    async fn exact_subscriber_receives() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(address::SYSTEM_SHUTDOWN);
        bus.publish(address::SYSTEM_SHUTDOWN, BusEvent::Shutdown);
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg.event, BusEvent::Shutdown));
    }

    #[tokio::test]
    async fn prefix_subscriber_receives_scoped_publishes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(address::CLIENT_CMD);
        let address = format!("{}.c1", address::CLIENT_CMD);
        bus.publish(
            &address,
            BusEvent::ClientStatus {
                client_id: Arc::from("c1"),
                online: true,
            },
        );
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.address.as_ref(), address);
        match msg.event {
            BusEvent::ClientStatus { client_id, online } => {
                assert_eq!(client_id.as_ref(), "c1");
                assert!(online);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn sibling_addresses_are_isolated() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("mq.client.cmd.c1");
        bus.publish(
            "mq.client.cmd.c2",
            BusEvent::ClientStatus {
                client_id: Arc::from("c2"),
                online: false,
            },
        );
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish("mq.nowhere.x.y", BusEvent::Shutdown);
    }
}
