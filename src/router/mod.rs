//! Publish router
//!
//! Takes accepted envelopes and fans them out: local attached sessions get
//! deliveries through their connection channel, detached sessions get
//! durable queue entries, remote subscribers are handed to the cluster
//! coordinator as a set of destination nodes, and the optional archive
//! stream records everything. Per-subscription options (No-Local,
//! Retain-As-Published, subscription identifiers, QoS downgrade) are
//! applied here, exactly once per subscriber per publish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::bus::{address, BusEvent, EventBus};
use crate::protocol::{Properties, Publish, QoS, ReasonCode};
use crate::queue::{EnqueueOutcome, OfflineQueues};
use crate::retained::RetainedMessages;
use crate::session::{SessionRegistry, SessionState};
use crate::store::{now_unix_secs, ArchiveRecord, ArchiveStore, StoreHealth};
use crate::topic::SubscriptionIndex;

/// A routed application message with its broker-side metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub properties: Properties,
    pub arrival: Instant,
    /// Node the message entered the cluster on
    pub sender_node: Arc<str>,
    /// Publishing client, absent for internal senders (bridges, will
    /// messages routed after session destruction)
    pub sender_client: Option<Arc<str>>,
}

impl Envelope {
    pub fn from_publish(
        publish: &Publish,
        sender_node: Arc<str>,
        sender_client: Option<Arc<str>>,
    ) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            properties: publish.properties.clone(),
            arrival: Instant::now(),
            sender_node,
            sender_client,
        }
    }

    /// Whether the message-expiry deadline has passed.
    pub fn is_expired(&self) -> bool {
        match self.properties.message_expiry_interval {
            Some(interval) => self.arrival.elapsed() >= Duration::from_secs(interval as u64),
            None => false,
        }
    }

    /// Rebuild a PUBLISH for delivery, with the expiry interval
    /// decremented by the time spent in this broker.
    pub fn to_publish(&self) -> Publish {
        let mut properties = self.properties.clone();
        // Outbound packets never carry the inbound topic alias.
        properties.topic_alias = None;
        if let Some(interval) = properties.message_expiry_interval {
            let spent = self.arrival.elapsed().as_secs() as u32;
            properties.message_expiry_interval = Some(interval.saturating_sub(spent));
        }
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties,
        }
    }
}

/// One delivery handed to a connection task.
#[derive(Debug)]
pub struct Delivery {
    pub publish: Publish,
    /// Offline-queue sequence to ack once the client acknowledges
    pub queue_seq: Option<u64>,
}

/// Commands flowing to a connection task.
#[derive(Debug)]
pub enum Outbound {
    Deliver(Delivery),
    /// Force-close the connection (takeover, shutdown)
    Disconnect(ReasonCode),
}

/// Handle to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub sender: mpsc::Sender<Outbound>,
    /// Session epoch at attach; stale handles fail the epoch check
    pub epoch: u64,
}

/// Live connections on this node, keyed by client id.
#[derive(Default)]
pub struct ConnectionTable {
    inner: DashMap<Arc<str>, ConnectionHandle>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: Arc<str>, handle: ConnectionHandle) {
        self.inner.insert(client_id, handle);
    }

    /// Remove the entry only if it still belongs to `epoch`; a takeover
    /// may already have replaced it.
    pub fn remove_if_epoch(&self, client_id: &str, epoch: u64) -> bool {
        self.inner
            .remove_if(client_id, |_, handle| handle.epoch == epoch)
            .is_some()
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.inner.get(client_id).map(|h| h.clone())
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Ask a connection to close; used by takeover and shutdown.
    pub fn request_disconnect(&self, client_id: &str, reason: ReasonCode) -> bool {
        match self.inner.get(client_id) {
            Some(handle) => handle.sender.try_send(Outbound::Disconnect(reason)).is_ok(),
            None => false,
        }
    }

    pub fn client_ids(&self) -> Vec<Arc<str>> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }
}

/// Cluster-side fan-out, implemented by the coordinator. The router only
/// computes destinations from its own view and never inspects remote
/// subscription state.
pub trait RemoteFanout: Send + Sync {
    /// Remote nodes whose filter set matches `topic`.
    fn remote_targets(&self, topic: &str) -> Vec<Arc<str>>;

    /// Send one copy of the envelope to `node`, at most once per publish.
    fn forward(&self, node: &Arc<str>, envelope: &Envelope);
}

/// How the router disposed of an envelope, mapped by the session layer to
/// PUBACK/PUBREC reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub reason: ReasonCode,
}

impl RouteOutcome {
    fn success(delivered_any: bool) -> Self {
        Self {
            reason: if delivered_any {
                ReasonCode::Success
            } else {
                ReasonCode::NoMatchingSubscribers
            },
        }
    }
}

/// Aggregated per-client delivery decision for one publish.
struct ClientAggregate {
    qos: QoS,
    retain_as_published: bool,
    subscription_ids: SmallVec<[u32; 4]>,
}

/// The publish fan-out engine.
pub struct PublishRouter {
    node_id: Arc<str>,
    subscriptions: Arc<SubscriptionIndex>,
    sessions: Arc<SessionRegistry>,
    queues: Arc<OfflineQueues>,
    connections: Arc<ConnectionTable>,
    retained: Arc<RetainedMessages>,
    archive: Option<Arc<dyn ArchiveStore>>,
    cluster: RwLock<Option<Arc<dyn RemoteFanout>>>,
    bus: Arc<EventBus>,
    store_health: Arc<StoreHealth>,
}

impl PublishRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: Arc<str>,
        subscriptions: Arc<SubscriptionIndex>,
        sessions: Arc<SessionRegistry>,
        queues: Arc<OfflineQueues>,
        connections: Arc<ConnectionTable>,
        retained: Arc<RetainedMessages>,
        archive: Option<Arc<dyn ArchiveStore>>,
        bus: Arc<EventBus>,
        store_health: Arc<StoreHealth>,
    ) -> Self {
        Self {
            node_id,
            subscriptions,
            sessions,
            queues,
            connections,
            retained,
            archive,
            cluster: RwLock::new(None),
            bus,
            store_health,
        }
    }

    /// Wire the cluster coordinator in after construction (it needs the
    /// router for inbound remote publishes).
    pub fn set_cluster(&self, cluster: Arc<dyn RemoteFanout>) {
        *self.cluster.write() = Some(cluster);
    }

    pub fn node_id(&self) -> &Arc<str> {
        &self.node_id
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    /// Handle the retain flag of an accepted publish before fan-out.
    /// Failures surface as NACKs for QoS 1/2; QoS 0 is best-effort.
    pub async fn store_retained(&self, publish: &Publish) -> Result<(), ReasonCode> {
        match self.retained.put(publish).await {
            Ok(()) => {
                self.store_health.record_success();
                Ok(())
            }
            Err(e) => {
                warn!("retained store write failed for '{}': {e}", publish.topic);
                self.store_health.record_failure("retained write failure");
                Err(ReasonCode::UnspecifiedError)
            }
        }
    }

    /// Route one envelope. The returned outcome is what the publisher is
    /// told; delivery to subscribers is asynchronous past this point.
    pub async fn route(&self, envelope: &Envelope) -> RouteOutcome {
        // Expired on arrival (e.g. long store/forward path): drop silently.
        if envelope.is_expired() {
            trace!("dropping expired envelope for '{}'", envelope.topic);
            return RouteOutcome::success(false);
        }

        // An unhealthy store cannot guarantee at-least-once; refuse QoS 1/2
        // up front, keep QoS 0 flowing.
        if envelope.qos != QoS::AtMostOnce && !self.store_health.is_healthy() {
            return RouteOutcome {
                reason: ReasonCode::UnspecifiedError,
            };
        }

        let matches = self
            .subscriptions
            .matches(&envelope.topic, |client_id| {
                self.connections.is_connected(client_id)
            });

        // Collapse matches per client: one PUBLISH per subscriber, max QoS
        // over its matching filters, all subscription identifiers attached.
        let mut per_client: AHashMap<Arc<str>, ClientAggregate> =
            AHashMap::with_capacity(matches.len());
        for m in matches {
            if m.options.no_local
                && envelope.sender_client.as_deref() == Some(m.client_id.as_ref())
            {
                continue;
            }
            let entry = per_client
                .entry(m.client_id.clone())
                .or_insert(ClientAggregate {
                    qos: QoS::AtMostOnce,
                    retain_as_published: false,
                    subscription_ids: SmallVec::new(),
                });
            if m.options.qos > entry.qos {
                entry.qos = m.options.qos;
            }
            if m.options.retain_as_published {
                entry.retain_as_published = true;
            }
            if let Some(id) = m.subscription_id {
                if !entry.subscription_ids.contains(&id) {
                    entry.subscription_ids.push(id);
                }
            }
        }

        let mut delivered_any = false;
        let mut quota_hit = false;
        let mut store_failed = false;

        for (client_id, aggregate) in per_client {
            let effective_qos = envelope.qos.min(aggregate.qos);
            let mut publish = envelope.to_publish();
            publish.qos = effective_qos;
            // Live deliveries keep RETAIN only for retain-as-published
            // subscribers; retained-on-subscribe deliveries are built
            // elsewhere and always carry it.
            publish.retain = aggregate.retain_as_published && envelope.retain;
            for id in &aggregate.subscription_ids {
                publish.properties.subscription_identifiers.push(*id);
            }

            if let Some(handle) = self.connections.get(&client_id) {
                let delivery = Delivery {
                    publish,
                    queue_seq: None,
                };
                match handle.sender.try_send(Outbound::Deliver(delivery)) {
                    Ok(()) => delivered_any = true,
                    Err(mpsc::error::TrySendError::Full(Outbound::Deliver(delivery))) => {
                        // Connection is draining slower than we produce;
                        // park in the session's pending queue.
                        if let Some(session) = self.sessions.get(&client_id) {
                            let mut s = session.write();
                            s.push_pending(crate::session::PendingDelivery {
                                publish: delivery.publish,
                                queue_seq: None,
                            });
                            delivered_any = true;
                        }
                    }
                    Err(_) => {
                        // Channel closed: connection died between the
                        // connected-check and now; fall through to the
                        // offline path below on the next publish.
                        debug!("connection channel closed for '{client_id}'");
                    }
                }
                continue;
            }

            // Detached subscriber.
            if effective_qos == QoS::AtMostOnce {
                continue;
            }
            let keep = self
                .sessions
                .get(&client_id)
                .map(|session| {
                    let s = session.read();
                    s.state == SessionState::Detached && s.session_expiry_interval > 0
                })
                .unwrap_or(false);
            if !keep {
                continue;
            }
            match self.queues.enqueue(&client_id, &publish).await {
                Ok(EnqueueOutcome::Stored(seq)) => {
                    self.store_health.record_success();
                    trace!("queued seq {seq} for detached '{client_id}'");
                    delivered_any = true;
                }
                Ok(EnqueueOutcome::QuotaExceeded) => {
                    quota_hit = true;
                }
                Err(e) => {
                    warn!("queue write failed for '{client_id}': {e}");
                    self.store_health.record_failure("queue write failure");
                    store_failed = true;
                }
            }
        }

        // Remote fan-out: only client-originated publishes leave this
        // node; a received RemotePublish is never forwarded again.
        if envelope.sender_node == self.node_id {
            let cluster = self.cluster.read().clone();
            if let Some(cluster) = cluster {
                for node in cluster.remote_targets(&envelope.topic) {
                    if node != self.node_id {
                        cluster.forward(&node, envelope);
                        delivered_any = true;
                    }
                }
            }
        }

        if let Some(archive) = &self.archive {
            let record = ArchiveRecord {
                topic: envelope.topic.to_string(),
                payload: envelope.payload.to_vec(),
                qos: envelope.qos as u8,
                retain: envelope.retain,
                sender_node: envelope.sender_node.to_string(),
                sender_client: envelope.sender_client.as_ref().map(|c| c.to_string()),
                archived_at_secs: now_unix_secs(),
            };
            if let Err(e) = archive.append(&record).await {
                warn!("archive append failed for '{}': {e}", envelope.topic);
            }
        }

        self.bus.publish(
            address::CLIENT_MSG,
            BusEvent::MessagePublished {
                topic: envelope.topic.clone(),
                payload: envelope.payload.clone(),
                qos: envelope.qos,
                retain: envelope.retain,
            },
        );

        if store_failed && envelope.qos != QoS::AtMostOnce {
            return RouteOutcome {
                reason: ReasonCode::UnspecifiedError,
            };
        }
        if quota_hit && envelope.qos != QoS::AtMostOnce {
            return RouteOutcome {
                reason: ReasonCode::QuotaExceeded,
            };
        }
        RouteOutcome::success(delivered_any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolVersion, SubscriptionOptions};
    use crate::session::SessionLimits;
    use crate::store::{MemoryBackend, QueueStore};
    use parking_lot::Mutex;

    struct Fixture {
        router: PublishRouter,
        subscriptions: Arc<SubscriptionIndex>,
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionTable>,
        backend: Arc<MemoryBackend>,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let subscriptions = Arc::new(SubscriptionIndex::new());
        let sessions = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionTable::new());
        let queues = Arc::new(OfflineQueues::new(backend.clone(), 4));
        let retained = Arc::new(RetainedMessages::load(backend.clone()).await.unwrap());
        let router = PublishRouter::new(
            Arc::from("n1"),
            subscriptions.clone(),
            sessions.clone(),
            queues,
            connections.clone(),
            retained,
            Some(backend.clone()),
            Arc::new(EventBus::new()),
            StoreHealth::new(),
        );
        Fixture {
            router,
            subscriptions,
            sessions,
            connections,
            backend,
        }
    }

    fn subscribe(fx: &Fixture, client: &str, filter: &str, qos: QoS) {
        fx.subscriptions.subscribe(
            filter,
            Arc::from(client),
            SubscriptionOptions {
                qos,
                ..Default::default()
            },
            None,
        );
    }

    fn connect(fx: &Fixture, client: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        let (session, _) = fx.sessions.attach(
            client,
            ProtocolVersion::V5,
            true,
            SessionLimits::default(),
        );
        let epoch = session.read().epoch;
        fx.connections
            .register(Arc::from(client), ConnectionHandle { sender: tx, epoch });
        rx
    }

    fn detach_with_expiry(fx: &Fixture, client: &str, expiry: u32) {
        let (session, _) = fx.sessions.attach(
            client,
            ProtocolVersion::V5,
            false,
            SessionLimits::default(),
        );
        let mut s = session.write();
        s.session_expiry_interval = expiry;
        s.detach();
    }

    fn envelope(fx: &Fixture, sender: Option<&str>, topic: &str, qos: QoS) -> Envelope {
        Envelope {
            topic: Arc::from(topic),
            payload: Bytes::from_static(b"payload"),
            qos,
            retain: false,
            dup: false,
            properties: Properties::default(),
            arrival: Instant::now(),
            sender_node: fx.router.node_id().clone(),
            sender_client: sender.map(Arc::from),
        }
    }

    fn expect_delivery(rx: &mut mpsc::Receiver<Outbound>) -> Delivery {
        match rx.try_recv().expect("expected a delivery") {
            Outbound::Deliver(d) => d,
            other => panic!("unexpected outbound {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivers_to_attached_subscriber() {
        let fx = fixture().await;
        subscribe(&fx, "c1", "a/+", QoS::AtLeastOnce);
        let mut rx = connect(&fx, "c1");

        let outcome = fx.router.route(&envelope(&fx, Some("p"), "a/b", QoS::AtLeastOnce)).await;
        assert_eq!(outcome.reason, ReasonCode::Success);

        let delivery = expect_delivery(&mut rx);
        assert_eq!(delivery.publish.topic.as_ref(), "a/b");
        assert_eq!(delivery.publish.qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn one_delivery_for_overlapping_filters() {
        let fx = fixture().await;
        fx.subscriptions.subscribe(
            "a/#",
            Arc::from("c1"),
            SubscriptionOptions {
                qos: QoS::AtMostOnce,
                ..Default::default()
            },
            Some(1),
        );
        fx.subscriptions.subscribe(
            "a/+",
            Arc::from("c1"),
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                ..Default::default()
            },
            Some(2),
        );
        let mut rx = connect(&fx, "c1");

        fx.router.route(&envelope(&fx, Some("p"), "a/b", QoS::ExactlyOnce)).await;

        let delivery = expect_delivery(&mut rx);
        // Exactly one PUBLISH, max QoS of the matches, both subscription ids.
        assert_eq!(delivery.publish.qos, QoS::AtLeastOnce);
        let mut ids = delivery.publish.properties.subscription_identifiers.clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_local_suppresses_echo() {
        let fx = fixture().await;
        fx.subscriptions.subscribe(
            "t",
            Arc::from("c1"),
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                no_local: true,
                ..Default::default()
            },
            None,
        );
        let mut rx = connect(&fx, "c1");

        fx.router.route(&envelope(&fx, Some("c1"), "t", QoS::AtLeastOnce)).await;
        assert!(rx.try_recv().is_err());

        // Other senders still reach it.
        fx.router.route(&envelope(&fx, Some("c2"), "t", QoS::AtLeastOnce)).await;
        expect_delivery(&mut rx);
    }

    #[tokio::test]
    async fn retain_as_published_controls_retain_flag() {
        let fx = fixture().await;
        fx.subscriptions.subscribe(
            "rap",
            Arc::from("c1"),
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                retain_as_published: true,
                ..Default::default()
            },
            None,
        );
        subscribe(&fx, "c2", "rap", QoS::AtLeastOnce);
        let mut rx1 = connect(&fx, "c1");
        let mut rx2 = connect(&fx, "c2");

        let mut env = envelope(&fx, Some("p"), "rap", QoS::AtLeastOnce);
        env.retain = true;
        fx.router.route(&env).await;

        assert!(expect_delivery(&mut rx1).publish.retain);
        assert!(!expect_delivery(&mut rx2).publish.retain);
    }

    #[tokio::test]
    async fn queues_for_detached_and_drops_qos0() {
        let fx = fixture().await;
        subscribe(&fx, "offline", "q/#", QoS::ExactlyOnce);
        detach_with_expiry(&fx, "offline", 3600);

        // QoS 0 to a detached session: dropped.
        let outcome = fx.router.route(&envelope(&fx, Some("p"), "q/a", QoS::AtMostOnce)).await;
        assert_eq!(outcome.reason, ReasonCode::NoMatchingSubscribers);

        // QoS 1 is durably queued.
        let outcome = fx.router.route(&envelope(&fx, Some("p"), "q/a", QoS::AtLeastOnce)).await;
        assert_eq!(outcome.reason, ReasonCode::Success);
        let queued = fx.backend.read_from("offline", 0, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].1.qos, 1);
    }

    #[tokio::test]
    async fn queue_quota_nacks_publisher() {
        let fx = fixture().await;
        subscribe(&fx, "slow", "t", QoS::AtLeastOnce);
        detach_with_expiry(&fx, "slow", 3600);

        // Quota in the fixture is 4.
        for _ in 0..4 {
            let outcome = fx.router.route(&envelope(&fx, Some("p"), "t", QoS::AtLeastOnce)).await;
            assert_eq!(outcome.reason, ReasonCode::Success);
        }
        let outcome = fx.router.route(&envelope(&fx, Some("p"), "t", QoS::AtLeastOnce)).await;
        assert_eq!(outcome.reason, ReasonCode::QuotaExceeded);
    }

    #[tokio::test]
    async fn expired_envelope_dropped_silently() {
        let fx = fixture().await;
        subscribe(&fx, "c1", "t", QoS::AtLeastOnce);
        let mut rx = connect(&fx, "c1");

        let mut env = envelope(&fx, Some("p"), "t", QoS::AtLeastOnce);
        env.properties.message_expiry_interval = Some(1);
        env.arrival = Instant::now() - Duration::from_secs(2);
        let outcome = fx.router.route(&env).await;
        assert_eq!(outcome.reason, ReasonCode::NoMatchingSubscribers);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unhealthy_store_nacks_qos1_keeps_qos0() {
        let fx = fixture().await;
        subscribe(&fx, "c1", "t", QoS::ExactlyOnce);
        let mut rx = connect(&fx, "c1");

        fx.router.store_health.record_failure("test");
        let outcome = fx.router.route(&envelope(&fx, Some("p"), "t", QoS::AtLeastOnce)).await;
        assert_eq!(outcome.reason, ReasonCode::UnspecifiedError);
        assert!(rx.try_recv().is_err());

        // QoS 0 continues.
        let outcome = fx.router.route(&envelope(&fx, Some("p"), "t", QoS::AtMostOnce)).await;
        assert_eq!(outcome.reason, ReasonCode::Success);
        expect_delivery(&mut rx);
    }

    #[tokio::test]
    async fn remote_targets_receive_one_copy() {
        struct StubFanout {
            forwards: Mutex<Vec<(Arc<str>, Arc<str>)>>,
        }
        impl RemoteFanout for StubFanout {
            fn remote_targets(&self, _topic: &str) -> Vec<Arc<str>> {
                vec![Arc::from("n2"), Arc::from("n3"), Arc::from("n1")]
            }
            fn forward(&self, node: &Arc<str>, envelope: &Envelope) {
                self.forwards
                    .lock()
                    .push((node.clone(), envelope.topic.clone()));
            }
        }

        let fx = fixture().await;
        let stub = Arc::new(StubFanout {
            forwards: Mutex::new(Vec::new()),
        });
        fx.router.set_cluster(stub.clone());

        fx.router.route(&envelope(&fx, Some("p"), "lab/temp", QoS::AtLeastOnce)).await;
        let forwards = stub.forwards.lock();
        // Own node id filtered out, each remote exactly once.
        assert_eq!(forwards.len(), 2);
        assert!(forwards.iter().all(|(_, t)| t.as_ref() == "lab/temp"));

        // Remote-originated envelopes are not forwarded again.
        drop(forwards);
        let mut env = envelope(&fx, None, "lab/temp", QoS::AtLeastOnce);
        env.sender_node = Arc::from("n2");
        fx.router.route(&env).await;
        assert_eq!(stub.forwards.lock().len(), 2);
    }

    #[tokio::test]
    async fn remote_publish_delivers_locally_with_origin_preserved() {
        let fx = fixture().await;
        subscribe(&fx, "c1", "lab/#", QoS::AtLeastOnce);
        let mut rx = connect(&fx, "c1");

        let mut env = envelope(&fx, None, "lab/temp", QoS::AtLeastOnce);
        env.sender_node = Arc::from("n2");
        env.sender_client = Some(Arc::from("c2"));
        let outcome = fx.router.route(&env).await;
        assert_eq!(outcome.reason, ReasonCode::Success);

        let delivery = expect_delivery(&mut rx);
        assert_eq!(delivery.publish.topic.as_ref(), "lab/temp");
        assert!(rx.try_recv().is_err());

        // Origin node survives into the archive.
        let archived = fx.backend.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].sender_node, "n2");
        assert_eq!(archived[0].sender_client.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn archive_records_envelope() {
        let fx = fixture().await;
        fx.router.route(&envelope(&fx, Some("pub"), "arch/t", QoS::AtLeastOnce)).await;
        let archived = fx.backend.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].topic, "arch/t");
        assert_eq!(archived[0].sender_node, "n1");
        assert_eq!(archived[0].sender_client.as_deref(), Some("pub"));
    }

    #[tokio::test]
    async fn full_channel_parks_in_pending_queue() {
        let fx = fixture().await;
        subscribe(&fx, "c1", "t", QoS::AtLeastOnce);

        let (tx, _rx) = mpsc::channel(1);
        let (session, _) =
            fx.sessions
                .attach("c1", ProtocolVersion::V5, true, SessionLimits::default());
        let epoch = session.read().epoch;
        fx.connections
            .register(Arc::from("c1"), ConnectionHandle { sender: tx, epoch });

        // First fills the channel, second overflows into the session.
        fx.router.route(&envelope(&fx, Some("p"), "t", QoS::AtLeastOnce)).await;
        fx.router.route(&envelope(&fx, Some("p"), "t", QoS::AtLeastOnce)).await;
        assert_eq!(session.read().pending_len(), 1);
    }
}
