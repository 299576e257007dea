//! Cluster coordination
//!
//! Keeps the two replicated maps (client ownership, filter placement) in
//! sync across nodes and forwards publishes to remote subscribers.
//!
//! Two planes:
//! - **Gossip (UDP via chitchat)**: node discovery and liveness; each
//!   node advertises its peer TCP address in the gossip key/value state.
//! - **Peer TCP**: framed bincode messages for map deltas, remote
//!   publishes and session takeover. Every node dials every other node;
//!   the dialing half sends, the listening half receives.
//!
//! A received `RemotePublish` is delivered locally and never forwarded
//! again; only client-originated publishes fan out, so one publish
//! reaches each node at most once.

mod maps;
mod peer;
mod protocol;

pub use maps::{ClusterMaps, LogicalClock};
pub use peer::{ClusterPeer, PeerStatus};
pub use protocol::{
    frame_message, read_frame_length, ClusterMessage, LogicalTimestamp, WireEnvelope,
    CLUSTER_PROTOCOL_VERSION,
};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::bus::{address, BusEvent, EventBus};
use crate::config::ClusterConfig;
use crate::protocol::{Properties, QoS, ReasonCode};
use crate::router::{Envelope, PublishRouter, RemoteFanout};
use crate::topic::SubscriptionIndex;

/// Gossip key carrying the peer TCP address of a node.
const KEY_PEER_ADDR: &str = "peer_addr";
/// Gossip key carrying a node's filter list as a JSON array. Deltas go
/// over the peer links; the gossip copy re-converges nodes that missed
/// them (reconnect, partition heal).
const KEY_FILTERS: &str = "filters";

/// The cluster plane of one broker node.
pub struct ClusterCoordinator {
    node_id: Arc<str>,
    config: ClusterConfig,
    maps: Arc<ClusterMaps>,
    peers: DashMap<Arc<str>, Arc<ClusterPeer>>,
    router: Arc<PublishRouter>,
    subscriptions: Arc<SubscriptionIndex>,
    bus: Arc<EventBus>,
    chitchat: ChitchatHandle,
}

impl ClusterCoordinator {
    /// Join the gossip mesh. The peer listener and watcher start in
    /// `start`.
    pub async fn new(
        config: ClusterConfig,
        router: Arc<PublishRouter>,
        subscriptions: Arc<SubscriptionIndex>,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let node_id: Arc<str> = config.node_id().into();
        let gossip_advertise = config.gossip_advertise_addr();
        let peer_advertise = config.peer_advertise_addr();

        info!(
            "joining cluster as '{}' (gossip {}, peer {})",
            node_id, gossip_advertise, peer_advertise
        );

        let chitchat_id = ChitchatId::new(node_id.to_string(), 0, gossip_advertise);
        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_name.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config: FailureDetectorConfig {
                phi_threshold: 8.0,
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };
        let initial_kvs = vec![
            (KEY_PEER_ADDR.to_string(), peer_advertise.to_string()),
            (KEY_FILTERS.to_string(), "[]".to_string()),
        ];
        let chitchat = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport).await?;

        Ok(Arc::new(Self {
            node_id: node_id.clone(),
            config,
            maps: Arc::new(ClusterMaps::new(node_id)),
            peers: DashMap::new(),
            router,
            subscriptions,
            bus,
            chitchat,
        }))
    }

    pub fn node_id(&self) -> &Arc<str> {
        &self.node_id
    }

    pub fn maps(&self) -> &Arc<ClusterMaps> {
        &self.maps
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.value().status() == PeerStatus::Connected)
            .count()
    }

    /// Bind the peer listener and start the gossip watcher.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.peer_addr).await?;
        info!("cluster peer listener on {}", self.config.peer_addr);

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("incoming cluster link from {addr}");
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            if let Err(e) = coordinator.serve_peer_link(stream).await {
                                debug!("cluster link from {addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => error!("cluster listener accept failed: {e}"),
                }
            }
        });

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.gossip_watcher().await;
        });

        Ok(())
    }

    /// Leave the cluster: Goodbye on every link.
    pub fn stop(&self) {
        for peer in self.peers.iter() {
            peer.value().stop();
        }
    }

    // ------------------------------------------------------------------
    // Local event entry points (called by the broker)
    // ------------------------------------------------------------------

    /// A client attached locally. Updates the ownership map, announces it,
    /// and, when another node owned the session, broadcasts the takeover
    /// so the old owner disconnects the stale attachment.
    pub fn client_attached(&self, client_id: &str) {
        let previous = self.maps.owner_of(client_id);
        let ts = self.maps.clock().next();
        self.maps
            .apply_client_attached(client_id, &self.node_id, ts.clone());

        if let Some(old_node) = previous.filter(|n| n.as_ref() != self.node_id.as_ref()) {
            info!("taking over session '{client_id}' from node '{old_node}'");
            self.broadcast(ClusterMessage::SessionTakeover {
                client_id: client_id.to_string(),
                new_node_id: self.node_id.to_string(),
                ts: ts.clone(),
            });
        }
        self.broadcast(ClusterMessage::ClientAttached {
            client_id: client_id.to_string(),
            node_id: self.node_id.to_string(),
            ts,
        });
        self.bus.publish(
            address::CLUSTER_CLIENT_STATUS,
            BusEvent::ClientStatus {
                client_id: Arc::from(client_id),
                online: true,
            },
        );
    }

    /// A client detached locally.
    pub fn client_detached(&self, client_id: &str) {
        let ts = self.maps.clock().next();
        self.maps
            .apply_client_detached(client_id, &self.node_id, ts.clone());
        self.broadcast(ClusterMessage::ClientDetached {
            client_id: client_id.to_string(),
            node_id: self.node_id.to_string(),
            ts,
        });
        self.bus.publish(
            address::CLUSTER_CLIENT_STATUS,
            BusEvent::ClientStatus {
                client_id: Arc::from(client_id),
                online: false,
            },
        );
    }

    /// First local subscription appeared for `filter`.
    pub fn subscription_added(&self, filter: &str) {
        self.broadcast(ClusterMessage::SubscriptionAdd {
            node_id: self.node_id.to_string(),
            filter: filter.to_string(),
        });
        self.refresh_gossip_filters();
    }

    /// Last local subscription for `filter` went away.
    pub fn subscription_removed(&self, filter: &str) {
        self.broadcast(ClusterMessage::SubscriptionDelete {
            node_id: self.node_id.to_string(),
            filter: filter.to_string(),
        });
        self.refresh_gossip_filters();
    }

    /// Mirror the current filter set into our gossip state.
    fn refresh_gossip_filters(&self) {
        let json = serde_json::to_string(&self.subscriptions.filters())
            .unwrap_or_else(|_| "[]".to_string());
        let chitchat = self.chitchat.chitchat();
        tokio::spawn(async move {
            let mut cc = chitchat.lock().await;
            cc.self_node_state().set(KEY_FILTERS.to_string(), json);
        });
    }

    fn broadcast(&self, message: ClusterMessage) {
        for peer in self.peers.iter() {
            peer.value().send(message.clone());
        }
    }

    // ------------------------------------------------------------------
    // Inbound listener half
    // ------------------------------------------------------------------

    async fn serve_peer_link(
        self: &Arc<Self>,
        mut stream: tokio::net::TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        stream.set_nodelay(true)?;
        let mut pending: Vec<u8> = Vec::new();
        let mut read_buf = vec![0u8; 16 * 1024];

        // Handshake first.
        let peer_node: Arc<str> = loop {
            let n = stream.read(&mut read_buf).await?;
            if n == 0 {
                return Err("link closed before Hello".into());
            }
            pending.extend_from_slice(&read_buf[..n]);
            if let Some(len) = read_frame_length(&pending) {
                if pending.len() < 4 + len {
                    continue;
                }
                let msg = ClusterMessage::decode(&pending[4..4 + len])?;
                pending.drain(..4 + len);
                match msg {
                    ClusterMessage::Hello { node_id, version } => {
                        if version != CLUSTER_PROTOCOL_VERSION {
                            return Err(format!(
                                "peer '{node_id}' protocol version {version} unsupported"
                            )
                            .into());
                        }
                        break node_id.into();
                    }
                    other => {
                        return Err(format!("expected Hello, got {}", other.type_name()).into())
                    }
                }
            }
        };
        info!("incoming cluster link from '{peer_node}'");

        let ack = ClusterMessage::HelloAck {
            node_id: self.node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        stream.write_all(&frame_message(&ack)?).await?;

        // Tell the new peer which filters we host.
        let sync = ClusterMessage::SubscriptionSync {
            node_id: self.node_id.to_string(),
            filters: self.subscriptions.filters(),
        };
        stream.write_all(&frame_message(&sync)?).await?;

        loop {
            while let Some(len) = read_frame_length(&pending) {
                if pending.len() < 4 + len {
                    break;
                }
                let msg = ClusterMessage::decode(&pending[4..4 + len])?;
                pending.drain(..4 + len);
                match msg {
                    ClusterMessage::Ping => {
                        stream
                            .write_all(&frame_message(&ClusterMessage::Pong)?)
                            .await?;
                    }
                    ClusterMessage::Goodbye => {
                        info!("cluster peer '{peer_node}' left");
                        return Ok(());
                    }
                    other => self.handle_peer_message(&peer_node, other).await,
                }
            }

            let n = stream.read(&mut read_buf).await?;
            if n == 0 {
                info!("cluster peer '{peer_node}' disconnected");
                return Ok(());
            }
            pending.extend_from_slice(&read_buf[..n]);
        }
    }

    async fn handle_peer_message(self: &Arc<Self>, peer_node: &Arc<str>, msg: ClusterMessage) {
        match msg {
            ClusterMessage::SubscriptionAdd { node_id, filter } => {
                debug!("cluster: node '{node_id}' hosts filter '{filter}'");
                self.maps.add_filter(&node_id, &filter);
                self.bus.publish(
                    address::CLUSTER_SUBSCRIPTION_ADD,
                    BusEvent::SubscriptionAdded { filter },
                );
            }
            ClusterMessage::SubscriptionDelete { node_id, filter } => {
                self.maps.remove_filter(&node_id, &filter);
                self.bus.publish(
                    address::CLUSTER_SUBSCRIPTION_DELETE,
                    BusEvent::SubscriptionRemoved { filter },
                );
            }
            ClusterMessage::SubscriptionSync { node_id, filters } => {
                debug!(
                    "cluster: syncing {} filters from node '{node_id}'",
                    filters.len()
                );
                self.maps.sync_filters(&node_id, &filters);
            }
            ClusterMessage::ClientAttached {
                client_id,
                node_id,
                ts,
            } => {
                self.maps.apply_client_attached(&client_id, &node_id, ts);
            }
            ClusterMessage::ClientDetached {
                client_id,
                node_id,
                ts,
            } => {
                self.maps.apply_client_detached(&client_id, &node_id, ts);
            }
            ClusterMessage::SessionTakeover {
                client_id,
                new_node_id,
                ts,
            } => {
                self.maps
                    .apply_client_attached(&client_id, &new_node_id, ts);
                // If the stale attachment is ours, kick it without a will.
                if new_node_id != self.node_id.as_ref()
                    && self
                        .router
                        .connections()
                        .request_disconnect(&client_id, ReasonCode::SessionTakenOver)
                {
                    info!("session '{client_id}' taken over by node '{new_node_id}'");
                }
            }
            ClusterMessage::RemotePublish {
                envelope,
                target_clients: _,
            } => {
                let envelope = envelope_from_wire(envelope);
                debug!(
                    "cluster: remote publish '{}' from node '{}'",
                    envelope.topic, envelope.sender_node
                );
                // The router never re-forwards an envelope whose
                // sender_node is not ours, so this cannot loop.
                let _ = self.router.route(&envelope).await;
            }
            other => {
                warn!(
                    "unexpected cluster message {} from '{peer_node}'",
                    other.type_name()
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Gossip watcher: discover and retire peers
    // ------------------------------------------------------------------

    async fn gossip_watcher(self: Arc<Self>) {
        let chitchat = self.chitchat.chitchat();
        let mut known: HashSet<String> = HashSet::new();

        loop {
            tokio::time::sleep(self.config.gossip_interval).await;

            let state = {
                let cc = chitchat.lock().await;
                cc.state_snapshot()
            };

            let mut live: HashSet<String> = HashSet::new();
            for node_state in &state.node_states {
                let node_id = node_state.chitchat_id().node_id.clone();
                if node_id == self.node_id.as_ref() {
                    continue;
                }
                live.insert(node_id.clone());

                if known.contains(&node_id) {
                    // Known peer: re-sync its filter set from gossip so
                    // deltas lost on a broken link still converge.
                    if let Some(filters) = node_state
                        .get(KEY_FILTERS)
                        .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
                    {
                        self.maps.sync_filters(&node_id, &filters);
                    }
                    continue;
                }
                let Some(peer_addr) = node_state
                    .get(KEY_PEER_ADDR)
                    .and_then(|s| s.parse::<SocketAddr>().ok())
                else {
                    continue;
                };
                known.insert(node_id.clone());
                info!("discovered cluster peer '{node_id}' at {peer_addr}");

                let subscriptions = self.subscriptions.clone();
                let local_id = self.node_id.clone();
                let sync_id = local_id.to_string();
                let peer = ClusterPeer::spawn(
                    Arc::from(node_id.as_str()),
                    peer_addr,
                    local_id,
                    move || {
                        vec![ClusterMessage::SubscriptionSync {
                            node_id: sync_id.clone(),
                            filters: subscriptions.filters(),
                        }]
                    },
                );
                self.peers.insert(Arc::from(node_id.as_str()), peer);
            }

            // Retire peers that fell out of the gossip view.
            let dead: Vec<String> = known.iter().filter(|n| !live.contains(*n)).cloned().collect();
            for node_id in dead {
                info!("cluster peer '{node_id}' is gone");
                known.remove(&node_id);
                if let Some((_, peer)) = self.peers.remove(node_id.as_str()) {
                    peer.stop();
                }
                self.maps.forget_node(&node_id);
            }
        }
    }
}

impl RemoteFanout for ClusterCoordinator {
    fn remote_targets(&self, topic: &str) -> Vec<Arc<str>> {
        self.maps.nodes_for_topic(topic)
    }

    fn forward(&self, node: &Arc<str>, envelope: &Envelope) {
        let Some(peer) = self.peers.get(node) else {
            debug!("no link to node '{node}', dropping remote publish");
            return;
        };

        // Re-base the expiry countdown; a message that died in transit is
        // not worth a frame.
        let expiry_remaining = match envelope.properties.message_expiry_interval {
            Some(interval) => {
                let spent = envelope.arrival.elapsed().as_secs() as u32;
                let remaining = interval.saturating_sub(spent);
                if remaining == 0 {
                    return;
                }
                Some(remaining)
            }
            None => None,
        };

        let message = ClusterMessage::RemotePublish {
            envelope: WireEnvelope {
                topic: envelope.topic.to_string(),
                payload: envelope.payload.to_vec(),
                qos: envelope.qos as u8,
                retain: envelope.retain,
                expiry_remaining_secs: expiry_remaining,
                content_type: envelope.properties.content_type.clone(),
                response_topic: envelope.properties.response_topic.clone(),
                correlation_data: envelope
                    .properties
                    .correlation_data
                    .as_ref()
                    .map(|d| d.to_vec()),
                user_properties: envelope.properties.user_properties.clone(),
                payload_format_indicator: envelope.properties.payload_format_indicator,
                sender_node: envelope.sender_node.to_string(),
                sender_client: envelope.sender_client.as_ref().map(|c| c.to_string()),
            },
            target_clients: None,
        };
        peer.value().send(message);
    }
}

/// Rebuild a router envelope from its wire form, restarting the expiry
/// clock on this node.
pub fn envelope_from_wire(wire: WireEnvelope) -> Envelope {
    let properties = Properties {
        message_expiry_interval: wire.expiry_remaining_secs,
        content_type: wire.content_type,
        response_topic: wire.response_topic,
        correlation_data: wire.correlation_data.map(Bytes::from),
        user_properties: wire.user_properties,
        payload_format_indicator: wire.payload_format_indicator,
        ..Default::default()
    };
    Envelope {
        topic: Arc::from(wire.topic),
        payload: Bytes::from(wire.payload),
        qos: QoS::from_u8(wire.qos).unwrap_or_default(),
        retain: wire.retain,
        dup: false,
        properties,
        arrival: Instant::now(),
        sender_node: Arc::from(wire.sender_node),
        sender_client: wire.sender_client.map(Arc::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_envelope_round_trips_into_router_envelope() {
        let wire = WireEnvelope {
            topic: "lab/temp".into(),
            payload: b"t".to_vec(),
            qos: 1,
            retain: true,
            expiry_remaining_secs: Some(12),
            content_type: Some("text/plain".into()),
            response_topic: None,
            correlation_data: Some(vec![1, 2]),
            user_properties: vec![("a".into(), "b".into())],
            payload_format_indicator: Some(1),
            sender_node: "n2".into(),
            sender_client: Some("c9".into()),
        };
        let envelope = envelope_from_wire(wire);
        assert_eq!(envelope.topic.as_ref(), "lab/temp");
        assert_eq!(envelope.qos, QoS::AtLeastOnce);
        assert!(envelope.retain);
        assert_eq!(envelope.properties.message_expiry_interval, Some(12));
        assert_eq!(envelope.sender_node.as_ref(), "n2");
        assert_eq!(envelope.sender_client.as_deref(), Some("c9"));
    }
}
