//! Broker core
//!
//! Owns the component graph (session registry, subscription index,
//! retained cache, offline queues, router, stores, optional cluster),
//! binds the listeners, and runs the background sweepers. Every accepted
//! connection gets its own task; connections share no mutable state
//! except through the router and the stores.

mod connection;

pub use connection::{Connection, ConnectionError};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bus::{address, BusEvent, EventBus};
use crate::cluster::ClusterCoordinator;
use crate::config::{Config, TlsSettings};
use crate::hooks::{AllowAll, Hooks};
use crate::protocol::{QoS, ReasonCode};
use crate::queue::OfflineQueues;
use crate::retained::RetainedMessages;
use crate::router::{ConnectionTable, PublishRouter};
use crate::session::{Session, SessionLimits, SessionRegistry};
use crate::store::{
    ArchiveStore, QueueStore, RetainedStore, SessionStore, StoreError, StoreHealth,
};
use crate::topic::SubscriptionIndex;
use crate::transport::{build_tls_acceptor, WsStream};

/// Flattened runtime settings for the broker core.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub tls_bind_addr: Option<SocketAddr>,
    pub ws_bind_addr: Option<SocketAddr>,
    pub wss_bind_addr: Option<SocketAddr>,
    pub ws_path: String,
    pub tls: Option<TlsSettings>,
    pub max_connections: usize,
    pub max_packet_size: usize,
    pub default_keep_alive: u16,
    pub max_keep_alive: u16,
    pub expiry_check_interval: Duration,
    pub retained_sweep_interval: Duration,
    pub receive_maximum: u16,
    pub max_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    pub shared_subscriptions: bool,
    pub max_topic_aliases: u16,
    pub max_inflight: u16,
    pub max_pending: usize,
    pub max_awaiting_rel: usize,
    pub queue_quota: usize,
    pub retry_interval: Duration,
    pub outbound_channel_capacity: usize,
    pub drain_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BrokerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.server.bind,
            tls_bind_addr: config.server.tls_bind,
            ws_bind_addr: config.server.ws_bind,
            wss_bind_addr: config.server.wss_bind,
            ws_path: config.server.ws_path.clone(),
            tls: config.server.tls.clone(),
            max_connections: config.limits.max_connections,
            max_packet_size: config.limits.max_packet_size,
            default_keep_alive: config.session.default_keep_alive,
            max_keep_alive: config.session.max_keep_alive,
            expiry_check_interval: config.session.expiry_check_interval,
            retained_sweep_interval: config.storage.retained_sweep_interval,
            receive_maximum: config.mqtt.receive_maximum,
            max_qos: QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: config.mqtt.retain_available,
            wildcard_subscriptions: config.mqtt.wildcard_subscriptions,
            subscription_identifiers: config.mqtt.subscription_identifiers,
            shared_subscriptions: config.mqtt.shared_subscriptions,
            max_topic_aliases: config.session.max_topic_aliases,
            max_inflight: config.limits.max_inflight,
            max_pending: config.limits.max_pending,
            max_awaiting_rel: config.limits.max_awaiting_rel,
            queue_quota: config.limits.queue_quota,
            retry_interval: config.limits.retry_interval,
            outbound_channel_capacity: config.limits.outbound_channel_capacity,
            drain_timeout: config.server.drain_timeout,
        }
    }

    pub(crate) fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_inflight: self.max_inflight,
            max_pending: self.max_pending,
            max_awaiting_rel: self.max_awaiting_rel,
        }
    }
}

/// The stores a broker runs on. The same backend object may serve several
/// roles (the fjall and memory backends implement all of them).
#[derive(Clone)]
pub struct Stores {
    pub retained: Arc<dyn RetainedStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub queues: Arc<dyn QueueStore>,
    pub archive: Option<Arc<dyn ArchiveStore>>,
}

/// The broker.
pub struct Broker {
    config: BrokerConfig,
    node_id: Arc<str>,
    sessions: Arc<SessionRegistry>,
    subscriptions: Arc<SubscriptionIndex>,
    retained: Arc<RetainedMessages>,
    queues: Arc<OfflineQueues>,
    connections: Arc<ConnectionTable>,
    router: Arc<PublishRouter>,
    session_store: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
    hooks: Arc<dyn Hooks>,
    cluster: parking_lot::RwLock<Option<Arc<ClusterCoordinator>>>,
    shutdown: broadcast::Sender<()>,
    store_health: Arc<StoreHealth>,
}

impl Broker {
    /// Build the component graph and rehydrate persisted state: retained
    /// messages into the matcher, session records into the registry and
    /// the subscription index.
    pub async fn new(
        config: BrokerConfig,
        node_id: &str,
        stores: Stores,
        hooks: Arc<dyn Hooks>,
    ) -> Result<Arc<Self>, StoreError> {
        let node_id: Arc<str> = node_id.into();
        let sessions = Arc::new(SessionRegistry::new());
        let subscriptions = Arc::new(SubscriptionIndex::new());
        let connections = Arc::new(ConnectionTable::new());
        let bus = Arc::new(EventBus::new());
        let store_health = StoreHealth::new();

        let retained = Arc::new(RetainedMessages::load(stores.retained.clone()).await?);
        let queues = Arc::new(OfflineQueues::new(stores.queues.clone(), config.queue_quota));

        // Rehydrate detached sessions and their subscriptions.
        let records = stores.sessions.load_all().await?;
        let mut restored = 0usize;
        for record in &records {
            let session = Session::from_record(record);
            if session.is_expired() {
                stores.sessions.delete(&record.client_id).await?;
                stores.queues.purge(&record.client_id).await?;
                continue;
            }
            for sub in session.subscriptions.values() {
                subscriptions.subscribe(
                    &sub.filter,
                    session.client_id.clone(),
                    sub.options,
                    sub.subscription_id,
                );
            }
            sessions.restore(session);
            restored += 1;
        }
        if restored > 0 {
            info!("rehydrated {restored} detached sessions");
        }

        let router = Arc::new(PublishRouter::new(
            node_id.clone(),
            subscriptions.clone(),
            sessions.clone(),
            queues.clone(),
            connections.clone(),
            retained.clone(),
            stores.archive.clone(),
            bus.clone(),
            store_health.clone(),
        ));

        let (shutdown, _) = broadcast::channel(4);

        Ok(Arc::new(Self {
            config,
            node_id,
            sessions,
            subscriptions,
            retained,
            queues,
            connections,
            router,
            session_store: stores.sessions,
            bus,
            hooks,
            cluster: parking_lot::RwLock::new(None),
            shutdown,
            store_health,
        }))
    }

    /// Convenience constructor with allow-all hooks.
    pub async fn with_stores(
        config: BrokerConfig,
        node_id: &str,
        stores: Stores,
    ) -> Result<Arc<Self>, StoreError> {
        Self::new(config, node_id, stores, Arc::new(AllowAll)).await
    }

    pub fn node_id(&self) -> &Arc<str> {
        &self.node_id
    }

    pub fn router(&self) -> &Arc<PublishRouter> {
        &self.router
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionIndex> {
        &self.subscriptions
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Attach the cluster coordinator and wire it into the router.
    pub fn set_cluster(&self, cluster: Arc<ClusterCoordinator>) {
        self.router.set_cluster(cluster.clone());
        *self.cluster.write() = Some(cluster);
    }

    pub fn cluster(&self) -> Option<Arc<ClusterCoordinator>> {
        self.cluster.read().clone()
    }

    /// Bind all configured listeners and serve until shutdown. Bind
    /// failures surface immediately (exit code 2 at the CLI).
    pub async fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        let tls_acceptor = match &self.config.tls {
            Some(settings) => Some(
                build_tls_acceptor(settings)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?,
            ),
            None => None,
        };

        if let Some(addr) = self.config.tls_bind_addr {
            let tls_listener = TcpListener::bind(addr).await?;
            let acceptor = tls_acceptor.clone().expect("validated by config");
            info!("MQTT/TLS listening on {addr}");
            let broker = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match tls_listener.accept().await {
                        Ok((stream, peer)) => {
                            let broker = Arc::clone(&broker);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => broker.serve_stream(tls_stream, peer).await,
                                    Err(e) => debug!("TLS handshake from {peer} failed: {e}"),
                                }
                            });
                        }
                        Err(e) => error!("TLS accept failed: {e}"),
                    }
                }
            });
        }

        if let Some(addr) = self.config.ws_bind_addr {
            let ws_listener = TcpListener::bind(addr).await?;
            info!(
                "MQTT/WebSocket listening on {addr} (path {})",
                self.config.ws_path
            );
            let broker = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match ws_listener.accept().await {
                        Ok((stream, peer)) => {
                            let broker = Arc::clone(&broker);
                            tokio::spawn(async move {
                                match WsStream::accept(stream, &broker.config.ws_path).await {
                                    Ok(ws) => broker.serve_stream(ws, peer).await,
                                    Err(e) => {
                                        debug!("WebSocket handshake from {peer} failed: {e}")
                                    }
                                }
                            });
                        }
                        Err(e) => error!("WebSocket accept failed: {e}"),
                    }
                }
            });
        }

        if let Some(addr) = self.config.wss_bind_addr {
            let wss_listener = TcpListener::bind(addr).await?;
            let acceptor = tls_acceptor.clone().expect("validated by config");
            info!("MQTT/WSS listening on {addr}");
            let broker = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match wss_listener.accept().await {
                        Ok((stream, peer)) => {
                            let broker = Arc::clone(&broker);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                let tls_stream = match acceptor.accept(stream).await {
                                    Ok(s) => s,
                                    Err(e) => {
                                        debug!("TLS handshake from {peer} failed: {e}");
                                        return;
                                    }
                                };
                                match WsStream::accept(tls_stream, &broker.config.ws_path).await {
                                    Ok(ws) => broker.serve_stream(ws, peer).await,
                                    Err(e) => {
                                        debug!("WSS handshake from {peer} failed: {e}")
                                    }
                                }
                            });
                        }
                        Err(e) => error!("WSS accept failed: {e}"),
                    }
                }
            });
        }

        self.spawn_sweepers();

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let broker = Arc::clone(self);
                            tokio::spawn(async move {
                                broker.serve_stream(stream, peer).await;
                            });
                        }
                        Err(e) => error!("accept failed: {e}"),
                    }
                }
                _ = wait_shutdown(&mut shutdown_rx) => {
                    info!("stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Run one connection to completion.
    async fn serve_stream<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        if self.connections.len() >= self.config.max_connections {
            debug!("connection limit reached, refusing {peer}");
            return;
        }
        let shutdown_rx = self.shutdown.subscribe();
        let mut connection = Connection::new(stream, peer, Arc::clone(&self));
        if let Err(e) = connection.run(shutdown_rx).await {
            debug!("connection {peer} ended: {e}");
        }
    }

    fn spawn_sweepers(self: &Arc<Self>) {
        // Session expiry sweeper: reap expired sessions, then checkpoint
        // the surviving persistent ones so a crash loses at most one
        // interval of churn.
        let broker = Arc::clone(self);
        let interval = self.config.expiry_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut shutdown_rx = broker.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for client_id in broker.sessions.take_expired() {
                            broker.expire_session(&client_id).await;
                        }
                        for session in broker.sessions.iter_sessions() {
                            let (persist, record) = {
                                let s = session.read();
                                (
                                    !s.clean_start && s.session_expiry_interval > 0,
                                    s.to_record(),
                                )
                            };
                            if persist {
                                if let Err(e) = broker.session_store.upsert(&record).await {
                                    warn!(
                                        "session checkpoint for '{}' failed: {e}",
                                        record.client_id
                                    );
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let _ = self
            .retained
            .spawn_sweeper(self.config.retained_sweep_interval);
    }

    /// Destroy everything a session owned once its expiry fires.
    pub(crate) async fn expire_session(&self, client_id: &Arc<str>) {
        info!("session '{client_id}' expired");
        for filter in self.subscriptions.unsubscribe_all(client_id) {
            if let Some(cluster) = self.cluster() {
                cluster.subscription_removed(&filter);
            }
        }
        if let Err(e) = self.queues.purge(client_id).await {
            warn!("queue purge for expired '{client_id}' failed: {e}");
        }
        if let Err(e) = self.session_store.delete(client_id).await {
            warn!("session delete for expired '{client_id}' failed: {e}");
        }
        self.bus.publish(
            &format!("{}.{client_id}", address::CLIENT_CMD),
            BusEvent::ClientStatus {
                client_id: client_id.clone(),
                online: false,
            },
        );
    }

    /// Graceful drain: stop accepting, push DISCONNECT to every client,
    /// give in-flight handshakes a deadline, checkpoint sessions, leave
    /// the cluster.
    pub async fn shutdown(&self) {
        info!("shutting down (drain {:?})", self.config.drain_timeout);
        self.bus.publish(address::SYSTEM_SHUTDOWN, BusEvent::Shutdown);

        // Stop accepting; every connection task sees the broadcast and
        // sends DISCONNECT(ServerShuttingDown) on its own.
        let _ = self.shutdown.send(());
        for client_id in self.connections.client_ids() {
            self.connections
                .request_disconnect(&client_id, ReasonCode::ServerShuttingDown);
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while !self.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Checkpoint surviving session state.
        for session in self.sessions.iter_sessions() {
            let (persist, record) = {
                let s = session.read();
                (
                    !s.clean_start && s.session_expiry_interval > 0,
                    s.to_record(),
                )
            };
            if persist {
                if let Err(e) = self.session_store.upsert(&record).await {
                    warn!("session checkpoint for '{}' failed: {e}", record.client_id);
                }
            }
        }

        if let Some(cluster) = self.cluster() {
            cluster.stop();
        }
        info!("shutdown complete");
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub(crate) fn store_health(&self) -> &Arc<StoreHealth> {
        &self.store_health
    }
}

async fn wait_shutdown(rx: &mut broadcast::Receiver<()>) {
    loop {
        match rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}
