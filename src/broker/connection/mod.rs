//! Per-connection handling
//!
//! One task per accepted transport. All I/O and session transitions for a
//! client happen here: CONNECT negotiation, the packet loop, keep-alive
//! enforcement, delivery pacing against the peer's receive maximum, and
//! disconnect/will processing. The session object itself lives in the
//! registry; this task owns it only while attached.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::Broker;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Disconnect, Packet, ProtocolError, ProtocolVersion, QoS, ReasonCode,
};
use crate::router::{Delivery, Outbound};
use crate::session::{InflightMessage, Qos2State, Session};

/// Why a connection ended.
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(crate::protocol::DecodeError),
    /// No CONNECT within the grace period, or keep-alive expired
    Timeout,
    /// Orderly termination (client DISCONNECT, takeover, drain)
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {e}"),
            ConnectionError::Protocol(e) => write!(f, "{e}"),
            ConnectionError::Decode(e) => write!(f, "decode error: {e}"),
            ConnectionError::Timeout => write!(f, "timed out"),
            ConnectionError::Closed => write!(f, "closed"),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<crate::protocol::DecodeError> for ConnectionError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<crate::protocol::EncodeError> for ConnectionError {
    fn from(e: crate::protocol::EncodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

/// Connection lifecycle.
pub(crate) enum State {
    /// Waiting for CONNECT
    Connecting,
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
}

const CONNECT_GRACE: Duration = Duration::from_secs(30);
const QUEUE_DRAIN_BATCH: usize = 32;

/// Handler for one client connection, generic over the transport.
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) broker: Arc<Broker>,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) username: Option<String>,
    /// Receiver half of the handle registered in the connection table
    pub(crate) outbound_rx: Option<mpsc::Receiver<Outbound>>,
    /// Highest offline-queue sequence already moved into the in-flight
    /// window this attachment
    pub(crate) drained_seq: u64,
    /// Queue sequences delivered but not yet acknowledged by the client
    pub(crate) outstanding_queue_seqs: BTreeSet<u64>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, broker: Arc<Broker>) -> Self {
        let max_packet_size = broker.config.max_packet_size;
        Self {
            stream,
            addr,
            broker,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            username: None,
            outbound_rx: None,
            drained_seq: 0,
            outstanding_queue_seqs: BTreeSet::new(),
        }
    }

    /// Serve the connection until it ends.
    pub async fn run(
        &mut self,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        match timeout(CONNECT_GRACE, self.read_connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The attachment may already be registered when a late
                // CONNECT step fails; undo it.
                let attached = match &self.state {
                    State::Connected { client_id, session } => {
                        Some((client_id.clone(), session.clone()))
                    }
                    State::Connecting => None,
                };
                if let Some((client_id, session)) = attached {
                    self.handle_disconnect(&client_id, &session, true).await;
                }
                return Err(e);
            }
            Err(_) => {
                debug!("no CONNECT from {} within grace period", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }
        self.run_connected(shutdown_rx).await
    }

    async fn run_connected(
        &mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            State::Connecting => {
                return Err(ConnectionError::Protocol(ProtocolError::UnexpectedPacket(
                    "not connected",
                )))
            }
        };
        let mut outbound_rx = self.outbound_rx.take().expect("registered at CONNECT");

        let keep_alive = {
            let s = session.read();
            if s.keep_alive == 0 {
                // Effectively disabled.
                Duration::from_secs(60 * 60 * 24 * 365)
            } else {
                Duration::from_millis(s.keep_alive as u64 * 1500)
            }
        };
        let mut keep_alive_deadline = tokio::time::Instant::now() + keep_alive;

        let mut retry_ticker = tokio::time::interval(self.broker.config.retry_interval);
        retry_ticker.tick().await;

        let result = loop {
            tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf) => {
                    match read {
                        Ok(0) => {
                            debug!("connection closed by {}", self.addr);
                            self.handle_disconnect(&client_id, &session, true).await;
                            break Ok(());
                        }
                        Ok(_) => {
                            keep_alive_deadline = tokio::time::Instant::now() + keep_alive;
                            match self.process_read_buffer(&client_id, &session).await {
                                Ok(()) => {}
                                Err(ConnectionError::Closed) => break Ok(()),
                                Err(e) => {
                                    self.fail_connection(&client_id, &session, &e).await;
                                    break Err(e);
                                }
                            }
                        }
                        Err(e) => {
                            debug!("read error from {}: {e}", client_id);
                            self.handle_disconnect(&client_id, &session, true).await;
                            break Err(e.into());
                        }
                    }
                }

                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(Outbound::Deliver(delivery)) => {
                            if let Err(e) = self.deliver_publish(&session, delivery).await {
                                self.handle_disconnect(&client_id, &session, true).await;
                                break Err(e);
                            }
                        }
                        Some(Outbound::Disconnect(reason)) => {
                            info!("disconnecting '{}': {reason}", client_id);
                            self.send_server_disconnect(reason).await;
                            // Takeover must not publish the will; a drain
                            // or administrative close does.
                            let publish_will = reason != ReasonCode::SessionTakenOver;
                            self.handle_disconnect(&client_id, &session, publish_will).await;
                            break Ok(());
                        }
                        None => {
                            self.handle_disconnect(&client_id, &session, true).await;
                            break Ok(());
                        }
                    }
                }

                _ = retry_ticker.tick() => {
                    if let Err(e) = self.retry_unacked(&session).await {
                        self.handle_disconnect(&client_id, &session, true).await;
                        break Err(e);
                    }
                }

                _ = tokio::time::sleep_until(keep_alive_deadline) => {
                    info!("keep-alive timeout for '{}'", client_id);
                    self.send_server_disconnect(ReasonCode::KeepAliveTimeout).await;
                    self.handle_disconnect(&client_id, &session, true).await;
                    break Err(ConnectionError::Timeout);
                }

                _ = shutdown_rx.recv() => {
                    self.send_server_disconnect(ReasonCode::ServerShuttingDown).await;
                    self.handle_disconnect(&client_id, &session, true).await;
                    break Ok(());
                }
            }
        };

        result
    }

    /// Decode and dispatch every complete packet in the read buffer.
    async fn process_read_buffer(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        loop {
            let decoded = self.decoder.decode(&self.read_buf)?;
            let Some((packet, consumed)) = decoded else {
                return Ok(());
            };
            bytes::Buf::advance(&mut self.read_buf, consumed);
            {
                let mut s = session.write();
                s.touch();
            }
            self.handle_packet(client_id, session, packet).await?;
        }
    }

    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(ProtocolError::Violation(
                "duplicate CONNECT",
            ))),
            Packet::Publish(publish) => self.handle_publish(client_id, session, publish).await,
            Packet::PubAck(ack) => self.handle_puback(client_id, session, ack).await,
            Packet::PubRec(ack) => self.handle_pubrec(session, ack).await,
            Packet::PubRel(ack) => self.handle_pubrel(client_id, session, ack).await,
            Packet::PubComp(ack) => self.handle_pubcomp(client_id, session, ack).await,
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe).await
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect(disconnect) => {
                self.handle_client_disconnect(client_id, session, disconnect)
                    .await?;
                Err(ConnectionError::Closed)
            }
            Packet::Auth(_) => {
                // Enhanced authentication is never offered by this broker.
                self.send_server_disconnect(ReasonCode::BadAuthenticationMethod)
                    .await;
                Err(ConnectionError::Protocol(ProtocolError::Violation(
                    "unsolicited AUTH",
                )))
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ConnectionError::Protocol(ProtocolError::UnexpectedPacket(
                    "server-only packet from client",
                )))
            }
        }
    }

    /// Encode and write one packet.
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Push one delivery into the client's window, or park it when the
    /// window is full.
    pub(crate) async fn deliver_publish(
        &mut self,
        session: &Arc<RwLock<Session>>,
        delivery: Delivery,
    ) -> Result<(), ConnectionError> {
        let Delivery {
            mut publish,
            queue_seq,
        } = delivery;

        if publish.qos == QoS::AtMostOnce {
            self.apply_outbound_alias(session, &mut publish);
            return self.write_bounded_publish(session, publish).await;
        }

        {
            let mut s = session.write();
            if !s.try_take_send_quota() {
                s.push_pending(crate::session::PendingDelivery { publish, queue_seq });
                return Ok(());
            }
            let packet_id = s.next_packet_id();
            publish.packet_id = Some(packet_id);
            s.inflight_outgoing.insert(
                packet_id,
                InflightMessage {
                    publish: publish.clone(),
                    qos2: if publish.qos == QoS::ExactlyOnce {
                        Some(Qos2State::AwaitingPubRec)
                    } else {
                        None
                    },
                    sent_at: Instant::now(),
                    retry_count: 0,
                    queue_seq,
                },
            );
        }
        if let Some(seq) = queue_seq {
            self.outstanding_queue_seqs.insert(seq);
        }

        self.apply_outbound_alias(session, &mut publish);
        self.write_bounded_publish(session, publish).await
    }

    /// Replace the topic with an alias when the peer allows it (v5 only).
    fn apply_outbound_alias(
        &self,
        session: &Arc<RwLock<Session>>,
        publish: &mut crate::protocol::Publish,
    ) {
        if self.decoder.protocol_version() != Some(ProtocolVersion::V5) {
            return;
        }
        let mut s = session.write();
        let known_before = s.alias_out_contains(&publish.topic);
        if let Some(alias) = s.alias_out_for(&publish.topic) {
            publish.properties.topic_alias = Some(alias);
            if known_before {
                publish.topic = Arc::from("");
            }
        }
    }

    /// Write a PUBLISH unless it exceeds the peer's maximum packet size.
    async fn write_bounded_publish(
        &mut self,
        session: &Arc<RwLock<Session>>,
        publish: crate::protocol::Publish,
    ) -> Result<(), ConnectionError> {
        let max_packet_size = session.read().max_packet_size as usize;
        self.write_buf.clear();
        self.encoder
            .encode(&Packet::Publish(publish), &mut self.write_buf)?;
        if self.write_buf.len() > max_packet_size {
            warn!("dropping oversized PUBLISH ({} bytes) for peer", self.write_buf.len());
            return Ok(());
        }
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Refill the in-flight window: parked deliveries first, then the
    /// offline queue. Called after CONNACK and whenever an ack frees a
    /// slot.
    pub(crate) async fn pump_deliveries(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        loop {
            let window_open = {
                let s = session.read();
                s.send_quota_available()
            };
            if !window_open {
                return Ok(());
            }

            let parked = {
                let mut s = session.write();
                s.pop_pending()
            };
            if let Some(parked) = parked {
                self.deliver_publish(
                    session,
                    Delivery {
                        publish: parked.publish,
                        queue_seq: parked.queue_seq,
                    },
                )
                .await?;
                continue;
            }

            let batch = match self
                .broker
                .queues
                .read_batch(client_id, self.drained_seq, QUEUE_DRAIN_BATCH)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("queue read for '{client_id}' failed: {e}");
                    return Ok(());
                }
            };
            if batch.is_empty() {
                return Ok(());
            }

            let now = crate::store::now_unix_secs();
            for (seq, stored) in batch {
                self.drained_seq = seq;
                if stored.is_expired(now) {
                    // Expired while queued; drop it, and clear it from the
                    // store when nothing older is still unacknowledged.
                    let safe_to_ack = self
                        .outstanding_queue_seqs
                        .first()
                        .map(|&lowest| lowest > seq)
                        .unwrap_or(true);
                    if safe_to_ack {
                        if let Err(e) = self.broker.queues.ack(client_id, seq).await {
                            warn!("expired-entry ack for '{client_id}' failed: {e}");
                        } else {
                            session.write().queue_cursor = seq;
                        }
                    }
                    continue;
                }
                let publish = stored.to_publish(now);
                self.deliver_publish(
                    session,
                    Delivery {
                        publish,
                        queue_seq: Some(seq),
                    },
                )
                .await?;
            }
        }
    }

    /// Send a v5 DISCONNECT with `reason`; v3.1.1 has no server
    /// DISCONNECT, the close alone signals it.
    pub(crate) async fn send_server_disconnect(&mut self, reason: ReasonCode) {
        if self.decoder.protocol_version() == Some(ProtocolVersion::V5) {
            let packet = Packet::Disconnect(Disconnect::with_reason(reason));
            let _ = self.write_packet(&packet).await;
            let _ = self.stream.flush().await;
        }
    }

    /// Map a fatal error onto the right wire behavior before closing:
    /// v5 gets a DISCONNECT with a reason code, v3.1.1 just the close.
    async fn fail_connection(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        error: &ConnectionError,
    ) {
        let reason = match error {
            ConnectionError::Decode(crate::protocol::DecodeError::PacketTooLarge) => {
                ReasonCode::PacketTooLarge
            }
            ConnectionError::Decode(_) => ReasonCode::MalformedPacket,
            ConnectionError::Protocol(_) => ReasonCode::ProtocolError,
            _ => ReasonCode::UnspecifiedError,
        };
        warn!("closing '{}': {error}", client_id);
        self.send_server_disconnect(reason).await;
        self.handle_disconnect(client_id, session, true).await;
    }
}

/// Generate a random id for clients that connect with an empty one.
pub(crate) fn random_client_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let hasher = RandomState::new().build_hasher();
    format!("auto-{:016x}", hasher.finish())
}
