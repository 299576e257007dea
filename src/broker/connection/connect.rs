//! CONNECT negotiation

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, info};

use super::{random_client_id, Connection, ConnectionError, State};
use crate::protocol::{
    ConnAck, Connect, Packet, Properties, ProtocolError, ProtocolVersion, QoS, ReasonCode,
};
use crate::router::ConnectionHandle;
use crate::session::{SessionState, WillMessage, EXPIRY_NEVER};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read packets until the CONNECT arrives; anything else first is a
    /// protocol error.
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    bytes::Buf::advance(&mut self.read_buf, consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        _ => {
                            debug!("first packet from {} was not CONNECT", self.addr);
                            Err(ConnectionError::Protocol(ProtocolError::Violation(
                                "first packet must be CONNECT",
                            )))
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    // A v5 client gets a CONNACK naming the problem before
                    // the close; v3 just sees the close.
                    if self.decoder.protocol_version() == Some(ProtocolVersion::V5) {
                        self.encoder.set_protocol_version(ProtocolVersion::V5);
                        let reason_code = match &e {
                            crate::protocol::DecodeError::InvalidProtocolVersion(_) => {
                                ReasonCode::UnsupportedProtocolVersion
                            }
                            crate::protocol::DecodeError::PacketTooLarge => {
                                ReasonCode::PacketTooLarge
                            }
                            _ => ReasonCode::MalformedPacket,
                        };
                        let _ = self
                            .write_packet(&Packet::ConnAck(ConnAck {
                                session_present: false,
                                reason_code,
                                properties: Properties::default(),
                            }))
                            .await;
                    }
                    return Err(e.into());
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "closed before CONNECT",
                )));
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        let version = connect.protocol_version;
        self.decoder.set_protocol_version(version);
        self.encoder.set_protocol_version(version);

        // An empty client id is only allowed with clean start; the broker
        // assigns one then.
        if connect.client_id.is_empty() && !connect.clean_start {
            self.refuse(ReasonCode::ClientIdNotValid).await?;
            return Err(ConnectionError::Protocol(ProtocolError::Violation(
                "empty client id without clean start",
            )));
        }
        let assigned_id = connect.client_id.is_empty();
        let client_id: Arc<str> = if assigned_id {
            random_client_id().into()
        } else {
            connect.client_id.as_str().into()
        };
        debug!("CONNECT from {} as '{}'", self.addr, client_id);

        match self
            .broker
            .hooks
            .authenticate(&client_id, connect.username.as_deref(), connect.password.as_ref())
            .await
        {
            Ok(true) => {
                self.username = connect.username.clone();
            }
            Ok(false) => {
                info!("authentication failed for '{client_id}'");
                self.refuse(ReasonCode::NotAuthorized).await?;
                return Err(ConnectionError::Protocol(ProtocolError::Violation(
                    "authentication failed",
                )));
            }
            Err(e) => {
                error!("authentication error for '{client_id}': {e}");
                self.refuse(ReasonCode::UnspecifiedError).await?;
                return Err(ConnectionError::Protocol(ProtocolError::Violation(
                    "authentication error",
                )));
            }
        }

        // Local takeover: an existing connection for this client id is
        // told to close (without its will) before we adopt the session.
        if self
            .broker
            .connections
            .request_disconnect(&client_id, ReasonCode::SessionTakenOver)
        {
            info!("session '{client_id}' taken over by new connection from {}", self.addr);
        }

        // Clean start wipes every trace of a previous session.
        if connect.clean_start {
            for filter in self.broker.subscriptions.unsubscribe_all(&client_id) {
                if let Some(cluster) = self.broker.cluster() {
                    cluster.subscription_removed(&filter);
                }
            }
            if let Err(e) = self.broker.queues.purge(&client_id).await {
                error!("queue purge for '{client_id}' failed: {e}");
            }
            if let Err(e) = self.broker.session_store.delete(&client_id).await {
                error!("session delete for '{client_id}' failed: {e}");
            }
        }

        let (session, resumed) = self.broker.sessions.attach(
            &client_id,
            version,
            connect.clean_start,
            self.broker.config.session_limits(),
        );

        let config = &self.broker.config;
        let keep_alive = if connect.keep_alive == 0 {
            config.default_keep_alive
        } else {
            connect.keep_alive.min(config.max_keep_alive)
        };
        let keep_alive_overridden = keep_alive != connect.keep_alive;

        {
            let mut s = session.write();
            s.clean_start = connect.clean_start;
            s.keep_alive = keep_alive;

            let receive_maximum = connect.properties.receive_maximum.unwrap_or(u16::MAX);
            let max_packet_size = connect
                .properties
                .maximum_packet_size
                .unwrap_or(crate::codec::MAX_REMAINING_LENGTH as u32);
            let alias_out_max = connect.properties.topic_alias_maximum.unwrap_or(0);
            s.begin_attach(receive_maximum, max_packet_size, alias_out_max);

            s.session_expiry_interval = if version.is_v5() {
                connect.properties.session_expiry_interval.unwrap_or(0)
            } else if connect.clean_start {
                0
            } else {
                EXPIRY_NEVER
            };

            s.will = connect.will.as_ref().map(|will| WillMessage {
                topic: will.topic.clone(),
                payload: will.payload.clone(),
                qos: will.qos,
                retain: will.retain,
                delay_interval: will.properties.will_delay_interval.unwrap_or(0),
                properties: will.properties.clone(),
            });

            // A resumed session resets its delivery bookkeeping for this
            // attachment.
            self.drained_seq = s.queue_cursor;
        }

        // Register the outbound channel under the new epoch.
        let epoch = session.read().epoch;
        let (tx, rx) = tokio::sync::mpsc::channel(config.outbound_channel_capacity);
        self.outbound_rx = Some(rx);
        self.broker
            .connections
            .register(client_id.clone(), ConnectionHandle { sender: tx, epoch });

        let mut connack = ConnAck {
            session_present: resumed && !connect.clean_start,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        if version.is_v5() {
            connack.properties.receive_maximum = Some(config.receive_maximum);
            // Only 0 and 1 may be advertised; absence means QoS 2.
            if config.max_qos != QoS::ExactlyOnce {
                connack.properties.maximum_qos = Some(config.max_qos as u8);
            }
            connack.properties.retain_available = Some(config.retain_available as u8);
            connack.properties.maximum_packet_size = Some(config.max_packet_size as u32);
            connack.properties.topic_alias_maximum = Some(config.max_topic_aliases);
            connack.properties.wildcard_subscription_available =
                Some(config.wildcard_subscriptions as u8);
            connack.properties.subscription_identifier_available =
                Some(config.subscription_identifiers as u8);
            connack.properties.shared_subscription_available =
                Some(config.shared_subscriptions as u8);
            if keep_alive_overridden {
                connack.properties.server_keep_alive = Some(keep_alive);
            }
            if assigned_id {
                connack.properties.assigned_client_identifier = Some(client_id.to_string());
            }
        }
        self.write_packet(&Packet::ConnAck(connack)).await?;

        self.state = State::Connected {
            client_id: client_id.clone(),
            session: session.clone(),
        };

        // Tell the cluster this node owns the session now; a previous
        // owner gets the takeover broadcast from the coordinator.
        if let Some(cluster) = self.broker.cluster() {
            cluster.client_attached(&client_id);
        }
        self.broker.bus.publish(
            &format!("{}.{client_id}", crate::bus::address::CLIENT_CMD),
            crate::bus::BusEvent::ClientStatus {
                client_id: client_id.clone(),
                online: true,
            },
        );

        // Persist the attachment for crash recovery.
        let persist = {
            let s = session.read();
            !s.clean_start && s.session_expiry_interval > 0
        };
        if persist {
            let record = session.read().to_record();
            if let Err(e) = self.broker.session_store.upsert(&record).await {
                error!("session persist for '{client_id}' failed: {e}");
            }
        }

        if resumed {
            self.resend_inflight(&session).await?;
        }
        // Drain whatever accumulated while the session was away.
        self.pump_deliveries(&client_id, &session).await?;

        Ok(())
    }

    /// CONNACK with an error code, then let the caller close.
    async fn refuse(&mut self, reason_code: ReasonCode) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::ConnAck(ConnAck {
            session_present: false,
            reason_code,
            properties: Properties::default(),
        }))
        .await
    }

    /// Re-send unacknowledged in-flight messages with their original
    /// packet ids: PUBLISH with DUP=1, or PUBREL where the handshake had
    /// already advanced.
    async fn resend_inflight(
        &mut self,
        session: &Arc<parking_lot::RwLock<crate::session::Session>>,
    ) -> Result<(), ConnectionError> {
        let to_resend: Vec<_> = {
            let mut s = session.write();
            let now = std::time::Instant::now();
            s.inflight_outgoing
                .iter_mut()
                .map(|(&packet_id, inflight)| {
                    inflight.sent_at = now;
                    inflight.retry_count += 1;
                    (packet_id, inflight.publish.clone(), inflight.qos2, inflight.queue_seq)
                })
                .collect()
        };

        for (packet_id, mut publish, qos2, queue_seq) in to_resend {
            if let Some(seq) = queue_seq {
                self.outstanding_queue_seqs.insert(seq);
            }
            match qos2 {
                Some(crate::session::Qos2State::AwaitingPubComp) => {
                    self.write_packet(&Packet::PubRel(crate::protocol::PubRel::new(packet_id)))
                        .await?;
                }
                _ => {
                    publish.dup = true;
                    publish.packet_id = Some(packet_id);
                    self.write_bounded_publish(session, publish).await?;
                }
            }
        }
        Ok(())
    }

    /// Client-initiated DISCONNECT.
    pub(crate) async fn handle_client_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<parking_lot::RwLock<crate::session::Session>>,
        disconnect: crate::protocol::Disconnect,
    ) -> Result<(), ConnectionError> {
        debug!(
            "DISCONNECT from '{}' ({})",
            client_id, disconnect.reason_code
        );

        // v5 allows raising the session expiry at disconnect time.
        if let Some(expiry) = disconnect.properties.session_expiry_interval {
            session.write().session_expiry_interval = expiry;
        }

        // Normal disconnection discards the will; the dedicated reason
        // code keeps it.
        let publish_will = disconnect.reason_code == ReasonCode::DisconnectWithWill;
        self.handle_disconnect(client_id, session, publish_will).await;
        Ok(())
    }
}

/// Session state check helper used by the delayed-will task.
pub(crate) fn still_detached(session: &crate::session::Session, epoch: u64) -> bool {
    session.state == SessionState::Detached && session.epoch == epoch
}
