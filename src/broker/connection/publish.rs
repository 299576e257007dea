//! Inbound PUBLISH handling
//!
//! Alias resolution, topic validation, authorization, retained-message
//! handling, and the QoS-dependent acknowledgment protocol. The actual
//! fan-out is the router's job; the PUBACK/PUBREC goes out once the
//! router has *accepted* the message, not when subscribers have it.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, ProtocolError, ProtocolVersion, PubAck, PubRec, Publish, QoS, ReasonCode,
};
use crate::router::Envelope;
use crate::session::Session;
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        // Topic alias (v5): an alias with an empty topic refers back to an
        // earlier mapping; with a topic it (re)binds the alias.
        if let Some(alias) = publish.properties.topic_alias {
            if alias == 0 || alias > self.broker.config.max_topic_aliases {
                self.send_server_disconnect(ReasonCode::TopicAliasInvalid).await;
                return Err(ConnectionError::Protocol(ProtocolError::Violation(
                    "topic alias out of range",
                )));
            }
            let resolved = session.write().resolve_alias_in(alias, &publish.topic);
            match resolved {
                Some(topic) => publish.topic = topic,
                None => {
                    self.send_server_disconnect(ReasonCode::ProtocolError).await;
                    return Err(ConnectionError::Protocol(ProtocolError::Violation(
                        "unknown topic alias",
                    )));
                }
            }
        }

        if validate_topic_name(&publish.topic).is_err() {
            warn!("invalid topic name from '{client_id}'");
            return self
                .refuse_publish(&publish, ReasonCode::TopicNameInvalid)
                .await;
        }

        // `$`-prefixed topics belong to the broker side; client publishes
        // there are treated as an authorization failure.
        if publish.topic.starts_with('$') {
            debug!("'{client_id}' tried to publish to reserved topic '{}'", publish.topic);
            return self.refuse_publish(&publish, ReasonCode::NotAuthorized).await;
        }

        if publish.qos > self.broker.config.max_qos {
            self.send_server_disconnect(ReasonCode::QoSNotSupported).await;
            return Err(ConnectionError::Protocol(ProtocolError::Violation(
                "QoS above maximum",
            )));
        }

        if publish.retain && !self.broker.config.retain_available {
            self.send_server_disconnect(ReasonCode::RetainNotSupported).await;
            return Err(ConnectionError::Protocol(ProtocolError::Violation(
                "retain not supported",
            )));
        }

        match self
            .broker
            .hooks
            .allow_publish(
                client_id,
                self.username.as_deref(),
                &publish.topic,
                publish.qos,
                publish.retain,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("PUBLISH by '{client_id}' to '{}' denied", publish.topic);
                return self.refuse_publish(&publish, ReasonCode::NotAuthorized).await;
            }
            Err(e) => {
                warn!("publish authorization error for '{client_id}': {e}");
                return self
                    .refuse_publish(&publish, ReasonCode::UnspecifiedError)
                    .await;
            }
        }

        trace!(
            "PUBLISH '{}' qos {:?} from '{client_id}'",
            publish.topic,
            publish.qos
        );

        match publish.qos {
            QoS::AtMostOnce => {
                if publish.retain {
                    // Best-effort at QoS 0; failures only log.
                    let _ = self.broker.router.store_retained(&publish).await;
                }
                let envelope = Envelope::from_publish(
                    &publish,
                    self.broker.node_id.clone(),
                    Some(client_id.clone()),
                );
                let _ = self.broker.router.route(&envelope).await;
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ConnectionError::Protocol(ProtocolError::Violation(
                        "QoS 1 without packet id",
                    )))?;

                let mut reason = ReasonCode::Success;
                if publish.retain {
                    if let Err(code) = self.broker.router.store_retained(&publish).await {
                        reason = code;
                    }
                }
                if reason == ReasonCode::Success {
                    let envelope = Envelope::from_publish(
                        &publish,
                        self.broker.node_id.clone(),
                        Some(client_id.clone()),
                    );
                    reason = self.broker.router.route(&envelope).await.reason;
                }

                // v3.1.1 has no reason codes; the ack is unconditional.
                let ack = if self.decoder.protocol_version() == Some(ProtocolVersion::V5) {
                    PubAck::with_reason(packet_id, reason)
                } else {
                    PubAck::new(packet_id)
                };
                self.write_packet(&Packet::PubAck(ack)).await
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ConnectionError::Protocol(ProtocolError::Violation(
                        "QoS 2 without packet id",
                    )))?;

                // Duplicate of a publish we already hold: just confirm.
                let already_held = session.read().inflight_incoming.contains_key(&packet_id);
                if already_held {
                    return self
                        .write_packet(&Packet::PubRec(PubRec::new(packet_id)))
                        .await;
                }

                let awaiting = session.read().inflight_incoming.len();
                if awaiting >= self.broker.config.max_awaiting_rel {
                    debug!("too many unreleased QoS 2 publishes from '{client_id}'");
                    return self
                        .write_packet(&Packet::PubRec(PubRec::with_reason(
                            packet_id,
                            ReasonCode::QuotaExceeded,
                        )))
                        .await;
                }

                if !self.broker.store_health().is_healthy() {
                    return self
                        .write_packet(&Packet::PubRec(PubRec::with_reason(
                            packet_id,
                            ReasonCode::UnspecifiedError,
                        )))
                        .await;
                }

                // Retained state changes at receipt; fan-out waits for the
                // release.
                if publish.retain {
                    if let Err(code) = self.broker.router.store_retained(&publish).await {
                        return self
                            .write_packet(&Packet::PubRec(PubRec::with_reason(packet_id, code)))
                            .await;
                    }
                }

                session
                    .write()
                    .inflight_incoming
                    .insert(packet_id, publish);
                self.write_packet(&Packet::PubRec(PubRec::new(packet_id)))
                    .await
            }
        }
    }

    /// Refuse a publish: reason code on the ack for v5 QoS >= 1, silence
    /// otherwise.
    async fn refuse_publish(
        &mut self,
        publish: &Publish,
        reason: ReasonCode,
    ) -> Result<(), ConnectionError> {
        let Some(packet_id) = publish.packet_id else {
            return Ok(());
        };
        if self.decoder.protocol_version() != Some(ProtocolVersion::V5) {
            // v3.1.1: acknowledge without routing, the wire has no way to
            // carry the refusal.
            let packet = match publish.qos {
                QoS::AtLeastOnce => Packet::PubAck(PubAck::new(packet_id)),
                QoS::ExactlyOnce => Packet::PubRec(PubRec::new(packet_id)),
                QoS::AtMostOnce => return Ok(()),
            };
            return self.write_packet(&packet).await;
        }
        let packet = match publish.qos {
            QoS::AtLeastOnce => Packet::PubAck(PubAck::with_reason(packet_id, reason)),
            QoS::ExactlyOnce => Packet::PubRec(PubRec::with_reason(packet_id, reason)),
            QoS::AtMostOnce => return Ok(()),
        };
        self.write_packet(&packet).await
    }
}
