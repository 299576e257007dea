//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, Properties, ProtocolError, ProtocolVersion, QoS, ReasonCode, RetainHandling, SubAck,
    Subscribe, SubscriptionOptions, UnsubAck, Unsubscribe,
};
use crate::router::Delivery;
use crate::session::{Session, SessionSubscription};
use crate::topic::{parse_shared_filter, validate_topic_filter};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let config = &self.broker.config;
        let subscription_id = subscribe.properties.subscription_identifiers.first().copied();
        if subscription_id.is_some() && !config.subscription_identifiers {
            self.send_server_disconnect(ReasonCode::SubIdsNotSupported).await;
            return Err(ConnectionError::Protocol(ProtocolError::Violation(
                "subscription identifiers not supported",
            )));
        }

        let mut reason_codes = Vec::with_capacity(subscribe.filters.len());
        // (filter, granted qos, existed before, retain handling), only for
        // accepted entries; drives the retained replay after the SUBACK.
        let mut accepted: Vec<(String, QoS, bool, RetainHandling)> = Vec::new();

        for request in &subscribe.filters {
            if validate_topic_filter(&request.filter).is_err() {
                reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }
            let shared = parse_shared_filter(&request.filter).is_some();
            if shared && !config.shared_subscriptions {
                reason_codes.push(ReasonCode::SharedSubsNotSupported);
                continue;
            }
            if !config.wildcard_subscriptions
                && (request.filter.contains('+') || request.filter.contains('#'))
            {
                reason_codes.push(ReasonCode::WildcardSubsNotSupported);
                continue;
            }

            match self
                .broker
                .hooks
                .allow_subscribe(client_id, self.username.as_deref(), &request.filter)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "SUBSCRIBE by '{client_id}' to '{}' denied",
                        request.filter
                    );
                    reason_codes.push(ReasonCode::NotAuthorized);
                    continue;
                }
                Err(e) => {
                    warn!("subscribe authorization error for '{client_id}': {e}");
                    reason_codes.push(ReasonCode::UnspecifiedError);
                    continue;
                }
            }

            let granted_qos = request.options.qos.min(config.max_qos);
            let options = SubscriptionOptions {
                qos: granted_qos,
                ..request.options
            };

            let outcome = self.broker.subscriptions.subscribe(
                &request.filter,
                client_id.clone(),
                options,
                subscription_id,
            );

            {
                let mut s = session.write();
                s.subscriptions.insert(
                    request.filter.clone(),
                    SessionSubscription {
                        filter: request.filter.clone(),
                        options,
                        subscription_id,
                    },
                );
            }

            if outcome.first_for_filter {
                if let Some(cluster) = self.broker.cluster() {
                    let inner = parse_shared_filter(&request.filter)
                        .map(|(_, f)| f)
                        .unwrap_or(&request.filter);
                    cluster.subscription_added(inner);
                }
            }
            self.broker.bus.publish(
                crate::bus::address::CLUSTER_SUBSCRIPTION_ADD,
                crate::bus::BusEvent::SubscriptionAdded {
                    filter: request.filter.clone(),
                },
            );

            reason_codes.push(match granted_qos {
                QoS::AtMostOnce => ReasonCode::Success,
                QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
                QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
            });
            // Shared subscriptions never replay retained messages.
            if !shared {
                accepted.push((
                    request.filter.clone(),
                    granted_qos,
                    outcome.replaced,
                    request.options.retain_handling,
                ));
            }

            debug!(
                "SUBSCRIBE '{client_id}' to '{}' granted {:?}",
                request.filter, granted_qos
            );
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }))
        .await?;

        // Persist the subscription change for rehydration.
        self.persist_session(client_id, session).await;

        for (filter, granted_qos, existed, retain_handling) in accepted {
            let replay = match retain_handling {
                RetainHandling::SendAlways => true,
                RetainHandling::SendIfNew => !existed,
                RetainHandling::Never => false,
            };
            if replay {
                self.send_retained(session, &filter, granted_qos, subscription_id)
                    .await?;
            }
        }

        Ok(())
    }

    /// Deliver every retained message matching `filter`, RETAIN=1, QoS
    /// downgraded to the grant.
    pub(crate) async fn send_retained(
        &mut self,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        granted_qos: QoS,
        subscription_id: Option<u32>,
    ) -> Result<(), ConnectionError> {
        for mut publish in self.broker.retained.matching(filter).await {
            publish.qos = publish.qos.min(granted_qos);
            publish.retain = true;
            if let Some(id) = subscription_id {
                publish.properties.subscription_identifiers.push(id);
            }
            self.deliver_publish(
                session,
                Delivery {
                    publish,
                    queue_seq: None,
                },
            )
            .await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let v5 = self.decoder.protocol_version() == Some(ProtocolVersion::V5);
        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());

        for filter in &unsubscribe.filters {
            let outcome = self.broker.subscriptions.unsubscribe(filter, client_id);
            session.write().subscriptions.remove(filter);

            if outcome.last_for_filter {
                if let Some(cluster) = self.broker.cluster() {
                    let inner = parse_shared_filter(filter).map(|(_, f)| f).unwrap_or(filter);
                    cluster.subscription_removed(inner);
                }
            }
            if outcome.removed {
                self.broker.bus.publish(
                    crate::bus::address::CLUSTER_SUBSCRIPTION_DELETE,
                    crate::bus::BusEvent::SubscriptionRemoved {
                        filter: filter.clone(),
                    },
                );
            }

            if v5 {
                reason_codes.push(if outcome.removed {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                });
            }
            debug!("UNSUBSCRIBE '{client_id}' from '{filter}'");
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }))
        .await?;

        self.persist_session(client_id, session).await;
        Ok(())
    }

    /// Write the current session record when the session is persistent.
    pub(crate) async fn persist_session(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) {
        let (persist, record) = {
            let s = session.read();
            (
                !s.clean_start && s.session_expiry_interval > 0,
                s.to_record(),
            )
        };
        if persist {
            if let Err(e) = self.broker.session_store.upsert(&record).await {
                warn!("session persist for '{client_id}' failed: {e}");
            }
        }
    }
}
