//! QoS 1/2 acknowledgment handling and retransmission

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{trace, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, Publish};
use crate::router::Envelope;
use crate::session::{Qos2State, Session};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// PUBACK: QoS 1 delivery complete.
    pub(crate) async fn handle_puback(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        ack: PubAck,
    ) -> Result<(), ConnectionError> {
        let queue_seq = {
            let mut s = session.write();
            let inflight = s.inflight_outgoing.remove(&ack.packet_id);
            if inflight.is_some() {
                s.return_send_quota();
            }
            inflight.and_then(|m| m.queue_seq)
        };
        self.settle_queue_entry(client_id, session, queue_seq).await;
        self.pump_deliveries(client_id, session).await
    }

    /// PUBREC: QoS 2 step 1 acknowledged; advance to PUBREL.
    pub(crate) async fn handle_pubrec(
        &mut self,
        session: &Arc<RwLock<Session>>,
        ack: PubRec,
    ) -> Result<(), ConnectionError> {
        if ack.reason_code.is_error() {
            // The receiver refused; the exchange ends here.
            let mut s = session.write();
            if s.inflight_outgoing.remove(&ack.packet_id).is_some() {
                s.return_send_quota();
            }
            return Ok(());
        }

        let known = {
            let mut s = session.write();
            match s.inflight_outgoing.get_mut(&ack.packet_id) {
                Some(inflight) => {
                    inflight.qos2 = Some(Qos2State::AwaitingPubComp);
                    inflight.sent_at = Instant::now();
                    true
                }
                None => false,
            }
        };
        if !known {
            trace!("PUBREC for unknown packet id {}", ack.packet_id);
        }
        self.write_packet(&Packet::PubRel(PubRel::new(ack.packet_id)))
            .await
    }

    /// PUBREL: release a held inbound QoS 2 publish into the router.
    pub(crate) async fn handle_pubrel(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        ack: PubRel,
    ) -> Result<(), ConnectionError> {
        let held: Option<Publish> = session.write().inflight_incoming.remove(&ack.packet_id);

        self.write_packet(&Packet::PubComp(PubComp::new(ack.packet_id)))
            .await?;

        // Fan out only now: this is the point the duplicate-suppression
        // window closes.
        if let Some(publish) = held {
            let envelope = Envelope::from_publish(
                &publish,
                self.broker.node_id.clone(),
                Some(client_id.clone()),
            );
            let outcome = self.broker.router.route(&envelope).await;
            if outcome.reason.is_error() {
                warn!(
                    "QoS 2 release for '{}' not fully routed: {}",
                    publish.topic, outcome.reason
                );
            }
        }
        Ok(())
    }

    /// PUBCOMP: QoS 2 delivery complete.
    pub(crate) async fn handle_pubcomp(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        ack: PubComp,
    ) -> Result<(), ConnectionError> {
        let queue_seq = {
            let mut s = session.write();
            let inflight = s.inflight_outgoing.remove(&ack.packet_id);
            if inflight.is_some() {
                s.return_send_quota();
            }
            inflight.and_then(|m| m.queue_seq)
        };
        self.settle_queue_entry(client_id, session, queue_seq).await;
        self.pump_deliveries(client_id, session).await
    }

    /// Acknowledge a drained offline-queue entry back to the store and
    /// advance the session cursor.
    async fn settle_queue_entry(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        queue_seq: Option<u64>,
    ) {
        let Some(seq) = queue_seq else {
            return;
        };
        self.outstanding_queue_seqs.remove(&seq);
        if let Err(e) = self.broker.queues.ack(client_id, seq).await {
            warn!("queue ack {seq} for '{client_id}' failed: {e}");
            return;
        }
        let mut s = session.write();
        if seq > s.queue_cursor {
            s.queue_cursor = seq;
        }
    }

    /// Periodic retransmission of unacknowledged QoS 1/2 traffic.
    pub(crate) async fn retry_unacked(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        enum Retry {
            Publish { packet_id: u16, publish: Publish },
            PubRel { packet_id: u16 },
        }

        let retry_interval = self.broker.config.retry_interval;
        let now = Instant::now();
        let due: Vec<Retry> = {
            let mut s = session.write();
            s.inflight_outgoing
                .iter_mut()
                .filter(|(_, m)| now.duration_since(m.sent_at) >= retry_interval)
                .map(|(&packet_id, m)| {
                    m.sent_at = now;
                    m.retry_count += 1;
                    match m.qos2 {
                        Some(Qos2State::AwaitingPubComp) => Retry::PubRel { packet_id },
                        _ => Retry::Publish {
                            packet_id,
                            publish: m.publish.clone(),
                        },
                    }
                })
                .collect()
        };

        for retry in due {
            match retry {
                Retry::Publish {
                    packet_id,
                    mut publish,
                } => {
                    publish.dup = true;
                    publish.packet_id = Some(packet_id);
                    trace!("retrying PUBLISH {packet_id}");
                    self.write_bounded_publish(session, publish).await?;
                }
                Retry::PubRel { packet_id } => {
                    trace!("retrying PUBREL {packet_id}");
                    self.write_packet(&Packet::PubRel(PubRel::new(packet_id)))
                        .await?;
                }
            }
        }
        Ok(())
    }
}
