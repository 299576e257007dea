//! Detach, session teardown and will publishing

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::connect::still_detached;
use super::Connection;
use crate::broker::Broker;
use crate::protocol::Publish;
use crate::router::Envelope;
use crate::session::{Session, WillMessage};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Tear down the attachment. `publish_will` is false for clean
    /// disconnects, takeover and drain.
    pub(crate) async fn handle_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish_will: bool,
    ) {
        let epoch = session.read().epoch;
        // A takeover may already have replaced the entry with a newer
        // epoch; leave it alone then.
        self.broker.connections.remove_if_epoch(client_id, epoch);

        // After a takeover the registry holds the successor's session; a
        // stale attachment must not tear that down (and its will stays
        // unpublished).
        let registry_owned = self
            .broker
            .sessions
            .get(client_id)
            .map(|live| Arc::ptr_eq(&live, session) && live.read().epoch == epoch)
            .unwrap_or(false);
        if !registry_owned {
            debug!("'{client_id}' detached from a superseded attachment");
            return;
        }

        let (will, expiry) = {
            let mut s = session.write();
            s.detach();
            let will = if publish_will { s.will.clone() } else { s.will.take() };
            (will, s.session_expiry_interval)
        };

        if let Some(cluster) = self.broker.cluster() {
            cluster.client_detached(client_id);
        }
        self.broker.bus.publish(
            &format!("{}.{client_id}", crate::bus::address::CLIENT_CMD),
            crate::bus::BusEvent::ClientStatus {
                client_id: client_id.clone(),
                online: false,
            },
        );

        if publish_will {
            if let Some(will) = will {
                schedule_will(&self.broker, client_id.clone(), session.clone(), epoch, will);
            }
        }

        if expiry == 0 {
            // The session dies with the connection.
            self.broker.sessions.detach(client_id);
            self.broker.sessions.remove(client_id);
            for filter in self.broker.subscriptions.unsubscribe_all(client_id) {
                if let Some(cluster) = self.broker.cluster() {
                    cluster.subscription_removed(&filter);
                }
            }
            if let Err(e) = self.broker.queues.purge(client_id).await {
                warn!("queue purge for '{client_id}' failed: {e}");
            }
            if let Err(e) = self.broker.session_store.delete(client_id).await {
                warn!("session delete for '{client_id}' failed: {e}");
            }
        } else {
            self.broker.sessions.detach(client_id);
            self.persist_session(client_id, session).await;
        }

        debug!("'{client_id}' detached");
    }
}

/// Publish the will now, or after its delay if one is set. The delayed
/// task re-checks that the same detachment is still in effect; a
/// reconnect in the meantime cancels it.
pub(crate) fn schedule_will(
    broker: &Arc<Broker>,
    client_id: Arc<str>,
    session: Arc<RwLock<Session>>,
    epoch: u64,
    will: WillMessage,
) {
    let broker = Arc::clone(broker);
    tokio::spawn(async move {
        if will.delay_interval > 0 {
            tokio::time::sleep(Duration::from_secs(will.delay_interval as u64)).await;
            let cancelled = {
                let current = broker.sessions.get(&client_id);
                match current {
                    // Session replaced or gone entirely: the registry no
                    // longer holds our incarnation.
                    Some(live) if Arc::ptr_eq(&live, &session) => {
                        let s = session.read();
                        !still_detached(&s, epoch) || s.will.is_none()
                    }
                    _ => {
                        // Session destroyed (expiry 0 path publishes the
                        // will regardless of registry state).
                        false
                    }
                }
            };
            if cancelled {
                debug!("will for '{client_id}' cancelled by reconnect");
                return;
            }
        }
        // Claim the will so a later disconnect cannot publish it twice.
        {
            let mut s = session.write();
            s.will = None;
        }
        publish_will_now(&broker, &client_id, &will).await;
    });
}

/// Route the will like any other publish from this client.
async fn publish_will_now(broker: &Arc<Broker>, client_id: &Arc<str>, will: &WillMessage) {
    debug!("publishing will of '{client_id}' to '{}'", will.topic);
    let mut properties = will.properties.clone();
    // The will-delay interval is CONNECT metadata, not a message property.
    properties.will_delay_interval = None;

    let publish = Publish {
        dup: false,
        qos: will.qos,
        retain: will.retain,
        topic: will.topic.as_str().into(),
        packet_id: None,
        payload: will.payload.clone(),
        properties,
    };

    if publish.retain {
        if let Err(code) = broker.router.store_retained(&publish).await {
            warn!("retained store for will of '{client_id}' failed: {code}");
        }
    }

    let envelope = Envelope::from_publish(
        &publish,
        broker.node_id.clone(),
        Some(client_id.clone()),
    );
    let outcome = broker.router.route(&envelope).await;
    if outcome.reason.is_error() {
        warn!("will of '{client_id}' not fully routed: {}", outcome.reason);
    }
}
