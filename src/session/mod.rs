//! MQTT sessions
//!
//! A `Session` is the per-client state that outlives transport
//! connections: subscriptions, QoS 1/2 in-flight windows, packet-id
//! allocation, topic-alias tables, flow-control quota, the will message,
//! and the cursor into the offline queue. The `SessionRegistry` owns every
//! session on this node; a connection holds the session only while
//! attached, identified by an epoch that invalidates stale handles after
//! takeover or reattach.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::protocol::{Properties, ProtocolVersion, Publish, QoS, SubscriptionOptions};
use crate::store::{
    now_unix_secs, SessionRecord, StoredSubscription, StoredWill, StoredProperties,
};

/// Session expiry value meaning "never expires".
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A live connection owns the session
    Attached,
    /// No connection; expiry timer running (unless expiry is never)
    Detached,
    /// Expiry fired; the registry will reap it
    Expired,
}

/// QoS 2 outbound progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingPubRec,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitingPubComp,
}

/// One unacknowledged outbound QoS 1/2 message.
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    pub qos2: Option<Qos2State>,
    pub sent_at: Instant,
    pub retry_count: u32,
    /// Sequence in the offline queue, when this delivery was drained from
    /// it; acked against the queue store on PUBACK/PUBCOMP.
    pub queue_seq: Option<u64>,
}

/// A delivery parked because the in-flight window is full.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub publish: Publish,
    pub queue_seq: Option<u64>,
}

/// Outcome of parking a delivery in the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    Queued,
    /// An older QoS 0 entry was evicted to make room
    DroppedOldestQos0,
    /// Queue full of QoS 1/2; caller refuses the publisher
    Full,
}

/// Will message parked until disconnect.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
    pub properties: Properties,
}

/// Per-session caps, from broker configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Outbound in-flight window (min of ours and peer receive-maximum)
    pub max_inflight: u16,
    /// Pending-delivery queue length while attached
    pub max_pending: usize,
    /// Unreleased inbound QoS 2 publishes
    pub max_awaiting_rel: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            max_pending: 1000,
            max_awaiting_rel: 100,
        }
    }
}

/// Per-client session state.
pub struct Session {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub state: SessionState,
    pub clean_start: bool,
    /// Seconds; 0 = destroy on disconnect, `EXPIRY_NEVER` = keep forever
    pub session_expiry_interval: u32,
    pub keep_alive: u16,
    pub last_activity: Instant,
    pub disconnected_at: Option<Instant>,
    /// Wall-clock detach time, persisted so expiry survives restarts
    pub disconnected_at_wall: Option<u64>,
    /// Bumped on every attach; stale connection handles check it
    pub epoch: u64,

    pub subscriptions: HashMap<String, SessionSubscription>,
    pub inflight_outgoing: HashMap<u16, InflightMessage>,
    /// Inbound QoS 2 publishes held until PUBREL, keyed by packet id
    pub inflight_incoming: HashMap<u16, Publish>,
    pending: VecDeque<PendingDelivery>,
    next_packet_id: u16,

    /// Peer's receive maximum; our unacked QoS>=1 sends never exceed it
    pub receive_maximum: u16,
    send_quota: u16,
    /// Peer's maximum packet size
    pub max_packet_size: u32,

    /// Inbound aliases (peer-chosen) and outbound aliases (ours)
    alias_in: HashMap<u16, Arc<str>>,
    alias_out: HashMap<Arc<str>, u16>,
    next_alias_out: u16,
    /// Peer's topic-alias-maximum; caps outbound alias assignment
    pub alias_out_max: u16,

    pub will: Option<WillMessage>,
    /// Last acked sequence in the offline queue
    pub queue_cursor: u64,
    pub limits: SessionLimits,
}

/// A subscription as the session tracks it (the index holds the matching
/// copy).
#[derive(Debug, Clone)]
pub struct SessionSubscription {
    pub filter: String,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion) -> Self {
        Self {
            client_id,
            protocol_version,
            state: SessionState::Attached,
            clean_start: true,
            session_expiry_interval: 0,
            keep_alive: 60,
            last_activity: Instant::now(),
            disconnected_at: None,
            disconnected_at_wall: None,
            epoch: 0,
            subscriptions: HashMap::new(),
            inflight_outgoing: HashMap::new(),
            inflight_incoming: HashMap::new(),
            pending: VecDeque::new(),
            next_packet_id: 1,
            receive_maximum: u16::MAX,
            send_quota: u16::MAX,
            max_packet_size: crate::codec::MAX_REMAINING_LENGTH as u32,
            alias_in: HashMap::new(),
            alias_out: HashMap::new(),
            next_alias_out: 1,
            alias_out_max: 0,
            will: None,
            queue_cursor: 0,
            limits: SessionLimits::default(),
        }
    }

    /// Allocate the next packet id, skipping ids still in flight in either
    /// direction. Wraps within [1, 65535].
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = match self.next_packet_id {
                u16::MAX => 1,
                n => n + 1,
            };
            if !self.inflight_outgoing.contains_key(&id)
                && !self.inflight_incoming.contains_key(&id)
            {
                return id;
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// 1.5x keep-alive with no traffic means the connection is dead.
    pub fn keep_alive_timed_out(&self) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_millis(self.keep_alive as u64 * 1500);
        self.last_activity.elapsed() > timeout
    }

    /// Whether the expiry deadline of a detached session has passed.
    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Detached {
            return false;
        }
        match self.session_expiry_interval {
            0 => true,
            EXPIRY_NEVER => false,
            secs => self
                .disconnected_at
                .is_some_and(|at| at.elapsed() >= Duration::from_secs(secs as u64)),
        }
    }

    // ------------------------------------------------------------------
    // Flow control (peer receive-maximum)
    // ------------------------------------------------------------------

    /// Take one send-quota slot; false means the window is full and the
    /// delivery must wait in the pending queue.
    pub fn try_take_send_quota(&mut self) -> bool {
        if self.send_quota == 0 || self.inflight_outgoing.len() >= self.limits.max_inflight as usize
        {
            return false;
        }
        self.send_quota -= 1;
        true
    }

    /// Return a quota slot on PUBACK/PUBCOMP (or failed send).
    pub fn return_send_quota(&mut self) {
        if self.send_quota < self.receive_maximum {
            self.send_quota += 1;
        }
    }

    /// Whether another QoS >= 1 send would fit the window right now.
    pub fn send_quota_available(&self) -> bool {
        self.send_quota > 0 && self.inflight_outgoing.len() < self.limits.max_inflight as usize
    }

    // ------------------------------------------------------------------
    // Pending deliveries (attached, window full)
    // ------------------------------------------------------------------

    /// Park a delivery until the in-flight window drains. QoS 0 entries
    /// are evicted oldest-first under pressure before QoS 1/2 is refused.
    pub fn push_pending(&mut self, delivery: PendingDelivery) -> PendingOutcome {
        if self.limits.max_pending == 0 || self.pending.len() < self.limits.max_pending {
            self.pending.push_back(delivery);
            return PendingOutcome::Queued;
        }
        if let Some(pos) = self
            .pending
            .iter()
            .position(|d| d.publish.qos == QoS::AtMostOnce)
        {
            self.pending.remove(pos);
            self.pending.push_back(delivery);
            return PendingOutcome::DroppedOldestQos0;
        }
        if delivery.publish.qos == QoS::AtMostOnce {
            // Full of QoS 1/2; a QoS 0 delivery just drops.
            return PendingOutcome::DroppedOldestQos0;
        }
        PendingOutcome::Full
    }

    pub fn pop_pending(&mut self) -> Option<PendingDelivery> {
        self.pending.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn drain_pending(&mut self) -> VecDeque<PendingDelivery> {
        std::mem::take(&mut self.pending)
    }

    // ------------------------------------------------------------------
    // Topic aliases (v5)
    // ------------------------------------------------------------------

    /// Resolve or record a peer-chosen inbound alias. Returns the resolved
    /// topic, or None for an unknown alias (protocol error).
    pub fn resolve_alias_in(&mut self, alias: u16, topic: &str) -> Option<Arc<str>> {
        if topic.is_empty() {
            self.alias_in.get(&alias).cloned()
        } else {
            let topic: Arc<str> = Arc::from(topic);
            self.alias_in.insert(alias, topic.clone());
            Some(topic)
        }
    }

    /// Whether an outbound alias is already assigned for `topic`.
    pub fn alias_out_contains(&self, topic: &Arc<str>) -> bool {
        self.alias_out.contains_key(topic)
    }

    /// Assign (or reuse) an outbound alias for `topic` within the peer's
    /// advertised maximum.
    pub fn alias_out_for(&mut self, topic: &Arc<str>) -> Option<u16> {
        if self.alias_out_max == 0 {
            return None;
        }
        if let Some(&alias) = self.alias_out.get(topic) {
            return Some(alias);
        }
        if self.next_alias_out <= self.alias_out_max {
            let alias = self.next_alias_out;
            self.next_alias_out += 1;
            self.alias_out.insert(topic.clone(), alias);
            Some(alias)
        } else {
            None
        }
    }

    /// Alias tables do not survive a reconnect.
    pub fn reset_aliases(&mut self) {
        self.alias_in.clear();
        self.alias_out.clear();
        self.next_alias_out = 1;
    }

    /// Re-apply negotiated connection parameters on (re)attach. In-flight
    /// messages surviving a resume keep their window slots.
    pub fn begin_attach(&mut self, receive_maximum: u16, max_packet_size: u32, alias_out_max: u16) {
        self.state = SessionState::Attached;
        self.disconnected_at = None;
        self.disconnected_at_wall = None;
        self.epoch += 1;
        self.receive_maximum = receive_maximum;
        self.send_quota =
            receive_maximum.saturating_sub(self.inflight_outgoing.len().min(u16::MAX as usize) as u16);
        self.max_packet_size = max_packet_size;
        self.alias_out_max = alias_out_max;
        self.reset_aliases();
        self.touch();
    }

    pub fn detach(&mut self) {
        self.state = SessionState::Detached;
        self.disconnected_at = Some(Instant::now());
        self.disconnected_at_wall = Some(now_unix_secs());
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            client_id: self.client_id.to_string(),
            protocol_version: self.protocol_version as u8,
            session_expiry_interval: self.session_expiry_interval,
            keep_alive: self.keep_alive,
            subscriptions: self
                .subscriptions
                .values()
                .map(|s| StoredSubscription {
                    filter: s.filter.clone(),
                    qos: s.options.qos as u8,
                    no_local: s.options.no_local,
                    retain_as_published: s.options.retain_as_published,
                    retain_handling: s.options.retain_handling as u8,
                    subscription_id: s.subscription_id,
                })
                .collect(),
            will: self.will.as_ref().map(|w| StoredWill {
                topic: w.topic.clone(),
                payload: w.payload.to_vec(),
                qos: w.qos as u8,
                retain: w.retain,
                delay_interval_secs: w.delay_interval,
                properties: StoredProperties::from_properties(&w.properties),
            }),
            queue_cursor: self.queue_cursor,
            disconnected_at_secs: self.disconnected_at_wall,
        }
    }

    /// Rebuild a detached session from its persisted record.
    pub fn from_record(record: &SessionRecord) -> Self {
        let client_id: Arc<str> = record.client_id.as_str().into();
        let mut session = Session::new(
            client_id,
            ProtocolVersion::from_u8(record.protocol_version).unwrap_or(ProtocolVersion::V311),
        );
        session.clean_start = false;
        session.state = SessionState::Detached;
        session.session_expiry_interval = record.session_expiry_interval;
        session.keep_alive = record.keep_alive;
        session.queue_cursor = record.queue_cursor;
        // Time already spent detached counts against the expiry deadline.
        let elapsed = record
            .disconnected_at_secs
            .map(|at| now_unix_secs().saturating_sub(at))
            .unwrap_or(0);
        session.disconnected_at = Instant::now().checked_sub(Duration::from_secs(elapsed));
        session.disconnected_at_wall = record.disconnected_at_secs;
        for sub in &record.subscriptions {
            session.subscriptions.insert(
                sub.filter.clone(),
                SessionSubscription {
                    filter: sub.filter.clone(),
                    options: sub.options(),
                    subscription_id: sub.subscription_id,
                },
            );
        }
        session.will = record.will.as_ref().map(|w| WillMessage {
            topic: w.topic.clone(),
            payload: Bytes::from(w.payload.clone()),
            qos: QoS::from_u8(w.qos).unwrap_or_default(),
            retain: w.retain,
            delay_interval: w.delay_interval_secs,
            properties: w.properties.to_properties(),
        });
        session
    }
}

/// All sessions on this node, attached and detached.
pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Attach for `client_id`: resume the existing session when
    /// `clean_start` is false and one is present and unexpired, otherwise
    /// install a fresh one. Returns (session, resumed).
    pub fn attach(
        &self,
        client_id: &str,
        protocol_version: ProtocolVersion,
        clean_start: bool,
        limits: SessionLimits,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_start {
            if let Some(existing) = self.sessions.get(&client_id) {
                let resumable = {
                    let mut s = existing.write();
                    if s.is_expired() {
                        false
                    } else {
                        s.state = SessionState::Attached;
                        s.protocol_version = protocol_version;
                        s.limits = limits;
                        true
                    }
                };
                if resumable {
                    return (existing.clone(), true);
                }
            }
        }

        let mut session = Session::new(client_id.clone(), protocol_version);
        session.clean_start = clean_start;
        session.limits = limits;
        // Carry the epoch across replacement so stale handles from the
        // previous incarnation never pass an epoch check.
        if let Some(previous) = self.sessions.get(&client_id) {
            session.epoch = previous.read().epoch;
        }
        let session = Arc::new(RwLock::new(session));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    /// Insert a rehydrated detached session at startup; existing entries
    /// win (a client may already have reconnected).
    pub fn restore(&self, session: Session) {
        let client_id = session.client_id.clone();
        self.sessions
            .entry(client_id)
            .or_insert_with(|| Arc::new(RwLock::new(session)));
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Mark detached; sessions with expiry 0 are destroyed immediately and
    /// reported back to the caller for queue/store cleanup.
    pub fn detach(&self, client_id: &str) -> bool {
        let destroy = match self.sessions.get(client_id) {
            Some(session) => {
                let mut s = session.write();
                s.detach();
                s.session_expiry_interval == 0
            }
            None => return false,
        };
        if destroy {
            self.sessions.remove(client_id);
            debug!("session '{client_id}' destroyed on disconnect (expiry 0)");
        }
        destroy
    }

    /// Reap expired sessions; returns their client ids so the caller can
    /// purge queues, stores and subscriptions.
    pub fn take_expired(&self) -> Vec<Arc<str>> {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let mut s = entry.value().write();
            if s.is_expired() {
                s.state = SessionState::Expired;
                expired.push(entry.key().clone());
            }
        }
        for client_id in &expired {
            self.sessions.remove(client_id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every session handle (drain and checkpoint paths).
    pub fn iter_sessions(&self) -> Vec<Arc<RwLock<Session>>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}
