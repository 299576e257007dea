//! Inter-node wire protocol
//!
//! Length-prefixed bincode frames over the peer TCP links. Carries the
//! replicated-map deltas (subscriptions, client ownership), remote
//! publish forwarding, session takeover, and link keep-alive.

use bincode::{Decode, Encode};

/// Protocol version; mismatching peers refuse the link.
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Logical timestamp for last-writer-wins replication: a node-local
/// monotonic counter, tie-broken by node id.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LogicalTimestamp {
    pub counter: u64,
    pub node_id: String,
}

impl PartialOrd for LogicalTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

/// An envelope as it crosses the wire. The message-expiry countdown is
/// re-based at each hop: the sender writes the *remaining* interval and
/// the receiver restarts the clock on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct WireEnvelope {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub expiry_remaining_secs: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
    pub payload_format_indicator: Option<u8>,
    /// Node the publish first entered the cluster on
    pub sender_node: String,
    pub sender_client: Option<String>,
}

/// Messages exchanged between cluster nodes.
#[derive(Debug, Clone, Encode, Decode)]
pub enum ClusterMessage {
    /// Link handshake, sent by the dialing node
    Hello { node_id: String, version: u8 },
    /// Handshake acknowledgment, sent by the accepting node
    HelloAck { node_id: String, version: u8 },

    /// This node acquired its first local subscription for `filter`
    SubscriptionAdd { node_id: String, filter: String },
    /// This node dropped its last local subscription for `filter`
    SubscriptionDelete { node_id: String, filter: String },
    /// Full filter sync, sent after handshake
    SubscriptionSync { node_id: String, filters: Vec<String> },

    /// Client ownership updates for the client→node map
    ClientAttached {
        client_id: String,
        node_id: String,
        ts: LogicalTimestamp,
    },
    ClientDetached {
        client_id: String,
        node_id: String,
        ts: LogicalTimestamp,
    },

    /// A client reappeared on `new_node_id`; the previous owner must
    /// disconnect its session without publishing the will
    SessionTakeover {
        client_id: String,
        new_node_id: String,
        ts: LogicalTimestamp,
    },

    /// One copy of a publish for this node's local subscribers. Never
    /// forwarded further by the receiver.
    RemotePublish {
        envelope: WireEnvelope,
        /// Restrict delivery to these clients (takeover hand-off);
        /// `None` means all local matches
        target_clients: Option<Vec<String>>,
    },

    Ping,
    Pong,
    /// Graceful link teardown
    Goodbye,
}

impl ClusterMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::SubscriptionAdd { .. } => "SubscriptionAdd",
            ClusterMessage::SubscriptionDelete { .. } => "SubscriptionDelete",
            ClusterMessage::SubscriptionSync { .. } => "SubscriptionSync",
            ClusterMessage::ClientAttached { .. } => "ClientAttached",
            ClusterMessage::ClientDetached { .. } => "ClientDetached",
            ClusterMessage::SessionTakeover { .. } => "SessionTakeover",
            ClusterMessage::RemotePublish { .. } => "RemotePublish",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with a u32 length prefix.
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Peek the frame length; `None` until four bytes are buffered.
pub fn read_frame_length(data: &[u8]) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_timestamps_order_by_counter_then_node() {
        let a = LogicalTimestamp {
            counter: 1,
            node_id: "n1".into(),
        };
        let b = LogicalTimestamp {
            counter: 2,
            node_id: "n0".into(),
        };
        let c = LogicalTimestamp {
            counter: 2,
            node_id: "n1".into(),
        };
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.clone().max(b.clone()), c);
    }

    #[test]
    fn round_trip_remote_publish() {
        let msg = ClusterMessage::RemotePublish {
            envelope: WireEnvelope {
                topic: "lab/temp".into(),
                payload: b"t".to_vec(),
                qos: 1,
                retain: false,
                expiry_remaining_secs: Some(30),
                content_type: None,
                response_topic: None,
                correlation_data: None,
                user_properties: vec![("k".into(), "v".into())],
                payload_format_indicator: None,
                sender_node: "n2".into(),
                sender_client: Some("c2".into()),
            },
            target_clients: None,
        };
        let encoded = msg.encode().unwrap();
        let decoded = ClusterMessage::decode(&encoded).unwrap();
        match decoded {
            ClusterMessage::RemotePublish { envelope, .. } => {
                assert_eq!(envelope.topic, "lab/temp");
                assert_eq!(envelope.sender_node, "n2");
                assert_eq!(envelope.expiry_remaining_secs, Some(30));
            }
            other => panic!("wrong message type {other:?}"),
        }
    }

    #[test]
    fn round_trip_takeover() {
        let msg = ClusterMessage::SessionTakeover {
            client_id: "c1".into(),
            new_node_id: "n2".into(),
            ts: LogicalTimestamp {
                counter: 9,
                node_id: "n2".into(),
            },
        };
        let decoded = ClusterMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ClusterMessage::SessionTakeover {
                client_id,
                new_node_id,
                ts,
            } => {
                assert_eq!(client_id, "c1");
                assert_eq!(new_node_id, "n2");
                assert_eq!(ts.counter, 9);
            }
            other => panic!("wrong message type {other:?}"),
        }
    }

    #[test]
    fn framing_round_trip() {
        let msg = ClusterMessage::Ping;
        let frame = frame_message(&msg).unwrap();
        let len = read_frame_length(&frame).unwrap();
        assert_eq!(len, frame.len() - 4);
        assert!(matches!(
            ClusterMessage::decode(&frame[4..]).unwrap(),
            ClusterMessage::Ping
        ));
    }

    #[test]
    fn frame_length_needs_four_bytes() {
        assert_eq!(read_frame_length(&[0, 0, 1]), None);
    }
}
