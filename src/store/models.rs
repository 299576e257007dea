//! Serializable storage models
//!
//! Wall-clock (unix seconds) variants of the runtime types, encodable with
//! bincode. Runtime `Instant`s never hit disk; deadlines are converted at
//! the store boundary so records survive process restarts.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::{Properties, Publish, QoS, SubscriptionOptions};

/// Current wall clock as unix seconds.
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A persisted application message (retained entry or queued delivery).
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub properties: StoredProperties,
    /// Unix deadline after which the message is expired, if any
    pub expires_at_secs: Option<u64>,
    /// Unix time the record was written
    pub stored_at_secs: u64,
}

impl StoredMessage {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expires_at_secs.is_some_and(|deadline| now_secs >= deadline)
    }

    /// Rebuild a PUBLISH, recomputing the remaining message expiry from the
    /// stored deadline.
    pub fn to_publish(&self, now_secs: u64) -> Publish {
        let mut properties = self.properties.to_properties();
        if let Some(deadline) = self.expires_at_secs {
            properties.message_expiry_interval = Some(deadline.saturating_sub(now_secs) as u32);
        }
        Publish {
            dup: false,
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            retain: self.retain,
            topic: self.topic.as_str().into(),
            packet_id: None,
            payload: Bytes::from(self.payload.clone()),
            properties,
        }
    }

    /// Capture a PUBLISH for storage. The expiry deadline is derived from
    /// the message-expiry-interval property, when present.
    pub fn from_publish(publish: &Publish) -> Self {
        let now = now_unix_secs();
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            properties: StoredProperties::from_properties(&publish.properties),
            expires_at_secs: publish
                .properties
                .message_expiry_interval
                .map(|interval| now + interval as u64),
            stored_at_secs: now,
        }
    }
}

/// Message properties kept across restarts. Transport-scoped properties
/// (topic alias, subscription identifiers) are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

impl StoredProperties {
    pub fn from_properties(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|d| d.to_vec()),
            user_properties: props.user_properties.clone(),
        }
    }

    pub fn to_properties(&self) -> Properties {
        Properties {
            payload_format_indicator: self.payload_format_indicator,
            content_type: self.content_type.clone(),
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone().map(Bytes::from),
            user_properties: self.user_properties.clone(),
            ..Default::default()
        }
    }
}

/// A persisted subscription.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
}

impl StoredSubscription {
    pub fn options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            no_local: self.no_local,
            retain_as_published: self.retain_as_published,
            retain_handling: crate::protocol::RetainHandling::from_u8(self.retain_handling)
                .unwrap_or_default(),
        }
    }
}

/// A persisted will message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub delay_interval_secs: u32,
    pub properties: StoredProperties,
}

/// Everything needed to rehydrate a detached session after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SessionRecord {
    pub client_id: String,
    /// Protocol level byte (4 or 5)
    pub protocol_version: u8,
    pub session_expiry_interval: u32,
    pub keep_alive: u16,
    pub subscriptions: Vec<StoredSubscription>,
    pub will: Option<StoredWill>,
    /// Last acknowledged sequence in the offline queue
    pub queue_cursor: u64,
    /// Unix time of detach; expiry counts from here
    pub disconnected_at_secs: Option<u64>,
}

/// One archived envelope, for audit/history streams.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ArchiveRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub sender_node: String,
    pub sender_client: Option<String>,
    pub archived_at_secs: u64,
}
