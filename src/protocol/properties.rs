//! MQTT v5.0 properties
//!
//! All v5 packets carry a property block in the variable header; will
//! properties use the same encoding. The block is a varint length followed
//! by (identifier, value) pairs. Decoded into a typed struct so callers
//! never walk a property list.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_variable_int, write_binary, write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers (MQTT v5.0 table 2-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Typed collection of v5.0 properties.
///
/// Fields absent on the wire are `None` (or empty for the repeatable
/// subscription-identifier and user-property entries).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

/// Set `$field` from a decoder closure, rejecting duplicates.
macro_rules! set_once {
    ($field:expr, $id:expr, $value:expr) => {{
        if $field.is_some() {
            return Err(DecodeError::InvalidProperty($id));
        }
        $field = Some($value);
    }};
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a property block (length prefix included).
    /// Returns the properties and the total bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (block_len, len_bytes) = read_variable_int(buf)?;
        let block_len = block_len as usize;
        let end = len_bytes + block_len;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::default();
        let mut pos = len_bytes;

        while pos < end {
            let id = buf[pos];
            pos += 1;
            let rest = &buf[pos..end];

            match id {
                0x01 => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.payload_format_indicator, id, v);
                    pos += 1;
                }
                0x02 => {
                    set_once!(props.message_expiry_interval, id, read_u32_at(rest)?);
                    pos += 4;
                }
                0x03 => {
                    let (s, n) = read_string(rest)?;
                    set_once!(props.content_type, id, s.to_string());
                    pos += n;
                }
                0x08 => {
                    let (s, n) = read_string(rest)?;
                    set_once!(props.response_topic, id, s.to_string());
                    pos += n;
                }
                0x09 => {
                    let (d, n) = read_binary(rest)?;
                    set_once!(props.correlation_data, id, Bytes::copy_from_slice(d));
                    pos += n;
                }
                0x0B => {
                    let (v, n) = read_variable_int(rest)?;
                    if v == 0 {
                        return Err(DecodeError::InvalidProperty(id));
                    }
                    props.subscription_identifiers.push(v);
                    pos += n;
                }
                0x11 => {
                    set_once!(props.session_expiry_interval, id, read_u32_at(rest)?);
                    pos += 4;
                }
                0x12 => {
                    let (s, n) = read_string(rest)?;
                    set_once!(props.assigned_client_identifier, id, s.to_string());
                    pos += n;
                }
                0x13 => {
                    set_once!(props.server_keep_alive, id, read_u16_at(rest)?);
                    pos += 2;
                }
                0x15 => {
                    let (s, n) = read_string(rest)?;
                    set_once!(props.authentication_method, id, s.to_string());
                    pos += n;
                }
                0x16 => {
                    let (d, n) = read_binary(rest)?;
                    set_once!(props.authentication_data, id, Bytes::copy_from_slice(d));
                    pos += n;
                }
                0x17 => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.request_problem_information, id, v);
                    pos += 1;
                }
                0x18 => {
                    set_once!(props.will_delay_interval, id, read_u32_at(rest)?);
                    pos += 4;
                }
                0x19 => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.request_response_information, id, v);
                    pos += 1;
                }
                0x1A => {
                    let (s, n) = read_string(rest)?;
                    set_once!(props.response_information, id, s.to_string());
                    pos += n;
                }
                0x1C => {
                    let (s, n) = read_string(rest)?;
                    set_once!(props.server_reference, id, s.to_string());
                    pos += n;
                }
                0x1F => {
                    let (s, n) = read_string(rest)?;
                    set_once!(props.reason_string, id, s.to_string());
                    pos += n;
                }
                0x21 => {
                    let v = read_u16_at(rest)?;
                    if v == 0 {
                        return Err(DecodeError::InvalidProperty(id));
                    }
                    set_once!(props.receive_maximum, id, v);
                    pos += 2;
                }
                0x22 => {
                    set_once!(props.topic_alias_maximum, id, read_u16_at(rest)?);
                    pos += 2;
                }
                0x23 => {
                    set_once!(props.topic_alias, id, read_u16_at(rest)?);
                    pos += 2;
                }
                0x24 => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.maximum_qos, id, v);
                    pos += 1;
                }
                0x25 => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.retain_available, id, v);
                    pos += 1;
                }
                0x26 => {
                    let (k, n) = read_string(rest)?;
                    let k = k.to_string();
                    let (v, m) = read_string(&rest[n..])?;
                    props.user_properties.push((k, v.to_string()));
                    pos += n + m;
                }
                0x27 => {
                    let v = read_u32_at(rest)?;
                    if v == 0 {
                        return Err(DecodeError::InvalidProperty(id));
                    }
                    set_once!(props.maximum_packet_size, id, v);
                    pos += 4;
                }
                0x28 => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.wildcard_subscription_available, id, v);
                    pos += 1;
                }
                0x29 => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.subscription_identifier_available, id, v);
                    pos += 1;
                }
                0x2A => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    set_once!(props.shared_subscription_available, id, v);
                    pos += 1;
                }
                other => return Err(DecodeError::InvalidProperty(other)),
            }
        }

        if pos != end {
            return Err(DecodeError::MalformedPacket("property block overrun"));
        }

        Ok((props, end))
    }

    /// Encode the full property block, varint length prefix included.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Encode the body into a scratch buffer first; the length prefix
        // depends on the body size.
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(0x01);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(0x02);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(0x03);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(0x08);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(0x09);
            write_binary(buf, d)?;
        }
        for &id in &self.subscription_identifiers {
            buf.put_u8(0x0B);
            write_variable_int(buf, id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(0x11);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(0x12);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(0x13);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.authentication_method {
            buf.put_u8(0x15);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.authentication_data {
            buf.put_u8(0x16);
            write_binary(buf, d)?;
        }
        if let Some(v) = self.request_problem_information {
            buf.put_u8(0x17);
            buf.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            buf.put_u8(0x18);
            buf.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            buf.put_u8(0x19);
            buf.put_u8(v);
        }
        if let Some(ref s) = self.response_information {
            buf.put_u8(0x1A);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.server_reference {
            buf.put_u8(0x1C);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(0x1F);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(0x21);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(0x22);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            buf.put_u8(0x23);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(0x24);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(0x25);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(0x26);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(0x27);
            buf.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            buf.put_u8(0x28);
            buf.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            buf.put_u8(0x29);
            buf.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            buf.put_u8(0x2A);
            buf.put_u8(v);
        }
        Ok(())
    }
}

#[inline]
fn read_u16_at(buf: &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

#[inline]
fn read_u32_at(buf: &[u8]) -> Result<u32, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(props: &Properties) -> Properties {
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        let (decoded, consumed) = Properties::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn empty_block_is_one_byte() {
        let mut buf = BytesMut::new();
        Properties::default().encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);
    }

    #[test]
    fn publish_properties_round_trip() {
        let props = Properties {
            message_expiry_interval: Some(30),
            topic_alias: Some(4),
            content_type: Some("application/json".into()),
            response_topic: Some("reply/here".into()),
            correlation_data: Some(Bytes::from_static(b"\x01\x02")),
            subscription_identifiers: vec![1, 200_000],
            user_properties: vec![("k".into(), "v".into())],
            ..Default::default()
        };
        assert_eq!(round_trip(&props), props);
    }

    #[test]
    fn duplicate_scalar_property_rejected() {
        // session expiry interval twice
        let raw = [
            0x0A, 0x11, 0, 0, 0, 1, 0x11, 0, 0, 0, 2,
        ];
        assert!(matches!(
            Properties::decode(&raw),
            Err(DecodeError::InvalidProperty(0x11))
        ));
    }

    #[test]
    fn zero_receive_maximum_rejected() {
        let raw = [0x03, 0x21, 0x00, 0x00];
        assert!(matches!(
            Properties::decode(&raw),
            Err(DecodeError::InvalidProperty(0x21))
        ));
    }

    #[test]
    fn unknown_property_rejected() {
        let raw = [0x02, 0x7E, 0x00];
        assert!(matches!(
            Properties::decode(&raw),
            Err(DecodeError::InvalidProperty(0x7E))
        ));
    }

    #[test]
    fn truncated_block_rejected() {
        let raw = [0x04, 0x11, 0x00];
        assert!(Properties::decode(&raw).is_err());
    }
}
