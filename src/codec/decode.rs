//! MQTT packet decoder
//!
//! Incremental: `decode` returns `Ok(None)` until a full packet is
//! buffered, then the typed packet and the bytes to consume. Malformed
//! input is rejected eagerly with a `DecodeError` so the connection can be
//! torn down with the right reason code.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, SubscribeFilter,
    SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

/// Stateful packet decoder for one connection.
pub struct Decoder {
    max_packet_size: usize,
    /// Locked in by the CONNECT packet; gates v5-only constructs.
    protocol_version: Option<ProtocolVersion>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Try to decode one packet from the front of `buf`.
    /// Returns `(packet, bytes_consumed)` when a complete packet is present.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first = buf[0];
        let packet_type = first >> 4;
        let flags = first & 0x0F;

        let (remaining, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let remaining = remaining as usize;

        if remaining > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total = 1 + len_bytes + remaining;
        if buf.len() < total {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total];

        let packet = match packet_type {
            1 => self.decode_connect(flags, body)?,
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => Packet::PubAck(self.decode_ack(flags, 0x00, body, PubAck::with_reason)?),
            5 => Packet::PubRec(self.decode_ack(flags, 0x00, body, PubRec::with_reason)?),
            6 => Packet::PubRel(self.decode_ack(flags, 0x02, body, PubRel::with_reason)?),
            7 => Packet::PubComp(self.decode_ack(flags, 0x00, body, PubComp::with_reason)?),
            8 => self.decode_subscribe(flags, body)?,
            9 => self.decode_suback(flags, body)?,
            10 => self.decode_unsubscribe(flags, body)?,
            11 => self.decode_unsuback(flags, body)?,
            12 => {
                self.require_flags(flags, 0x00)?;
                Packet::PingReq
            }
            13 => {
                self.require_flags(flags, 0x00)?;
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, body)?,
            15 => self.decode_auth(flags, body)?,
            other => return Err(DecodeError::InvalidPacketType(other)),
        };

        Ok(Some((packet, total)))
    }

    #[inline]
    fn require_flags(&self, flags: u8, expected: u8) -> Result<(), DecodeError> {
        if flags != expected {
            return Err(DecodeError::InvalidFlags);
        }
        Ok(())
    }

    fn decode_connect(&mut self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x00)?;
        let mut pos = 0;

        let (name, n) = read_string(&body[pos..])?;
        pos += n;
        if name != "MQTT" && name != "MQIsdp" {
            return Err(DecodeError::InvalidProtocolName);
        }

        let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        let version = match level {
            3 | 4 => ProtocolVersion::V311,
            5 => ProtocolVersion::V5,
            other => return Err(DecodeError::InvalidProtocolVersion(other)),
        };
        self.protocol_version = Some(version);

        let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let clean_start = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        if !username_flag && password_flag && version == ProtocolVersion::V311 {
            return Err(DecodeError::InvalidFlags);
        }
        if will_qos > 2 {
            return Err(DecodeError::InvalidQoS(will_qos));
        }
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        if body.len() < pos + 2 {
            return Err(DecodeError::InsufficientData);
        }
        let keep_alive = u16::from_be_bytes([body[pos], body[pos + 1]]);
        pos += 2;

        let properties = if version.is_v5() {
            let (props, n) = Properties::decode(&body[pos..])?;
            pos += n;
            props
        } else {
            Properties::default()
        };

        let (client_id, n) = read_string(&body[pos..])?;
        pos += n;
        let client_id = client_id.to_string();

        let will = if will_flag {
            let will_properties = if version.is_v5() {
                let (props, n) = Properties::decode(&body[pos..])?;
                pos += n;
                props
            } else {
                Properties::default()
            };
            let (topic, n) = read_string(&body[pos..])?;
            let topic = topic.to_string();
            pos += n;
            let (payload, n) = read_binary(&body[pos..])?;
            let payload = Bytes::copy_from_slice(payload);
            pos += n;
            Some(Will {
                topic,
                payload,
                // validated against 0..=2 above
                qos: QoS::from_u8(will_qos).unwrap(),
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, n) = read_string(&body[pos..])?;
            pos += n;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, n) = read_binary(&body[pos..])?;
            pos += n;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        if pos != body.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version: version,
            client_id,
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x00)?;
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        if (body[0] & 0xFE) != 0 {
            return Err(DecodeError::MalformedPacket("CONNACK acknowledge flags"));
        }
        let session_present = (body[0] & 0x01) != 0;
        let reason_code = if self.is_v5() {
            ReasonCode::from_u8(body[1]).ok_or(DecodeError::MalformedPacket("CONNACK reason"))?
        } else {
            ReasonCode::Success
        };
        let properties = if self.is_v5() {
            Properties::decode(&body[2..])?.0
        } else {
            Properties::default()
        };
        Ok(Packet::ConnAck(ConnAck {
            session_present,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;
        let (topic, n) = read_string(&body[pos..])?;
        let topic: Arc<str> = Arc::from(topic);
        pos += n;

        let packet_id = if qos != QoS::AtMostOnce {
            if body.len() < pos + 2 {
                return Err(DecodeError::InsufficientData);
            }
            let id = u16::from_be_bytes([body[pos], body[pos + 1]]);
            pos += 2;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id zero"));
            }
            Some(id)
        } else {
            None
        };

        let properties = if self.is_v5() {
            let (props, n) = Properties::decode(&body[pos..])?;
            pos += n;
            props
        } else {
            Properties::default()
        };

        let payload = Bytes::copy_from_slice(&body[pos..]);

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
            properties,
        }))
    }

    /// Shared body decoder for PUBACK/PUBREC/PUBREL/PUBCOMP.
    ///
    /// v3.1.1 bodies are exactly a packet id; v5 optionally appends a
    /// reason code and properties.
    fn decode_ack<T>(
        &self,
        flags: u8,
        expected_flags: u8,
        body: &[u8],
        build: fn(u16, ReasonCode) -> T,
    ) -> Result<T, DecodeError> {
        self.require_flags(flags, expected_flags)?;
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id zero"));
        }

        let reason_code = if self.is_v5() && body.len() > 2 {
            ReasonCode::from_u8(body[2]).ok_or(DecodeError::MalformedPacket("ack reason"))?
        } else {
            ReasonCode::Success
        };
        if self.is_v5() && body.len() > 3 {
            // Properties are decoded for validity but not retained; the
            // session layer keys acks purely on packet id + reason.
            Properties::decode(&body[3..])?;
        }
        Ok(build(packet_id, reason_code))
    }

    fn decode_subscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x02)?;
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id zero"));
        }
        let mut pos = 2;

        let properties = if self.is_v5() {
            let (props, n) = Properties::decode(&body[pos..])?;
            pos += n;
            props
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, n) = read_string(&body[pos..])?;
            let filter = filter.to_string();
            pos += n;
            let byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            // v3.1.1 defines only the QoS bits; anything else is malformed.
            if !self.is_v5() && (byte & 0xFC) != 0 {
                return Err(DecodeError::InvalidFlags);
            }
            let options =
                SubscriptionOptions::from_byte(byte).ok_or(DecodeError::InvalidFlags)?;
            filters.push(SubscribeFilter { filter, options });
        }
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x00)?;
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        let mut pos = 2;
        let properties = if self.is_v5() {
            let (props, n) = Properties::decode(&body[pos..])?;
            pos += n;
            props
        } else {
            Properties::default()
        };
        let mut reason_codes = Vec::with_capacity(body.len() - pos);
        for &b in &body[pos..] {
            reason_codes
                .push(ReasonCode::from_u8(b).ok_or(DecodeError::MalformedPacket("SUBACK code"))?);
        }
        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x02)?;
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id zero"));
        }
        let mut pos = 2;
        let properties = if self.is_v5() {
            let (props, n) = Properties::decode(&body[pos..])?;
            pos += n;
            props
        } else {
            Properties::default()
        };
        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, n) = read_string(&body[pos..])?;
            filters.push(filter.to_string());
            pos += n;
        }
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without filters"));
        }
        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x00)?;
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        let mut pos = 2;
        let properties = if self.is_v5() {
            let (props, n) = Properties::decode(&body[pos..])?;
            pos += n;
            props
        } else {
            Properties::default()
        };
        let mut reason_codes = Vec::new();
        for &b in &body[pos..] {
            reason_codes.push(
                ReasonCode::from_u8(b).ok_or(DecodeError::MalformedPacket("UNSUBACK code"))?,
            );
        }
        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x00)?;
        if !self.is_v5() || body.is_empty() {
            return Ok(Packet::Disconnect(Disconnect::default()));
        }
        let reason_code =
            ReasonCode::from_u8(body[0]).ok_or(DecodeError::MalformedPacket("DISCONNECT reason"))?;
        let properties = if body.len() > 1 {
            Properties::decode(&body[1..])?.0
        } else {
            Properties::default()
        };
        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }

    fn decode_auth(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        self.require_flags(flags, 0x00)?;
        if !self.is_v5() {
            // AUTH does not exist in v3.1.1.
            return Err(DecodeError::InvalidPacketType(15));
        }
        if body.is_empty() {
            return Ok(Packet::Auth(Auth::default()));
        }
        let reason_code =
            ReasonCode::from_u8(body[0]).ok_or(DecodeError::MalformedPacket("AUTH reason"))?;
        let properties = if body.len() > 1 {
            Properties::decode(&body[1..])?.0
        } else {
            Properties::default()
        };
        Ok(Packet::Auth(Auth {
            reason_code,
            properties,
        }))
    }
}
