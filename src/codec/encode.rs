//! MQTT packet encoder
//!
//! Each packet body is built in a scratch buffer, then framed with the
//! fixed header and remaining-length varint. Version differences (v5
//! properties, ack reason codes, v3 CONNACK return codes) are applied
//! here so the rest of the broker works with one packet shape.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Auth, ConnAck, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, Publish, QoS,
    ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Stateful packet encoder for one connection.
#[derive(Default)]
pub struct Encoder {
    protocol_version: Option<ProtocolVersion>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Encode `packet` and append the framed bytes to `buf`.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(64);
        let first_byte = match packet {
            Packet::Connect(c) => {
                self.encode_connect(c, &mut body)?;
                0x10
            }
            Packet::ConnAck(c) => {
                self.encode_connack(c, &mut body)?;
                0x20
            }
            Packet::Publish(p) => {
                self.encode_publish_body(p, &mut body)?;
                publish_first_byte(p)
            }
            Packet::PubAck(a) => {
                self.encode_ack(a.packet_id, a.reason_code, &mut body)?;
                0x40
            }
            Packet::PubRec(a) => {
                self.encode_ack(a.packet_id, a.reason_code, &mut body)?;
                0x50
            }
            Packet::PubRel(a) => {
                self.encode_ack(a.packet_id, a.reason_code, &mut body)?;
                0x62
            }
            Packet::PubComp(a) => {
                self.encode_ack(a.packet_id, a.reason_code, &mut body)?;
                0x70
            }
            Packet::Subscribe(s) => {
                self.encode_subscribe(s, &mut body)?;
                0x82
            }
            Packet::SubAck(s) => {
                self.encode_suback(s, &mut body)?;
                0x90
            }
            Packet::Unsubscribe(u) => {
                self.encode_unsubscribe(u, &mut body)?;
                0xA2
            }
            Packet::UnsubAck(u) => {
                self.encode_unsuback(u, &mut body)?;
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect(d) => {
                self.encode_disconnect(d, &mut body)?;
                0xE0
            }
            Packet::Auth(a) => {
                self.encode_auth(a, &mut body)?;
                0xF0
            }
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn encode_connect(&self, c: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, "MQTT")?;
        body.put_u8(c.protocol_version as u8);

        let mut flags = 0u8;
        if c.clean_start {
            flags |= 0x02;
        }
        if let Some(ref will) = c.will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if c.password.is_some() {
            flags |= 0x40;
        }
        if c.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(c.keep_alive);

        if c.protocol_version.is_v5() {
            c.properties.encode(body)?;
        }
        write_string(body, &c.client_id)?;
        if let Some(ref will) = c.will {
            if c.protocol_version.is_v5() {
                will.properties.encode(body)?;
            }
            write_string(body, &will.topic)?;
            write_binary(body, &will.payload)?;
        }
        if let Some(ref username) = c.username {
            write_string(body, username)?;
        }
        if let Some(ref password) = c.password {
            write_binary(body, password)?;
        }
        Ok(())
    }

    fn encode_connack(&self, c: &ConnAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u8(c.session_present as u8);
        if self.is_v5() {
            body.put_u8(c.reason_code as u8);
            c.properties.encode(body)?;
        } else {
            body.put_u8(c.reason_code.to_v3_connack_code());
        }
        Ok(())
    }

    fn encode_publish_body(&self, p: &Publish, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, &p.topic)?;
        if p.qos != QoS::AtMostOnce {
            // Session layer assigns packet ids before encoding.
            body.put_u16(p.packet_id.unwrap_or(0));
        }
        if self.is_v5() {
            p.properties.encode(body)?;
        }
        body.put_slice(&p.payload);
        Ok(())
    }

    fn encode_ack(
        &self,
        packet_id: u16,
        reason: ReasonCode,
        body: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        body.put_u16(packet_id);
        if self.is_v5() && reason != ReasonCode::Success {
            // The short form (packet id only) implies success.
            body.put_u8(reason as u8);
        }
        Ok(())
    }

    fn encode_subscribe(&self, s: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(s.packet_id);
        if self.is_v5() {
            s.properties.encode(body)?;
        }
        for f in &s.filters {
            write_string(body, &f.filter)?;
            let byte = if self.is_v5() {
                f.options.to_byte()
            } else {
                f.options.qos as u8
            };
            body.put_u8(byte);
        }
        Ok(())
    }

    fn encode_suback(&self, s: &SubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(s.packet_id);
        if self.is_v5() {
            s.properties.encode(body)?;
        }
        for &code in &s.reason_codes {
            let byte = if self.is_v5() {
                code as u8
            } else {
                // v3.1.1 return codes: granted QoS or 0x80 failure.
                match code {
                    ReasonCode::Success => 0x00,
                    ReasonCode::GrantedQoS1 => 0x01,
                    ReasonCode::GrantedQoS2 => 0x02,
                    _ => 0x80,
                }
            };
            body.put_u8(byte);
        }
        Ok(())
    }

    fn encode_unsubscribe(&self, u: &Unsubscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(u.packet_id);
        if self.is_v5() {
            u.properties.encode(body)?;
        }
        for filter in &u.filters {
            write_string(body, filter)?;
        }
        Ok(())
    }

    fn encode_unsuback(&self, u: &UnsubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(u.packet_id);
        if self.is_v5() {
            u.properties.encode(body)?;
            for &code in &u.reason_codes {
                body.put_u8(code as u8);
            }
        }
        // v3.1.1 UNSUBACK has no payload.
        Ok(())
    }

    fn encode_disconnect(&self, d: &Disconnect, body: &mut BytesMut) -> Result<(), EncodeError> {
        if self.is_v5() && d.reason_code != ReasonCode::Success {
            body.put_u8(d.reason_code as u8);
            d.properties.encode(body)?;
        }
        // v3.1.1 DISCONNECT (and v5 normal disconnection) is header-only.
        Ok(())
    }

    fn encode_auth(&self, a: &Auth, body: &mut BytesMut) -> Result<(), EncodeError> {
        if a.reason_code != ReasonCode::Success {
            body.put_u8(a.reason_code as u8);
            a.properties.encode(body)?;
        }
        Ok(())
    }
}

#[inline]
fn publish_first_byte(p: &Publish) -> u8 {
    let mut b = 0x30;
    if p.dup {
        b |= 0x08;
    }
    b |= (p.qos as u8) << 1;
    if p.retain {
        b |= 0x01;
    }
    b
}
