//! Protocol-layer error types

use std::fmt;

/// Errors raised while decoding bytes into packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes buffered yet; retry after the next read.
    InsufficientData,
    /// Remaining-length field exceeds four bytes or overflows.
    InvalidRemainingLength,
    /// Unknown packet type nibble.
    InvalidPacketType(u8),
    /// Fixed-header flags invalid for the packet type.
    InvalidFlags,
    /// Protocol name was not "MQTT" / "MQIsdp".
    InvalidProtocolName,
    /// Unsupported protocol level byte.
    InvalidProtocolVersion(u8),
    /// QoS field outside 0..=2.
    InvalidQoS(u8),
    /// A string field was not valid UTF-8.
    InvalidUtf8,
    /// Packet exceeds the negotiated maximum packet size.
    PacketTooLarge,
    /// Unknown or duplicate v5 property.
    InvalidProperty(u8),
    /// Catch-all structural violation with a static description.
    MalformedPacket(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InsufficientData => write!(f, "insufficient data"),
            DecodeError::InvalidRemainingLength => write!(f, "invalid remaining length"),
            DecodeError::InvalidPacketType(t) => write!(f, "invalid packet type {t}"),
            DecodeError::InvalidFlags => write!(f, "invalid fixed header flags"),
            DecodeError::InvalidProtocolName => write!(f, "invalid protocol name"),
            DecodeError::InvalidProtocolVersion(v) => {
                write!(f, "unsupported protocol version {v}")
            }
            DecodeError::InvalidQoS(q) => write!(f, "invalid QoS {q}"),
            DecodeError::InvalidUtf8 => write!(f, "invalid UTF-8 in string"),
            DecodeError::PacketTooLarge => write!(f, "packet exceeds maximum size"),
            DecodeError::InvalidProperty(id) => write!(f, "invalid property 0x{id:02x}"),
            DecodeError::MalformedPacket(msg) => write!(f, "malformed packet: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised while encoding packets into bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Encoded remaining length would exceed the protocol maximum.
    PacketTooLarge,
    /// A string or binary field exceeds 65535 bytes.
    FieldTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::PacketTooLarge => write!(f, "packet exceeds maximum size"),
            EncodeError::FieldTooLong => write!(f, "string or binary field too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Semantic protocol violations detected above the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Client broke an MQTT rule; carries a static description.
    Violation(&'static str),
    /// A packet arrived that the current state forbids.
    UnexpectedPacket(&'static str),
    /// Encode failure surfaced at the session layer.
    Encode(EncodeError),
    /// Decode failure surfaced at the session layer.
    Decode(DecodeError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Violation(msg) => write!(f, "protocol violation: {msg}"),
            ProtocolError::UnexpectedPacket(msg) => write!(f, "unexpected packet: {msg}"),
            ProtocolError::Encode(e) => write!(f, "encode error: {e}"),
            ProtocolError::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}
