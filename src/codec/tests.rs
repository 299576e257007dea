//! Codec round-trip and malformed-input tests

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use super::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, PubAck, PubRel,
    Publish, QoS, ReasonCode, RetainHandling, SubAck, Subscribe, SubscribeFilter,
    SubscriptionOptions, Unsubscribe, Will,
};

fn round_trip(packet: Packet, version: ProtocolVersion) -> Packet {
    let mut encoder = Encoder::new();
    encoder.set_protocol_version(version);
    let mut buf = BytesMut::new();
    encoder.encode(&packet, &mut buf).unwrap();

    let mut decoder = Decoder::new();
    decoder.set_protocol_version(version);
    let (decoded, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(consumed, buf.len());
    decoded
}

#[test]
fn variable_int_round_trip() {
    for value in [0u32, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 268_435_455] {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        let (decoded, consumed) = read_variable_int(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buf.len());
    }
}

#[test]
fn variable_int_rejects_five_bytes() {
    let buf = [0x80, 0x80, 0x80, 0x80, 0x01];
    assert_eq!(
        read_variable_int(&buf),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn variable_int_incomplete_wants_more() {
    assert_eq!(
        read_variable_int(&[0x80]),
        Err(DecodeError::InsufficientData)
    );
}

#[test]
fn connect_v311_round_trip() {
    let connect = Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "sensor-17".into(),
        clean_start: false,
        keep_alive: 30,
        username: Some("u".into()),
        password: Some(Bytes::from_static(b"pw")),
        will: Some(Will {
            topic: "status/sensor-17".into(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: Properties::default(),
        }),
        properties: Properties::default(),
    };
    let decoded = round_trip(Packet::Connect(Box::new(connect.clone())), ProtocolVersion::V311);
    assert_eq!(decoded, Packet::Connect(Box::new(connect)));
}

#[test]
fn connect_v5_with_properties_round_trip() {
    let connect = Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "c1".into(),
        clean_start: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
        properties: Properties {
            session_expiry_interval: Some(3600),
            receive_maximum: Some(16),
            topic_alias_maximum: Some(8),
            ..Default::default()
        },
    };
    let decoded = round_trip(Packet::Connect(Box::new(connect.clone())), ProtocolVersion::V5);
    assert_eq!(decoded, Packet::Connect(Box::new(connect)));
}

#[test]
fn publish_qos0_round_trip() {
    let publish = Publish {
        topic: Arc::from("a/b/c"),
        payload: Bytes::from_static(b"hello"),
        ..Default::default()
    };
    let decoded = round_trip(Packet::Publish(publish.clone()), ProtocolVersion::V311);
    assert_eq!(decoded, Packet::Publish(publish));
}

#[test]
fn publish_qos2_v5_round_trip() {
    let publish = Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: true,
        topic: Arc::from("x"),
        packet_id: Some(7),
        payload: Bytes::from_static(b"p"),
        properties: Properties {
            message_expiry_interval: Some(10),
            subscription_identifiers: vec![3],
            ..Default::default()
        },
    };
    let decoded = round_trip(Packet::Publish(publish.clone()), ProtocolVersion::V5);
    assert_eq!(decoded, Packet::Publish(publish));
}

#[test]
fn publish_dup_on_qos0_rejected() {
    // DUP=1 with QoS 0 is a malformed fixed header.
    let raw = [0x38, 0x05, 0x00, 0x01, b'a', b'x', b'y'];
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    assert_eq!(decoder.decode(&raw), Err(DecodeError::InvalidFlags));
}

#[test]
fn publish_packet_id_zero_rejected() {
    // QoS 1 PUBLISH with packet id 0.
    let raw = [0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    assert!(matches!(
        decoder.decode(&raw),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn puback_v5_short_form_is_success() {
    let decoded = round_trip(
        Packet::PubAck(PubAck::new(42)),
        ProtocolVersion::V5,
    );
    match decoded {
        Packet::PubAck(a) => {
            assert_eq!(a.packet_id, 42);
            assert_eq!(a.reason_code, ReasonCode::Success);
        }
        other => panic!("expected PUBACK, got {other:?}"),
    }
}

#[test]
fn puback_v5_error_reason_round_trip() {
    let decoded = round_trip(
        Packet::PubAck(PubAck::with_reason(9, ReasonCode::QuotaExceeded)),
        ProtocolVersion::V5,
    );
    match decoded {
        Packet::PubAck(a) => assert_eq!(a.reason_code, ReasonCode::QuotaExceeded),
        other => panic!("expected PUBACK, got {other:?}"),
    }
}

#[test]
fn pubrel_requires_flag_bit_one() {
    // PUBREL must carry fixed-header flags 0b0010.
    let raw = [0x60, 0x02, 0x00, 0x01];
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    assert_eq!(decoder.decode(&raw), Err(DecodeError::InvalidFlags));

    let decoded = round_trip(Packet::PubRel(PubRel::new(1)), ProtocolVersion::V311);
    assert!(matches!(decoded, Packet::PubRel(_)));
}

#[test]
fn subscribe_v5_round_trip() {
    let subscribe = Subscribe {
        packet_id: 11,
        filters: vec![
            SubscribeFilter {
                filter: "a/+/c".into(),
                options: SubscriptionOptions {
                    qos: QoS::AtLeastOnce,
                    no_local: true,
                    retain_as_published: false,
                    retain_handling: RetainHandling::SendIfNew,
                },
            },
            SubscribeFilter {
                filter: "#".into(),
                options: SubscriptionOptions::default(),
            },
        ],
        properties: Properties {
            subscription_identifiers: vec![5],
            ..Default::default()
        },
    };
    let decoded = round_trip(Packet::Subscribe(subscribe.clone()), ProtocolVersion::V5);
    assert_eq!(decoded, Packet::Subscribe(subscribe));
}

#[test]
fn subscribe_v311_reserved_option_bits_rejected() {
    // no_local bit set on a v3.1.1 SUBSCRIBE.
    let raw = [
        0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x05,
    ];
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    assert_eq!(decoder.decode(&raw), Err(DecodeError::InvalidFlags));
}

#[test]
fn subscribe_without_filters_rejected() {
    let raw = [0x82, 0x02, 0x00, 0x01];
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    assert!(matches!(
        decoder.decode(&raw),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn suback_round_trip_both_versions() {
    let suback = SubAck {
        packet_id: 3,
        reason_codes: vec![ReasonCode::GrantedQoS1, ReasonCode::UnspecifiedError],
        properties: Properties::default(),
    };
    let decoded = round_trip(Packet::SubAck(suback.clone()), ProtocolVersion::V5);
    assert_eq!(decoded, Packet::SubAck(suback.clone()));

    // v3 collapses error codes to 0x80.
    let decoded = round_trip(Packet::SubAck(suback), ProtocolVersion::V311);
    match decoded {
        Packet::SubAck(s) => {
            assert_eq!(
                s.reason_codes,
                vec![ReasonCode::GrantedQoS1, ReasonCode::UnspecifiedError]
            );
        }
        other => panic!("expected SUBACK, got {other:?}"),
    }
}

#[test]
fn unsubscribe_round_trip() {
    let unsubscribe = Unsubscribe {
        packet_id: 4,
        filters: vec!["a/b".into(), "c/#".into()],
        properties: Properties::default(),
    };
    let decoded = round_trip(Packet::Unsubscribe(unsubscribe.clone()), ProtocolVersion::V311);
    assert_eq!(decoded, Packet::Unsubscribe(unsubscribe));
}

#[test]
fn ping_round_trip() {
    assert_eq!(round_trip(Packet::PingReq, ProtocolVersion::V311), Packet::PingReq);
    assert_eq!(round_trip(Packet::PingResp, ProtocolVersion::V311), Packet::PingResp);
}

#[test]
fn disconnect_v5_reason_round_trip() {
    let decoded = round_trip(
        Packet::Disconnect(Disconnect::with_reason(ReasonCode::SessionTakenOver)),
        ProtocolVersion::V5,
    );
    match decoded {
        Packet::Disconnect(d) => assert_eq!(d.reason_code, ReasonCode::SessionTakenOver),
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
}

#[test]
fn disconnect_v311_is_header_only() {
    let mut encoder = Encoder::new();
    encoder.set_protocol_version(ProtocolVersion::V311);
    let mut buf = BytesMut::new();
    encoder
        .encode(&Packet::Disconnect(Disconnect::default()), &mut buf)
        .unwrap();
    assert_eq!(&buf[..], &[0xE0, 0x00]);
}

#[test]
fn partial_packet_returns_none() {
    let mut encoder = Encoder::new();
    encoder.set_protocol_version(ProtocolVersion::V311);
    let mut buf = BytesMut::new();
    let publish = Publish {
        topic: Arc::from("t"),
        payload: Bytes::from_static(b"0123456789"),
        ..Default::default()
    };
    encoder.encode(&Packet::Publish(publish), &mut buf).unwrap();

    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    for cut in 0..buf.len() {
        assert_eq!(decoder.decode(&buf[..cut]).unwrap(), None, "cut at {cut}");
    }
    assert!(decoder.decode(&buf).unwrap().is_some());
}

#[test]
fn oversized_packet_rejected() {
    let mut decoder = Decoder::new().with_max_packet_size(16);
    decoder.set_protocol_version(ProtocolVersion::V311);
    // Remaining length 100 > 16.
    let raw = [0x30, 0x64, 0x00];
    assert_eq!(decoder.decode(&raw), Err(DecodeError::PacketTooLarge));
}

#[test]
fn invalid_utf8_topic_rejected() {
    let raw = [0x30, 0x04, 0x00, 0x02, 0xC3, 0x28];
    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    assert_eq!(decoder.decode(&raw), Err(DecodeError::InvalidUtf8));
}

#[test]
fn connect_rejects_unknown_protocol_level() {
    // CONNECT with protocol level 9.
    let raw = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x09, 0x02, 0x00, 0x3C, 0x00, 0x00,
    ];
    let mut decoder = Decoder::new();
    assert_eq!(
        decoder.decode(&raw),
        Err(DecodeError::InvalidProtocolVersion(9))
    );
}

#[test]
fn two_packets_in_one_buffer_decode_sequentially() {
    let mut encoder = Encoder::new();
    encoder.set_protocol_version(ProtocolVersion::V311);
    let mut buf = BytesMut::new();
    encoder.encode(&Packet::PingReq, &mut buf).unwrap();
    encoder.encode(&Packet::PingResp, &mut buf).unwrap();

    let mut decoder = Decoder::new();
    decoder.set_protocol_version(ProtocolVersion::V311);
    let (first, n) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, m) = decoder.decode(&buf[n..]).unwrap().unwrap();
    assert_eq!(second, Packet::PingResp);
    assert_eq!(n + m, buf.len());
}
