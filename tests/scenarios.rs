//! End-to-end broker scenarios
//!
//! Drives real connections through the full broker stack (codec,
//! session machine, router, stores) over in-process duplex pipes, with a
//! minimal MQTT client built on the crate's own codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;

use stratomq::broker::{Broker, BrokerConfig, Connection, Stores};
use stratomq::codec::{Decoder, Encoder};
use stratomq::protocol::{
    Connect, Disconnect, Packet, Properties, ProtocolVersion, PubAck, PubComp, PubRel, Publish,
    QoS, ReasonCode, RetainHandling, Subscribe, SubscribeFilter, SubscriptionOptions, Unsubscribe,
    Will,
};
use stratomq::store::{MemoryBackend, QueueStore};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

struct TestBroker {
    broker: Arc<Broker>,
    backend: Arc<MemoryBackend>,
    shutdown: broadcast::Sender<()>,
}

async fn start_broker() -> TestBroker {
    start_broker_with(BrokerConfig::default()).await
}

async fn start_broker_with(config: BrokerConfig) -> TestBroker {
    let backend = Arc::new(MemoryBackend::new());
    let stores = Stores {
        retained: backend.clone(),
        sessions: backend.clone(),
        queues: backend.clone(),
        archive: Some(backend.clone()),
    };
    let broker = Broker::with_stores(config, "n1", stores).await.unwrap();
    let (shutdown, _) = broadcast::channel(4);
    TestBroker {
        broker,
        backend,
        shutdown,
    }
}

impl TestBroker {
    /// Open a client pipe into the broker.
    fn open(&self) -> TestClient {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let broker = self.broker.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
            let mut connection = Connection::new(server_side, addr, broker);
            let _ = connection.run(shutdown_rx).await;
        });
        TestClient::new(client_side)
    }
}

/// Minimal MQTT client over a duplex pipe.
struct TestClient {
    stream: DuplexStream,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl TestClient {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf).unwrap();
        self.stream.write_all(&self.write_buf).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a packet")
    }

    async fn recv_inner(&mut self) -> Packet {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf).unwrap() {
                self.read_buf.advance(consumed);
                return packet;
            }
            let n = self.stream.read_buf(&mut self.read_buf).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a packet");
        }
    }

    /// Expect silence on the wire for `window`.
    async fn expect_nothing(&mut self, window: Duration) {
        let result = tokio::time::timeout(window, self.recv_inner()).await;
        if let Ok(packet) = result {
            panic!("expected no packet, got {packet:?}");
        }
    }

    async fn connect(
        &mut self,
        client_id: &str,
        clean_start: bool,
        session_expiry: Option<u32>,
    ) -> stratomq::protocol::ConnAck {
        self.connect_with(client_id, clean_start, session_expiry, None).await
    }

    async fn connect_with(
        &mut self,
        client_id: &str,
        clean_start: bool,
        session_expiry: Option<u32>,
        will: Option<Will>,
    ) -> stratomq::protocol::ConnAck {
        self.decoder.set_protocol_version(ProtocolVersion::V5);
        self.encoder.set_protocol_version(ProtocolVersion::V5);
        let connect = Connect {
            protocol_version: ProtocolVersion::V5,
            client_id: client_id.to_string(),
            clean_start,
            keep_alive: 60,
            username: None,
            password: None,
            will,
            properties: Properties {
                session_expiry_interval: session_expiry,
                ..Default::default()
            },
        };
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Packet::ConnAck(ack) => ack,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    async fn subscribe_opts(
        &mut self,
        packet_id: u16,
        filter: &str,
        options: SubscriptionOptions,
    ) -> Vec<ReasonCode> {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![SubscribeFilter {
                filter: filter.to_string(),
                options,
            }],
            properties: Properties::default(),
        }))
        .await;
        match self.recv().await {
            Packet::SubAck(ack) => {
                assert_eq!(ack.packet_id, packet_id);
                ack.reason_codes
            }
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> Vec<ReasonCode> {
        self.subscribe_opts(
            packet_id,
            filter,
            SubscriptionOptions {
                qos,
                ..Default::default()
            },
        )
        .await
    }

    /// QoS 0 publish (fire and forget).
    async fn publish_qos0(&mut self, topic: &str, payload: &[u8], retain: bool) {
        self.send(&Packet::Publish(Publish {
            qos: QoS::AtMostOnce,
            retain,
            topic: Arc::from(topic),
            payload: Bytes::copy_from_slice(payload),
            ..Default::default()
        }))
        .await;
    }

    /// QoS 1 publish; returns the PUBACK reason.
    async fn publish_qos1(
        &mut self,
        packet_id: u16,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> ReasonCode {
        self.publish_qos1_props(packet_id, topic, payload, retain, Properties::default())
            .await
    }

    async fn publish_qos1_props(
        &mut self,
        packet_id: u16,
        topic: &str,
        payload: &[u8],
        retain: bool,
        properties: Properties,
    ) -> ReasonCode {
        self.send(&Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            retain,
            topic: Arc::from(topic),
            packet_id: Some(packet_id),
            payload: Bytes::copy_from_slice(payload),
            properties,
            ..Default::default()
        }))
        .await;
        match self.recv().await {
            Packet::PubAck(ack) => {
                assert_eq!(ack.packet_id, packet_id);
                ack.reason_code
            }
            other => panic!("expected PUBACK, got {other:?}"),
        }
    }

    /// Full QoS 2 publish handshake.
    async fn publish_qos2(&mut self, packet_id: u16, topic: &str, payload: &[u8]) {
        self.send(&Packet::Publish(Publish {
            qos: QoS::ExactlyOnce,
            topic: Arc::from(topic),
            packet_id: Some(packet_id),
            payload: Bytes::copy_from_slice(payload),
            ..Default::default()
        }))
        .await;
        match self.recv().await {
            Packet::PubRec(rec) => assert_eq!(rec.packet_id, packet_id),
            other => panic!("expected PUBREC, got {other:?}"),
        }
        self.send(&Packet::PubRel(PubRel::new(packet_id))).await;
        match self.recv().await {
            Packet::PubComp(comp) => assert_eq!(comp.packet_id, packet_id),
            other => panic!("expected PUBCOMP, got {other:?}"),
        }
    }

    /// Receive a PUBLISH, acknowledging per its QoS.
    async fn recv_publish(&mut self) -> Publish {
        loop {
            match self.recv().await {
                Packet::Publish(publish) => {
                    match publish.qos {
                        QoS::AtMostOnce => {}
                        QoS::AtLeastOnce => {
                            self.send(&Packet::PubAck(PubAck::new(publish.packet_id.unwrap())))
                                .await;
                        }
                        QoS::ExactlyOnce => {
                            let id = publish.packet_id.unwrap();
                            self.send(&Packet::PubRec(stratomq::protocol::PubRec::new(id)))
                                .await;
                            loop {
                                match self.recv().await {
                                    Packet::PubRel(rel) if rel.packet_id == id => break,
                                    Packet::Publish(_) => continue,
                                    other => panic!("expected PUBREL, got {other:?}"),
                                }
                            }
                            self.send(&Packet::PubComp(PubComp::new(id))).await;
                        }
                    }
                    return publish;
                }
                other => panic!("expected PUBLISH, got {other:?}"),
            }
        }
    }

    async fn disconnect(&mut self) {
        self.send(&Packet::Disconnect(Disconnect::default())).await;
    }
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn retained_wildcard_replay() {
    let fixture = start_broker().await;

    let mut publisher = fixture.open();
    publisher.connect("c1", true, None).await;
    assert_eq!(
        publisher.publish_qos1(1, "sensors/a/temp", b"23", true).await,
        ReasonCode::NoMatchingSubscribers
    );
    publisher.publish_qos1(2, "sensors/b/temp", b"25", true).await;

    let mut subscriber = fixture.open();
    subscriber.connect("c2", true, None).await;
    let granted = subscriber.subscribe(1, "sensors/+/temp", QoS::AtLeastOnce).await;
    assert_eq!(granted, vec![ReasonCode::GrantedQoS1]);

    let first = subscriber.recv_publish().await;
    let second = subscriber.recv_publish().await;
    let mut payloads = vec![first.payload.clone(), second.payload.clone()];
    payloads.sort();
    assert_eq!(payloads, vec![Bytes::from_static(b"23"), Bytes::from_static(b"25")]);
    assert!(first.retain && second.retain);
    assert_eq!(first.qos, QoS::AtLeastOnce);
    assert_eq!(second.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn retained_delete_leaves_nothing() {
    let fixture = start_broker().await;

    let mut publisher = fixture.open();
    publisher.connect("c1", true, None).await;
    publisher.publish_qos0("x", b"v", true).await;
    publisher.publish_qos0("x", b"", true).await;

    let mut subscriber = fixture.open();
    subscriber.connect("c2", true, None).await;
    subscriber.subscribe(1, "x", QoS::AtMostOnce).await;
    subscriber.expect_nothing(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn qos2_redelivery_across_reconnect() {
    let fixture = start_broker().await;

    // C1 subscribes with a persistent session, then drops the transport.
    let mut c1 = fixture.open();
    c1.connect("c1", false, Some(3600)).await;
    c1.subscribe(1, "t/#", QoS::ExactlyOnce).await;
    drop(c1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // C2 publishes QoS 2 while C1 is away.
    let mut c2 = fixture.open();
    c2.connect("c2", true, None).await;
    c2.publish_qos2(1, "t/a", b"p").await;

    // C1 returns: the queued message arrives once, DUP=0, full handshake.
    let mut c1 = fixture.open();
    let ack = c1.connect("c1", false, Some(3600)).await;
    assert!(ack.session_present);
    let publish = c1.recv_publish().await;
    assert_eq!(publish.topic.as_ref(), "t/a");
    assert_eq!(publish.payload, Bytes::from_static(b"p"));
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    assert!(!publish.dup);
    c1.expect_nothing(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn expired_message_never_delivered() {
    let fixture = start_broker().await;

    let mut c2 = fixture.open();
    c2.connect("c2", false, Some(3600)).await;
    c2.subscribe(1, "e/#", QoS::AtLeastOnce).await;
    drop(c2);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut c1 = fixture.open();
    c1.connect("c1", true, None).await;
    let properties = Properties {
        message_expiry_interval: Some(1),
        ..Default::default()
    };
    c1.publish_qos1_props(1, "e/1", b"x", false, properties).await;

    // Wall-clock expiry: the queue deadline is in unix seconds.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut c2 = fixture.open();
    let ack = c2.connect("c2", false, Some(3600)).await;
    assert!(ack.session_present);
    c2.expect_nothing(Duration::from_millis(300)).await;

    // The entry was purged from the queue store, not just skipped.
    let remaining = fixture.backend.read_from("c2", 0, 10).await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn shared_subscription_distributes_once_each() {
    let fixture = start_broker().await;

    let mut members = Vec::new();
    for name in ["ca", "cb", "cc"] {
        let mut client = fixture.open();
        client.connect(name, true, None).await;
        client.subscribe(1, "$share/g/orders", QoS::AtLeastOnce).await;
        members.push(client);
    }

    let mut publisher = fixture.open();
    publisher.connect("pub", true, None).await;
    for (i, payload) in [b"1", b"2", b"3"].iter().enumerate() {
        publisher
            .publish_qos1(i as u16 + 1, "orders", *payload, false)
            .await;
    }

    let mut seen = Vec::new();
    for member in &mut members {
        let publish = member.recv_publish().await;
        seen.push(publish.payload.clone());
        member.expect_nothing(Duration::from_millis(200)).await;
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            Bytes::from_static(b"1"),
            Bytes::from_static(b"2"),
            Bytes::from_static(b"3")
        ]
    );
}

#[tokio::test]
async fn no_local_suppresses_own_messages() {
    let fixture = start_broker().await;

    let mut client = fixture.open();
    client.connect("c1", true, None).await;
    client
        .subscribe_opts(
            1,
            "loop/t",
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                no_local: true,
                ..Default::default()
            },
        )
        .await;
    client.publish_qos1(2, "loop/t", b"self", false).await;
    client.expect_nothing(Duration::from_millis(300)).await;

    let mut other = fixture.open();
    other.connect("c2", true, None).await;
    other.publish_qos1(1, "loop/t", b"peer", false).await;
    let publish = client.recv_publish().await;
    assert_eq!(publish.payload, Bytes::from_static(b"peer"));
}

#[tokio::test]
async fn retain_handling_modes() {
    let fixture = start_broker().await;

    let mut publisher = fixture.open();
    publisher.connect("pub", true, None).await;
    publisher.publish_qos1(1, "rh/t", b"r", true).await;

    // RH=2: never replay.
    let mut client = fixture.open();
    client.connect("c-never", true, None).await;
    client
        .subscribe_opts(
            1,
            "rh/t",
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                retain_handling: RetainHandling::Never,
                ..Default::default()
            },
        )
        .await;
    client.expect_nothing(Duration::from_millis(300)).await;

    // RH=1: replay only when the subscription is new.
    let mut client = fixture.open();
    client.connect("c-ifnew", true, None).await;
    let opts = SubscriptionOptions {
        qos: QoS::AtLeastOnce,
        retain_handling: RetainHandling::SendIfNew,
        ..Default::default()
    };
    client.subscribe_opts(1, "rh/t", opts).await;
    let publish = client.recv_publish().await;
    assert!(publish.retain);

    // Re-subscribing the same filter is a replacement: no replay.
    client.subscribe_opts(2, "rh/t", opts).await;
    client.expect_nothing(Duration::from_millis(300)).await;

    // RH=0: replay every time.
    let mut client = fixture.open();
    client.connect("c-always", true, None).await;
    let opts = SubscriptionOptions {
        qos: QoS::AtLeastOnce,
        retain_handling: RetainHandling::SendAlways,
        ..Default::default()
    };
    client.subscribe_opts(1, "rh/t", opts).await;
    client.recv_publish().await;
    client.subscribe_opts(2, "rh/t", opts).await;
    client.recv_publish().await;
}

#[tokio::test]
async fn qos_downgraded_to_subscription() {
    let fixture = start_broker().await;

    let mut subscriber = fixture.open();
    subscriber.connect("sub", true, None).await;
    subscriber.subscribe(1, "dg/t", QoS::AtMostOnce).await;

    let mut publisher = fixture.open();
    publisher.connect("pub", true, None).await;
    publisher.publish_qos1(1, "dg/t", b"x", false).await;

    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(publish.packet_id.is_none());
}

#[tokio::test]
async fn session_takeover_disconnects_previous() {
    let fixture = start_broker().await;

    let mut first = fixture.open();
    first.connect("same-id", true, None).await;

    let mut second = fixture.open();
    second.connect("same-id", true, None).await;

    // The first connection is told the session was taken over.
    match first.recv().await {
        Packet::Disconnect(d) => assert_eq!(d.reason_code, ReasonCode::SessionTakenOver),
        other => panic!("expected DISCONNECT, got {other:?}"),
    }

    // The new connection works normally.
    second.subscribe(1, "alive", QoS::AtMostOnce).await;
}

#[tokio::test]
async fn will_published_on_ungraceful_close() {
    let fixture = start_broker().await;

    let mut watcher = fixture.open();
    watcher.connect("watcher", true, None).await;
    watcher.subscribe(1, "status/+", QoS::AtLeastOnce).await;

    let will = Will {
        topic: "status/c1".to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtLeastOnce,
        retain: false,
        properties: Properties::default(),
    };
    let mut dying = fixture.open();
    dying.connect_with("c1", true, None, Some(will)).await;
    drop(dying);

    let publish = watcher.recv_publish().await;
    assert_eq!(publish.topic.as_ref(), "status/c1");
    assert_eq!(publish.payload, Bytes::from_static(b"gone"));
}

#[tokio::test]
async fn clean_disconnect_suppresses_will() {
    let fixture = start_broker().await;

    let mut watcher = fixture.open();
    watcher.connect("watcher", true, None).await;
    watcher.subscribe(1, "status/+", QoS::AtLeastOnce).await;

    let will = Will {
        topic: "status/c1".to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtLeastOnce,
        retain: false,
        properties: Properties::default(),
    };
    let mut leaving = fixture.open();
    leaving.connect_with("c1", true, None, Some(will)).await;
    leaving.disconnect().await;

    watcher.expect_nothing(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let fixture = start_broker().await;

    let mut subscriber = fixture.open();
    subscriber.connect("sub", true, None).await;
    subscriber.subscribe(1, "u/t", QoS::AtLeastOnce).await;

    let mut publisher = fixture.open();
    publisher.connect("pub", true, None).await;
    publisher.publish_qos1(1, "u/t", b"first", false).await;
    subscriber.recv_publish().await;

    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["u/t".to_string()],
            properties: Properties::default(),
        }))
        .await;
    match subscriber.recv().await {
        Packet::UnsubAck(ack) => {
            assert_eq!(ack.reason_codes, vec![ReasonCode::Success]);
        }
        other => panic!("expected UNSUBACK, got {other:?}"),
    }

    publisher.publish_qos1(2, "u/t", b"second", false).await;
    subscriber.expect_nothing(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn queued_messages_flow_in_order() {
    let fixture = start_broker().await;

    let mut subscriber = fixture.open();
    subscriber.connect("slow", false, Some(3600)).await;
    subscriber.subscribe(1, "ord/#", QoS::AtLeastOnce).await;
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut publisher = fixture.open();
    publisher.connect("pub", true, None).await;
    for i in 1..=5u16 {
        publisher
            .publish_qos1(i, "ord/x", format!("m{i}").as_bytes(), false)
            .await;
    }

    let mut subscriber = fixture.open();
    subscriber.connect("slow", false, Some(3600)).await;
    for i in 1..=5u16 {
        let publish = subscriber.recv_publish().await;
        assert_eq!(publish.payload, Bytes::from(format!("m{i}")));
    }
}

#[tokio::test]
async fn clean_start_purges_previous_queue() {
    let fixture = start_broker().await;

    let mut subscriber = fixture.open();
    subscriber.connect("cs", false, Some(3600)).await;
    subscriber.subscribe(1, "cs/#", QoS::AtLeastOnce).await;
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut publisher = fixture.open();
    publisher.connect("pub", true, None).await;
    publisher.publish_qos1(1, "cs/x", b"stale", false).await;

    // Clean start throws the queue and subscriptions away.
    let mut subscriber = fixture.open();
    let ack = subscriber.connect("cs", true, None).await;
    assert!(!ack.session_present);
    subscriber.expect_nothing(Duration::from_millis(300)).await;
    assert!(fixture.backend.read_from("cs", 0, 10).await.unwrap().is_empty());
}
