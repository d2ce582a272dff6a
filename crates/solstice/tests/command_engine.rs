//! End-to-end tests for the command engine, driven packet by packet.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flume::Receiver;
use solstice::{Broker, BrokerConfig, BrokerStats, Conn, Credentials, Outcome};
use solstice_protocol::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, LastWill, Packet, PubAckPacket,
    PubCompPacket, PubRecPacket, PubRelPacket, PublishPacket, QoS, SubscribePacket,
    UnsubscribePacket,
};

fn broker() -> Broker {
    Broker::new(
        Arc::new(BrokerConfig::default()),
        Credentials::new(),
        Arc::new(BrokerStats::new()),
    )
}

fn broker_with_auth(credentials: Credentials) -> Broker {
    Broker::new(
        Arc::new(BrokerConfig::default().with_allow_anonymous(false)),
        credentials,
        Arc::new(BrokerStats::new()),
    )
}

/// A fake connection: the engine-facing half plus the fan-out channel a
/// real transport task would drain.
struct TestClient {
    conn: Conn,
    frames: Receiver<Bytes>,
}

impl TestClient {
    fn new(id: u64) -> Self {
        let (tx, rx) = flume::bounded(64);
        Self {
            conn: Conn::new(id, tx),
            frames: rx,
        }
    }

    /// Sends a CONNECT and asserts it was accepted.
    fn connect(&mut self, broker: &mut Broker, client_id: &str, clean_session: bool) {
        let connect = ConnectPacket::new(client_id).with_clean_session(clean_session);
        let outcome = broker.handle_command(&mut self.conn, Packet::Connect(Box::new(connect)));
        assert_eq!(outcome, Outcome::Reply);
        let staged = self.staged();
        assert_eq!(
            staged.last(),
            Some(&Packet::ConnAck(ConnAckPacket::new(
                false,
                ConnectReturnCode::Accepted
            )))
        );
    }

    fn subscribe(&mut self, broker: &mut Broker, filter: &str, qos: QoS) -> Vec<Packet> {
        let subscribe = SubscribePacket::new(1).add_filter(filter, qos);
        let outcome = broker.handle_command(&mut self.conn, Packet::Subscribe(subscribe));
        assert_eq!(outcome, Outcome::Reply);
        self.staged()
    }

    fn send(&mut self, broker: &mut Broker, packet: Packet) -> (Outcome, Vec<Packet>) {
        let outcome = broker.handle_command(&mut self.conn, packet);
        (outcome, self.staged())
    }

    /// Decodes everything the last handler staged for this connection.
    fn staged(&mut self) -> Vec<Packet> {
        match self.conn.take_staged() {
            Some(bytes) => decode_all(&bytes),
            None => Vec::new(),
        }
    }

    /// Decodes everything the fan-out handed to this connection's channel.
    fn delivered(&self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            packets.extend(decode_all(&frame));
        }
        packets
    }
}

fn decode_all(bytes: &[u8]) -> Vec<Packet> {
    let mut buf = BytesMut::from(bytes);
    let mut packets = Vec::new();
    while let Some(packet) = Packet::decode(&mut buf).unwrap() {
        packets.push(packet);
    }
    assert!(buf.is_empty(), "trailing bytes after decode");
    packets
}

fn publish(topic: &str, payload: &'static [u8]) -> PublishPacket {
    PublishPacket::new(topic, Bytes::from_static(payload))
}

#[test]
fn qos0_publish_reaches_subscriber_without_acks() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let mut b = TestClient::new(2);
    a.connect(&mut broker, "A", true);
    b.connect(&mut broker, "B", true);
    b.subscribe(&mut broker, "sensors/temp", QoS::AtMostOnce);

    let (outcome, staged) = a.send(
        &mut broker,
        Packet::Publish(publish("sensors/temp", b"23")),
    );
    assert_eq!(outcome, Outcome::NoReply);
    assert!(staged.is_empty(), "QoS 0 publish must not be acked");

    let delivered = b.delivered();
    assert_eq!(delivered.len(), 1);
    let Packet::Publish(ref msg) = delivered[0] else {
        panic!("expected PUBLISH, got {delivered:?}");
    };
    assert_eq!(msg.topic, "sensors/temp/");
    assert_eq!(msg.payload, Bytes::from_static(b"23"));
    assert_eq!(msg.qos, QoS::AtMostOnce);
    assert_eq!(msg.packet_id, None);
}

#[test]
fn qos1_publish_is_downgraded_to_subscriber_grant() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let mut b = TestClient::new(2);
    a.connect(&mut broker, "A", true);
    b.connect(&mut broker, "B", true);
    b.subscribe(&mut broker, "sensors/temp", QoS::AtMostOnce);

    let message = publish("sensors/temp", b"23").with_qos(QoS::AtLeastOnce, 42);
    let (outcome, staged) = a.send(&mut broker, Packet::Publish(message));
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged, vec![Packet::PubAck(PubAckPacket::new(42))]);

    let delivered = b.delivered();
    let Packet::Publish(ref msg) = delivered[0] else {
        panic!("expected PUBLISH");
    };
    assert_eq!(msg.qos, QoS::AtMostOnce);
    assert_eq!(msg.packet_id, None);
}

#[test]
fn qos2_inbound_handshake_tracks_and_releases_the_flow() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    a.connect(&mut broker, "A", true);

    let message = publish("sensors/temp", b"23").with_qos(QoS::ExactlyOnce, 7);
    let (outcome, staged) = a.send(&mut broker, Packet::Publish(message));
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged, vec![Packet::PubRec(PubRecPacket::new(7))]);
    {
        let session = broker.session("A").unwrap();
        assert!(session.inbound_inflight(7));
        assert!(session.has_inflight);
    }

    let (outcome, staged) = a.send(&mut broker, Packet::PubRel(PubRelPacket::new(7)));
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged, vec![Packet::PubComp(PubCompPacket::new(7))]);
    let session = broker.session("A").unwrap();
    assert!(!session.inbound_inflight(7));
    assert!(!session.has_inflight);
}

#[test]
fn qos2_outbound_handshake_completes_and_frees_all_slots() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let mut b = TestClient::new(2);
    a.connect(&mut broker, "A", true);
    b.connect(&mut broker, "B", true);
    b.subscribe(&mut broker, "events", QoS::ExactlyOnce);

    let message = publish("events", b"fired").with_qos(QoS::ExactlyOnce, 9);
    a.send(&mut broker, Packet::Publish(message));

    let delivered = b.delivered();
    let Packet::Publish(ref msg) = delivered[0] else {
        panic!("expected PUBLISH");
    };
    assert_eq!(msg.qos, QoS::ExactlyOnce);
    let mid = msg.packet_id.expect("QoS 2 delivery carries a packet id");
    assert!(broker.session("B").unwrap().outbound_inflight(mid));

    let (outcome, staged) = b.send(&mut broker, Packet::PubRec(PubRecPacket::new(mid)));
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged, vec![Packet::PubRel(PubRelPacket::new(mid))]);

    let (outcome, staged) = b.send(&mut broker, Packet::PubComp(PubCompPacket::new(mid)));
    assert_eq!(outcome, Outcome::NoReply);
    assert!(staged.is_empty());

    let session = broker.session("B").unwrap();
    assert!(!session.outbound_inflight(mid));
    assert!(!session.has_inflight);
}

#[test]
fn offline_persistent_session_queues_and_flushes_in_order() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let mut b = TestClient::new(2);
    a.connect(&mut broker, "A", true);
    b.connect(&mut broker, "B", false);
    b.subscribe(&mut broker, "x", QoS::AtLeastOnce);

    let (outcome, _) = b.send(&mut broker, Packet::Disconnect);
    assert_eq!(outcome, Outcome::Disconnect);
    broker.connection_closed(&mut b.conn, false);

    // The session survives the disconnect.
    assert!(!broker.session("B").unwrap().online);

    let message = publish("x", b"hi").with_qos(QoS::AtLeastOnce, 1);
    let (outcome, staged) = a.send(&mut broker, Packet::Publish(message));
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged, vec![Packet::PubAck(PubAckPacket::new(1))]);
    assert_eq!(broker.session("B").unwrap().queued_messages(), 1);

    // Reconnect: the queued PUBLISH is staged ahead of the CONNACK.
    let mut b2 = TestClient::new(3);
    let connect = ConnectPacket::new("B").with_clean_session(false);
    let (outcome, staged) = b2.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged.len(), 2);
    let Packet::Publish(ref queued) = staged[0] else {
        panic!("queued message must precede the CONNACK, got {staged:?}");
    };
    assert_eq!(queued.topic, "x/");
    assert_eq!(queued.payload, Bytes::from_static(b"hi"));
    assert_eq!(queued.qos, QoS::AtLeastOnce);
    let mid = queued.packet_id.expect("requeued QoS 1 message gets an id");
    assert!(matches!(staged[1], Packet::ConnAck(_)));

    let session = broker.session("B").unwrap();
    assert_eq!(session.queued_messages(), 0);
    assert!(session.outbound_inflight(mid));
    assert!(session.has_inflight);
}

#[test]
fn offline_clean_session_drops_messages() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let mut b = TestClient::new(2);
    a.connect(&mut broker, "A", true);
    b.connect(&mut broker, "B", true);
    b.subscribe(&mut broker, "x", QoS::AtLeastOnce);

    b.send(&mut broker, Packet::Disconnect);
    broker.connection_closed(&mut b.conn, false);

    // Clean session: destroyed at disconnect, nothing to queue into.
    assert!(broker.session("B").is_none());
    let message = publish("x", b"hi").with_qos(QoS::AtLeastOnce, 1);
    a.send(&mut broker, Packet::Publish(message));
}

#[test]
fn wildcard_subscribe_shares_one_record_and_replays_retained() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    a.connect(&mut broker, "A", true);
    a.send(
        &mut broker,
        Packet::Publish(publish("a/b", b"m1").with_retain(true)),
    );
    a.send(
        &mut broker,
        Packet::Publish(publish("a/c", b"m2").with_retain(true)),
    );

    let mut b = TestClient::new(2);
    b.connect(&mut broker, "B", true);
    let staged = b.subscribe(&mut broker, "a/#", QoS::AtLeastOnce);

    // Both retained messages are staged before the SUBACK.
    assert_eq!(staged.len(), 3);
    let mut payloads: Vec<Bytes> = staged[..2]
        .iter()
        .map(|p| match p {
            Packet::Publish(publish) => publish.payload.clone(),
            other => panic!("expected PUBLISH before SUBACK, got {other:?}"),
        })
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec![Bytes::from_static(b"m1"), Bytes::from_static(b"m2")]);
    assert!(matches!(staged[2], Packet::SubAck(_)));

    // One shared record across both concrete topics.
    let on_b = broker
        .topic("a/b/")
        .unwrap()
        .subscriber("B")
        .unwrap()
        .clone();
    let on_c = broker
        .topic("a/c/")
        .unwrap()
        .subscriber("B")
        .unwrap()
        .clone();
    assert!(Arc::ptr_eq(&on_b, &on_c));
    assert_eq!(on_b.refs(), 2);
    assert_eq!(on_b.qos, QoS::AtLeastOnce);

    // The prefix topic gets its own, unshared record.
    let on_prefix = broker
        .topic("a/")
        .unwrap()
        .subscriber("B")
        .unwrap()
        .clone();
    assert!(!Arc::ptr_eq(&on_b, &on_prefix));
    assert_eq!(on_prefix.refs(), 1);

    // Messages under the prefix now reach the wildcard subscriber.
    a.send(&mut broker, Packet::Publish(publish("a/b", b"live")));
    let delivered = b.delivered();
    assert_eq!(delivered.len(), 1);
}

#[test]
fn retained_message_is_replaced_and_cleared() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    a.connect(&mut broker, "A", true);

    a.send(
        &mut broker,
        Packet::Publish(publish("t", b"p1").with_retain(true)),
    );
    let retained = broker.topic("t/").unwrap().retained.clone().unwrap();
    let decoded = decode_all(&retained);
    let Packet::Publish(ref msg) = decoded[0] else {
        panic!("retained blob must be a PUBLISH frame");
    };
    assert_eq!(msg.payload, Bytes::from_static(b"p1"));
    assert!(msg.retain);

    a.send(
        &mut broker,
        Packet::Publish(publish("t", b"p2").with_retain(true)),
    );
    let retained = broker.topic("t/").unwrap().retained.clone().unwrap();
    let decoded = decode_all(&retained);
    let Packet::Publish(ref msg) = decoded[0] else {
        panic!("retained blob must be a PUBLISH frame");
    };
    assert_eq!(msg.payload, Bytes::from_static(b"p2"));

    // A zero-length retained payload clears the slot.
    a.send(
        &mut broker,
        Packet::Publish(publish("t", b"").with_retain(true)),
    );
    assert!(broker.topic("t/").unwrap().retained.is_none());
}

#[test]
fn duplicate_puback_is_a_noop() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let mut b = TestClient::new(2);
    a.connect(&mut broker, "A", true);
    b.connect(&mut broker, "B", true);
    b.subscribe(&mut broker, "t", QoS::AtLeastOnce);

    a.send(
        &mut broker,
        Packet::Publish(publish("t", b"x").with_qos(QoS::AtLeastOnce, 5)),
    );
    let delivered = b.delivered();
    let Packet::Publish(ref msg) = delivered[0] else {
        panic!("expected PUBLISH");
    };
    let mid = msg.packet_id.unwrap();

    let (outcome, _) = b.send(&mut broker, Packet::PubAck(PubAckPacket::new(mid)));
    assert_eq!(outcome, Outcome::NoReply);
    assert!(!broker.session("B").unwrap().has_inflight);

    // The second ack must neither panic nor resurrect state.
    let (outcome, staged) = b.send(&mut broker, Packet::PubAck(PubAckPacket::new(mid)));
    assert_eq!(outcome, Outcome::NoReply);
    assert!(staged.is_empty());
    assert!(!broker.session("B").unwrap().has_inflight);
}

#[test]
fn second_connect_for_a_live_client_id_is_rejected() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    a.connect(&mut broker, "dup", true);

    let mut intruder = TestClient::new(2);
    let connect = ConnectPacket::new("dup");
    let (outcome, staged) = intruder.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(outcome, Outcome::Disconnect);
    assert!(staged.is_empty());

    // Tearing the loser down must not touch the live session.
    broker.connection_closed(&mut intruder.conn, true);
    assert!(broker.session("dup").unwrap().online);
}

#[test]
fn second_connect_on_the_same_connection_is_a_violation() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    a.connect(&mut broker, "A", true);

    let connect = ConnectPacket::new("A2");
    let (outcome, _) = a.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(outcome, Outcome::Disconnect);
}

#[test]
fn packets_before_connect_are_violations() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let (outcome, _) = a.send(&mut broker, Packet::PingReq);
    assert_eq!(outcome, Outcome::Disconnect);
}

#[test]
fn pingreq_is_answered() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    a.connect(&mut broker, "A", true);
    let (outcome, staged) = a.send(&mut broker, Packet::PingReq);
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged, vec![Packet::PingResp]);
}

#[test]
fn unsubscribe_removes_the_subscription() {
    let mut broker = broker();
    let mut b = TestClient::new(1);
    b.connect(&mut broker, "B", true);
    b.subscribe(&mut broker, "t", QoS::AtMostOnce);
    assert_eq!(broker.topic("t/").unwrap().subscriber_count(), 1);

    let unsubscribe = UnsubscribePacket::new(3, vec!["t".into()]);
    let (outcome, staged) = b.send(&mut broker, Packet::Unsubscribe(unsubscribe));
    assert_eq!(outcome, Outcome::Reply);
    assert_eq!(staged.len(), 1);
    assert!(matches!(staged[0], Packet::UnsubAck(ref ack) if ack.packet_id == 3));

    assert_eq!(broker.topic("t/").unwrap().subscriber_count(), 0);
    assert!(broker.session("B").unwrap().subscriptions().is_empty());
}

#[test]
fn persistent_subscription_is_tracked_on_the_session() {
    let mut broker = broker();
    let mut b = TestClient::new(1);
    b.connect(&mut broker, "B", false);
    b.subscribe(&mut broker, "alpha/beta", QoS::AtLeastOnce);

    let session = broker.session("B").unwrap();
    assert_eq!(session.subscriptions(), ["alpha/beta/"]);
}

#[test]
fn will_fires_on_unexpected_disconnect_only() {
    let mut broker = broker();

    let mut watcher = TestClient::new(1);
    watcher.connect(&mut broker, "watcher", true);
    watcher.subscribe(&mut broker, "alerts", QoS::AtMostOnce);

    // Unexpected loss publishes the will.
    let mut doomed = TestClient::new(2);
    let connect = ConnectPacket::new("doomed").with_will(LastWill {
        topic: "alerts".into(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    let (outcome, _) = doomed.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(outcome, Outcome::Reply);
    broker.connection_closed(&mut doomed.conn, true);

    let delivered = watcher.delivered();
    assert_eq!(delivered.len(), 1);
    let Packet::Publish(ref will) = delivered[0] else {
        panic!("expected will PUBLISH");
    };
    assert_eq!(will.topic, "alerts/");
    assert_eq!(will.payload, Bytes::from_static(b"gone"));

    // A clean DISCONNECT discards the will.
    let mut polite = TestClient::new(3);
    let connect = ConnectPacket::new("polite").with_will(LastWill {
        topic: "alerts".into(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    polite.send(&mut broker, Packet::Connect(Box::new(connect)));
    polite.send(&mut broker, Packet::Disconnect);
    broker.connection_closed(&mut polite.conn, false);
    assert!(watcher.delivered().is_empty());
}

#[test]
fn retained_will_is_installed_at_connect() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let connect = ConnectPacket::new("A").with_will(LastWill {
        topic: "status/A".into(),
        payload: Bytes::from_static(b"offline"),
        qos: QoS::AtMostOnce,
        retain: true,
    });
    let (outcome, _) = a.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(outcome, Outcome::Reply);
    assert!(broker.topic("status/A/").unwrap().retained.is_some());
}

#[test]
fn anonymous_connect_is_rejected_when_auth_is_required() {
    let mut credentials = Credentials::new();
    credentials.add_user("alice", "secret").unwrap();
    let mut broker = broker_with_auth(credentials);

    let mut a = TestClient::new(1);
    let (outcome, staged) = a.send(&mut broker, Packet::Connect(Box::new(ConnectPacket::new("A"))));
    assert_eq!(
        outcome,
        Outcome::AuthReject(ConnectReturnCode::BadUsernameOrPassword)
    );
    assert_eq!(
        staged,
        vec![Packet::ConnAck(ConnAckPacket::new(
            false,
            ConnectReturnCode::BadUsernameOrPassword
        ))]
    );
}

#[test]
fn valid_credentials_are_accepted_and_wrong_ones_rejected() {
    let mut credentials = Credentials::new();
    credentials.add_user("alice", "secret").unwrap();
    let mut broker = broker_with_auth(credentials);

    let mut good = TestClient::new(1);
    let connect = ConnectPacket::new("good").with_credentials("alice", b"secret");
    let (outcome, _) = good.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(outcome, Outcome::Reply);

    let mut bad = TestClient::new(2);
    let connect = ConnectPacket::new("bad").with_credentials("alice", b"wrong");
    let (outcome, _) = bad.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(
        outcome,
        Outcome::AuthReject(ConnectReturnCode::BadUsernameOrPassword)
    );
}

#[test]
fn empty_client_id_cannot_resume_a_session() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let connect = ConnectPacket::new("").with_clean_session(false);
    let (outcome, staged) = a.send(&mut broker, Packet::Connect(Box::new(connect)));
    assert_eq!(outcome, Outcome::AuthReject(ConnectReturnCode::NotAuthorized));
    assert_eq!(
        staged,
        vec![Packet::ConnAck(ConnAckPacket::new(
            false,
            ConnectReturnCode::NotAuthorized
        ))]
    );
}

#[test]
fn empty_client_id_gets_a_generated_one() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let (outcome, _) = a.send(&mut broker, Packet::Connect(Box::new(ConnectPacket::new(""))));
    assert_eq!(outcome, Outcome::Reply);
    let client_id = a.conn.client_id().unwrap();
    assert!(client_id.starts_with("sol-"), "got {client_id}");
    assert!(broker.session(client_id).is_some());
}

#[test]
fn clean_reconnect_discards_previous_session_state() {
    let mut broker = broker();
    let mut a = TestClient::new(1);
    let mut b = TestClient::new(2);
    a.connect(&mut broker, "A", true);
    b.connect(&mut broker, "B", false);
    b.subscribe(&mut broker, "x", QoS::AtLeastOnce);

    broker.connection_closed(&mut b.conn, true);
    a.send(
        &mut broker,
        Packet::Publish(publish("x", b"queued").with_qos(QoS::AtLeastOnce, 1)),
    );
    assert_eq!(broker.session("B").unwrap().queued_messages(), 1);

    // Coming back clean drops the queue and the old subscriptions.
    let mut b2 = TestClient::new(3);
    b2.connect(&mut broker, "B", true);
    let session = broker.session("B").unwrap();
    assert_eq!(session.queued_messages(), 0);
    assert!(session.subscriptions().is_empty());
    assert_eq!(broker.topic("x/").unwrap().subscriber_count(), 0);
}
