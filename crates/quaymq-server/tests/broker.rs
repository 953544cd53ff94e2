//! End-to-end tests over loopback TCP.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use quaymq_core::{
    decode_packet, encode, Connack, ConnackCode, Connect, Packet, Publish, QoS, Subscribe,
    Unsubscribe, Will,
};
use quaymq_server::{Broker, Config};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

fn start_with(configure: impl FnOnce(&mut Config)) -> (Broker, SocketAddr) {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1:0".parse().unwrap();
    config.auth.allow_anonymous = true;
    configure(&mut config);
    let mut broker = Broker::new(config).unwrap();
    let addr = broker.start().unwrap();
    (broker, addr)
}

fn start() -> (Broker, SocketAddr) {
    start_with(|_| {})
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + READ_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn connect_with(addr: SocketAddr, connect: Connect) -> (Self, Connack) {
        let mut client = Self::open(addr);
        client.send(&Packet::Connect(connect));
        match client.recv() {
            Packet::Connack(connack) => (client, connack),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    fn connect(addr: SocketAddr, client_id: &str) -> Self {
        let (client, connack) = Self::connect_with(addr, Connect::new(client_id, true, 0));
        assert_eq!(connack.code, ConnackCode::Accepted);
        client
    }

    fn send(&mut self, packet: &Packet) {
        self.stream.write_all(&encode(packet)).unwrap();
    }

    fn recv_within(&mut self, timeout: Duration) -> Option<Packet> {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let result = loop {
            if let Some((packet, used)) = decode_packet(&self.buf, 0).unwrap() {
                self.buf.drain(..used);
                break Some(packet);
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => break None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break None
                }
                Err(e) => panic!("read failed: {}", e),
            }
        };
        self.stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        result
    }

    fn recv(&mut self) -> Packet {
        self.recv_within(READ_TIMEOUT)
            .expect("no packet before timeout")
    }

    fn recv_publish(&mut self) -> Publish {
        match self.recv() {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> Vec<u8> {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            topics: vec![(filter.to_string(), qos)],
        }));
        match self.recv() {
            Packet::Suback(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback.return_codes
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    fn publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) {
        let mut publish = Publish::new(topic, payload, qos, false);
        publish.packet_id = packet_id;
        self.send(&Packet::Publish(publish));
    }

    /// True once the broker has closed the socket.
    fn is_closed(&mut self) -> bool {
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut chunk = [0u8; 256];
        while Instant::now() < deadline {
            match self.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return false
                }
                Err(_) => return true,
            }
        }
        false
    }
}

#[test]
fn pingreq_gets_two_byte_pingresp() {
    let (_broker, addr) = start();
    let mut client = TestClient::connect(addr, "pinger");
    client.send(&Packet::Pingreq);

    let mut raw = [0u8; 2];
    client.stream.read_exact(&mut raw).unwrap();
    assert_eq!(raw, [0xD0, 0x00]);
}

#[test]
fn first_packet_must_be_connect() {
    let (broker, addr) = start();
    let mut client = TestClient::open(addr);
    client.send(&Packet::Pingreq);
    assert!(client.is_closed());
    assert!(wait_for(|| broker.connection_count() == 0));
}

#[test]
fn second_connect_is_a_violation() {
    let (_broker, addr) = start();
    let mut client = TestClient::connect(addr, "twice");
    client.send(&Packet::Connect(Connect::new("twice", true, 0)));
    assert!(client.is_closed());
}

#[test]
fn unsupported_protocol_level_is_refused() {
    let (_broker, addr) = start();
    let mut connect = Connect::new("v5", true, 0);
    connect.protocol_level = 5;
    let (mut client, connack) = TestClient::connect_with(addr, connect);
    assert_eq!(connack.code, ConnackCode::UnacceptableProtocolVersion);
    assert!(!connack.session_present);
    assert!(client.is_closed());
}

#[test]
fn credentials_are_checked() {
    let (broker, addr) = start_with(|c| {
        c.auth.allow_anonymous = false;
        c.auth.credentials = "user:pass".into();
    });

    let (mut anon, connack) = TestClient::connect_with(addr, Connect::new("anon", true, 0));
    assert_eq!(connack.code, ConnackCode::NotAuthorized);
    assert!(anon.is_closed());

    let mut wrong = Connect::new("wrong", true, 0);
    wrong.username = Some("user".into());
    wrong.password = Some(b"nope".to_vec());
    let (mut client, connack) = TestClient::connect_with(addr, wrong);
    assert_eq!(connack.code, ConnackCode::BadUsernamePassword);
    assert!(client.is_closed());

    broker.add_credentials("late", "added");
    let mut right = Connect::new("right", true, 0);
    right.username = Some("late".into());
    right.password = Some(b"added".to_vec());
    let (_client, connack) = TestClient::connect_with(addr, right);
    assert_eq!(connack.code, ConnackCode::Accepted);
    assert_eq!(broker.session_count(), 1);
}

#[test]
fn empty_client_id_needs_clean_session() {
    let (_broker, addr) = start();
    let (_ok, connack) = TestClient::connect_with(addr, Connect::new("", true, 0));
    assert_eq!(connack.code, ConnackCode::Accepted);

    let (mut rejected, connack) = TestClient::connect_with(addr, Connect::new("", false, 0));
    assert_eq!(connack.code, ConnackCode::IdentifierRejected);
    assert!(rejected.is_closed());
}

#[test]
fn qos1_publish_is_acked_and_forwarded() {
    let (_broker, addr) = start();
    let mut sub = TestClient::connect(addr, "sub");
    assert_eq!(sub.subscribe(1, "sport/+/score", QoS::AtLeastOnce), vec![1]);

    let mut publisher = TestClient::connect(addr, "pub");
    publisher.publish("sport/tennis/score", b"15-0", QoS::AtLeastOnce, Some(7));
    assert_eq!(publisher.recv(), Packet::Puback { packet_id: 7 });

    let got = sub.recv_publish();
    assert_eq!(got.topic, "sport/tennis/score");
    assert_eq!(&got.payload[..], b"15-0");
    assert_eq!(got.qos, QoS::AtLeastOnce);
    assert!(!got.dup);
    let packet_id = got.packet_id.expect("QoS 1 delivery carries an id");
    sub.send(&Packet::Puback { packet_id });
    assert!(sub.recv_within(QUIET).is_none());
}

#[test]
fn qos2_inbound_duplicates_are_delivered_once() {
    let (_broker, addr) = start();
    let mut sub = TestClient::connect(addr, "sub2");
    assert_eq!(sub.subscribe(1, "exact/#", QoS::ExactlyOnce), vec![2]);

    let mut publisher = TestClient::connect(addr, "pub2");
    publisher.publish("exact/once", b"x", QoS::ExactlyOnce, Some(9));
    assert_eq!(publisher.recv(), Packet::Pubrec { packet_id: 9 });

    // held until PUBREL
    assert!(sub.recv_within(QUIET).is_none());

    let mut dup = Publish::new("exact/once", &b"x"[..], QoS::ExactlyOnce, false);
    dup.packet_id = Some(9);
    dup.dup = true;
    publisher.send(&Packet::Publish(dup));
    assert_eq!(publisher.recv(), Packet::Pubrec { packet_id: 9 });

    publisher.send(&Packet::Pubrel { packet_id: 9 });
    assert_eq!(publisher.recv(), Packet::Pubcomp { packet_id: 9 });

    let got = sub.recv_publish();
    assert_eq!(got.qos, QoS::ExactlyOnce);
    let packet_id = got.packet_id.unwrap();
    sub.send(&Packet::Pubrec { packet_id });
    assert_eq!(sub.recv(), Packet::Pubrel { packet_id });
    sub.send(&Packet::Pubcomp { packet_id });

    assert!(sub.recv_within(QUIET).is_none());
}

#[test]
fn unknown_pubrel_closes_connection() {
    let (_broker, addr) = start();
    let mut client = TestClient::connect(addr, "stray");
    client.send(&Packet::Pubrel { packet_id: 42 });
    assert!(client.is_closed());
}

#[test]
fn wildcard_publish_topic_closes_connection() {
    let (_broker, addr) = start();
    let mut client = TestClient::connect(addr, "wild");
    client.publish("a/+/b", b"x", QoS::AtMostOnce, None);
    assert!(client.is_closed());
}

#[test]
fn invalid_filter_gets_failure_code() {
    let (_broker, addr) = start();
    let mut client = TestClient::connect(addr, "filters");
    client.send(&Packet::Subscribe(Subscribe {
        packet_id: 3,
        topics: vec![
            ("ok/+".to_string(), QoS::AtLeastOnce),
            ("bad/#/tail".to_string(), QoS::AtMostOnce),
        ],
    }));
    match client.recv() {
        Packet::Suback(suback) => assert_eq!(suback.return_codes, vec![1, 0x80]),
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

#[test]
fn unsubscribe_stops_delivery() {
    let (_broker, addr) = start();
    let mut sub = TestClient::connect(addr, "unsub");
    sub.subscribe(1, "news", QoS::AtMostOnce);
    sub.send(&Packet::Unsubscribe(Unsubscribe {
        packet_id: 2,
        topics: vec!["news".into()],
    }));
    assert_eq!(sub.recv(), Packet::Unsuback { packet_id: 2 });

    let mut publisher = TestClient::connect(addr, "newsroom");
    publisher.publish("news", b"late", QoS::AtMostOnce, None);
    assert!(sub.recv_within(QUIET).is_none());
}

#[test]
fn retained_message_delivered_on_subscribe() {
    let (broker, addr) = start();
    let mut publisher = TestClient::connect(addr, "retainer");
    let mut retained = Publish::new("status/door", &b"open"[..], QoS::AtMostOnce, true);
    retained.packet_id = None;
    publisher.send(&Packet::Publish(retained));
    assert!(wait_for(|| broker.router().retained_count() == 1));

    let mut late = TestClient::connect(addr, "late");
    assert_eq!(late.subscribe(1, "status/+", QoS::AtLeastOnce), vec![1]);
    let got = late.recv_publish();
    assert!(got.retain);
    assert_eq!(got.topic, "status/door");
    assert_eq!(got.qos, QoS::AtMostOnce);
}

#[test]
fn duplicate_client_id_takes_over() {
    let (broker, addr) = start();
    let mut first = TestClient::connect(addr, "same");
    let mut second = TestClient::connect(addr, "same");

    assert!(first.is_closed());
    second.send(&Packet::Pingreq);
    assert_eq!(second.recv(), Packet::Pingresp);
    assert!(wait_for(|| broker.session_count() == 1));
}

fn will_connect(client_id: &str) -> Connect {
    let mut connect = Connect::new(client_id, true, 0);
    connect.will = Some(Will {
        topic: format!("clients/{}/status", client_id),
        message: "gone".into(),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    connect
}

#[test]
fn will_published_on_abrupt_close() {
    let (_broker, addr) = start();
    let mut watcher = TestClient::connect(addr, "watcher");
    watcher.subscribe(1, "clients/+/status", QoS::AtMostOnce);

    let (client, connack) = TestClient::connect_with(addr, will_connect("fragile"));
    assert_eq!(connack.code, ConnackCode::Accepted);
    drop(client);

    let got = watcher.recv_publish();
    assert_eq!(got.topic, "clients/fragile/status");
    assert_eq!(&got.payload[..], b"gone");
}

#[test]
fn will_discarded_on_disconnect() {
    let (broker, addr) = start();
    let mut watcher = TestClient::connect(addr, "watcher2");
    watcher.subscribe(1, "clients/+/status", QoS::AtMostOnce);

    let (mut client, _) = TestClient::connect_with(addr, will_connect("polite"));
    client.send(&Packet::Disconnect);
    assert!(client.is_closed());
    assert!(wait_for(|| broker.session_count() == 1));
    assert!(watcher.recv_within(QUIET).is_none());
}

#[test]
fn keep_alive_expiry_closes_and_fires_will() {
    let (_broker, addr) = start();
    let mut watcher = TestClient::connect(addr, "watcher3");
    watcher.subscribe(1, "clients/+/status", QoS::AtMostOnce);

    let mut connect = will_connect("sleepy");
    connect.keep_alive = 1;
    let (mut client, _) = TestClient::connect_with(addr, connect);

    // 1.5 x keep-alive without traffic
    let got = watcher.recv_publish();
    assert_eq!(got.topic, "clients/sleepy/status");
    assert!(client.is_closed());
}

#[test]
fn unacked_qos1_is_retransmitted_with_dup() {
    let (_broker, addr) = start_with(|c| c.qos.ack_timeout_secs = 1);
    let mut sub = TestClient::connect(addr, "slow");
    sub.subscribe(1, "retry", QoS::AtLeastOnce);

    let mut publisher = TestClient::connect(addr, "eager");
    publisher.publish("retry", b"again", QoS::AtLeastOnce, Some(1));
    assert_eq!(publisher.recv(), Packet::Puback { packet_id: 1 });

    let first = sub.recv_publish();
    assert!(!first.dup);
    let resent = sub.recv_publish();
    assert!(resent.dup);
    assert_eq!(resent.packet_id, first.packet_id);
    assert_eq!(resent.payload, first.payload);

    sub.send(&Packet::Puback {
        packet_id: first.packet_id.unwrap(),
    });
    assert!(sub.recv_within(Duration::from_millis(1500)).is_none());
}

#[test]
fn inflight_window_holds_back_extra_messages() {
    let (_broker, addr) = start_with(|c| c.limits.max_inflight = 1);
    let mut sub = TestClient::connect(addr, "narrow");
    sub.subscribe(1, "window", QoS::AtLeastOnce);

    let mut publisher = TestClient::connect(addr, "burst");
    publisher.publish("window", b"1", QoS::AtLeastOnce, Some(1));
    publisher.publish("window", b"2", QoS::AtLeastOnce, Some(2));
    assert_eq!(publisher.recv(), Packet::Puback { packet_id: 1 });
    assert_eq!(publisher.recv(), Packet::Puback { packet_id: 2 });

    let first = sub.recv_publish();
    assert_eq!(&first.payload[..], b"1");
    assert!(sub.recv_within(QUIET).is_none());

    sub.send(&Packet::Puback {
        packet_id: first.packet_id.unwrap(),
    });
    let second = sub.recv_publish();
    assert_eq!(&second.payload[..], b"2");
}

#[test]
fn persistent_session_receives_missed_messages() {
    let (broker, addr) = start();
    let (mut sub, connack) = TestClient::connect_with(addr, Connect::new("keeper", false, 0));
    assert!(!connack.session_present);
    sub.subscribe(1, "mail", QoS::AtLeastOnce);
    sub.send(&Packet::Disconnect);
    assert!(sub.is_closed());
    assert!(wait_for(|| broker.session_count() == 0));

    let mut publisher = TestClient::connect(addr, "postman");
    publisher.publish("mail", b"letter", QoS::AtLeastOnce, Some(5));
    assert_eq!(publisher.recv(), Packet::Puback { packet_id: 5 });

    let (mut back, connack) = TestClient::connect_with(addr, Connect::new("keeper", false, 0));
    assert!(connack.session_present);
    let got = back.recv_publish();
    assert_eq!(&got.payload[..], b"letter");
    assert_eq!(got.qos, QoS::AtLeastOnce);
}

#[test]
fn stop_closes_every_connection() {
    let (mut broker, addr) = start();
    let mut a = TestClient::connect(addr, "a");
    let mut b = TestClient::open(addr);
    assert!(wait_for(|| broker.connection_count() == 2));

    broker.stop(Duration::from_secs(2));
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.session_count(), 0);
}

#[test]
fn stop_forces_connections_that_cannot_flush() {
    let (mut broker, addr) = start();

    // a subscriber that never reads, with a retained will
    let mut connect = will_connect("stalled");
    if let Some(will) = connect.will.as_mut() {
        will.retain = true;
    }
    let (mut stalled, connack) = TestClient::connect_with(addr, connect);
    assert_eq!(connack.code, ConnackCode::Accepted);
    stalled.subscribe(1, "flood", QoS::AtMostOnce);

    let mut publisher = TestClient::connect(addr, "flooder");
    let payload = vec![0x5a; 512 * 1024];
    for _ in 0..48 {
        publisher.send(&Packet::Publish(Publish::new(
            "flood",
            payload.clone(),
            QoS::AtMostOnce,
            false,
        )));
    }
    publisher.send(&Packet::Pingreq);
    assert_eq!(publisher.recv(), Packet::Pingresp);

    broker.stop(Duration::ZERO);
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.session_count(), 0);
    assert!(publisher.is_closed());
    assert!(stalled.is_closed());
    assert_eq!(broker.router().retained_count(), 0);
}
