//! End-to-end pub/sub and request/reply against a scripted
//! single-connection broker, including the max-payload enforcement
//! boundary.

mod support;

use petrel_core::{ConnectOptions, Connection};
use petrel_transport_tcp::TcpDialer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::mock_broker::{ClientFrame, MockBroker};

fn connect_options(url: &str) -> ConnectOptions {
    ConnectOptions {
        url: Some(url.to_string()),
        allow_reconnect: false,
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[test]
fn publishes_are_observed_by_the_broker_byte_exact() {
    let broker = MockBroker::start("INFO {\"server_id\":\"t1\",\"max_payload\":1048576}\r\n");
    let conn = Connection::connect(connect_options(&broker.url()), Arc::new(TcpDialer::default()))
        .expect("connect");

    broker.recv_frame(Duration::from_secs(1)); // CONNECT
    broker.recv_frame(Duration::from_secs(1)); // PING

    conn.publish("orders.new", None, b"hello world", None).expect("publish");
    let frame = broker.recv_frame(Duration::from_secs(1));
    assert_eq!(
        frame,
        ClientFrame::Pub {
            subject: "orders.new".to_string(),
            reply: None,
            payload: b"hello world".to_vec(),
        }
    );
}

#[test]
fn subscriber_receives_a_loopback_publish() {
    let broker = MockBroker::start("INFO {\"server_id\":\"t2\",\"max_payload\":1048576}\r\n");
    let conn = Connection::connect(connect_options(&broker.url()), Arc::new(TcpDialer::default()))
        .expect("connect");
    broker.recv_frame(Duration::from_secs(1)); // CONNECT
    broker.recv_frame(Duration::from_secs(1)); // PING

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    conn.subscribe(
        "orders.new",
        None,
        Some(Arc::new(move |msg| {
            received2.lock().unwrap().push(msg.payload().to_vec());
            count2.fetch_add(1, Ordering::SeqCst);
        })),
        Default::default(),
    )
    .expect("subscribe");
    broker.recv_frame(Duration::from_secs(1)); // SUB

    conn.publish("orders.new", None, b"payload-a", None).expect("publish");
    broker.recv_frame(Duration::from_secs(1)); // PUB observed by broker, which loops it back

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(received.lock().unwrap().as_slice(), &[b"payload-a".to_vec()]);
}

#[test]
fn request_reply_round_trip() {
    let broker = MockBroker::start("INFO {\"server_id\":\"t3\",\"max_payload\":1048576}\r\n");
    let conn = Connection::connect(connect_options(&broker.url()), Arc::new(TcpDialer::default()))
        .expect("connect");
    broker.recv_frame(Duration::from_secs(1)); // CONNECT
    broker.recv_frame(Duration::from_secs(1)); // PING

    let conn2 = conn.clone();
    let responder = std::thread::spawn(move || conn2.request("svc.ping", b"ping", Duration::from_secs(2)));

    // The request's lazy inbox SUB (its sid is what MSG must target to
    // route back to the waiting caller), then the PUB carrying the request.
    let mut inbox_sid = None;
    let mut saw_pub = false;
    for _ in 0..4 {
        match broker.recv_frame(Duration::from_secs(1)) {
            ClientFrame::Sub { sid, .. } => inbox_sid = Some(sid),
            ClientFrame::Pub { subject, reply, payload } => {
                assert_eq!(subject, "svc.ping");
                assert_eq!(payload, b"ping");
                let reply = reply.expect("request carries a reply subject");
                let sid = inbox_sid.expect("inbox SUB must precede the request PUB");
                broker.inject(format!("MSG {reply} {sid} 4\r\npong\r\n").into_bytes());
                saw_pub = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(saw_pub, "expected to observe the request's PUB frame");

    let reply = responder.join().unwrap().expect("request resolves");
    assert_eq!(reply.payload(), b"pong");
}

#[test]
fn oversized_payload_is_rejected_before_touching_the_wire() {
    let broker = MockBroker::start("INFO {\"server_id\":\"t4\",\"max_payload\":1048576}\r\n");
    let conn = Connection::connect(connect_options(&broker.url()), Arc::new(TcpDialer::default()))
        .expect("connect");
    broker.recv_frame(Duration::from_secs(1)); // CONNECT
    broker.recv_frame(Duration::from_secs(1)); // PING

    let ok_payload = vec![0u8; 1_048_576];
    conn.publish("orders.new", None, &ok_payload, None)
        .expect("exactly max_payload bytes is allowed");
    broker.recv_frame(Duration::from_secs(1));

    let too_big = vec![0u8; 1_048_577];
    let err = conn
        .publish("orders.new", None, &too_big, None)
        .expect_err("one byte over max_payload must be rejected");
    assert_eq!(err.kind(), petrel_core::ErrorKind::MaxPayloadExceeded);
}
