//! Drain: unsubscribe every active subscription, let in-flight
//! deliveries finish, flush outstanding publishes, then close — all
//! within the caller's deadline.

mod support;

use petrel_core::{ConnState, ConnectOptions, Connection};
use petrel_transport_tcp::TcpDialer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::mock_broker::MockBroker;

#[test]
fn drain_closes_after_unsubscribing_and_flushing() {
    let broker = MockBroker::start("INFO {\"server_id\":\"d1\",\"max_payload\":1048576}\r\n");
    let conn = Connection::connect(
        ConnectOptions {
            url: Some(broker.url()),
            allow_reconnect: false,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        Arc::new(TcpDialer::default()),
    )
    .expect("connect");
    broker.recv_frame(Duration::from_secs(1)); // CONNECT
    broker.recv_frame(Duration::from_secs(1)); // PING

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered2 = delivered.clone();
    conn.subscribe(
        "orders.new",
        None,
        Some(Arc::new(move |_msg| {
            delivered2.fetch_add(1, Ordering::SeqCst);
        })),
        Default::default(),
    )
    .expect("subscribe");
    broker.recv_frame(Duration::from_secs(1)); // SUB

    conn.publish("orders.new", None, b"before-drain", None).expect("publish");
    broker.recv_frame(Duration::from_secs(1)); // PUB, looped back by the broker as MSG

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while delivered.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    conn.drain(Duration::from_secs(2)).expect("drain completes within its deadline");
    assert_eq!(conn.state(), ConnState::Closed);
}

#[test]
fn publish_is_rejected_while_draining() {
    let broker = MockBroker::start("INFO {\"server_id\":\"d2\",\"max_payload\":1048576}\r\n");
    let conn = Connection::connect(
        ConnectOptions {
            url: Some(broker.url()),
            allow_reconnect: false,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        Arc::new(TcpDialer::default()),
    )
    .expect("connect");
    broker.recv_frame(Duration::from_secs(1)); // CONNECT
    broker.recv_frame(Duration::from_secs(1)); // PING

    // A handler that sleeps holds the subscription "in handler" long
    // enough for the draining window to be observable from this thread.
    conn.subscribe(
        "orders.new",
        None,
        Some(Arc::new(|_msg| std::thread::sleep(Duration::from_millis(400)))),
        Default::default(),
    )
    .expect("subscribe");
    broker.recv_frame(Duration::from_secs(1)); // SUB

    conn.publish("orders.new", None, b"wake-the-handler", None).expect("publish");
    broker.recv_frame(Duration::from_secs(1)); // PUB, looped back by the broker as MSG

    // Give the dispatcher a moment to pick the delivery up and enter the
    // handler before draining starts.
    std::thread::sleep(Duration::from_millis(100));

    let conn2 = conn.clone();
    let drainer = std::thread::spawn(move || conn2.drain(Duration::from_secs(2)));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(conn.state(), ConnState::DrainingSubs);

    let err = conn
        .publish("orders.new", None, b"rejected", None)
        .expect_err("publish must be rejected while draining");
    assert_eq!(err.kind(), petrel_core::ErrorKind::Draining);

    drainer.join().unwrap().expect("drain completes within its deadline");
    assert_eq!(conn.state(), ConnState::Closed);
}
