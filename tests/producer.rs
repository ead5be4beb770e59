use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_producer::{BrokerErrorKind, ClientError, ConnectionState, FrameEncoder, Payloads, Producer, ProducerOptions, SendOptions};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TOPIC: &str = "events";

/// Bind a mock broker on an ephemeral port, returning producer options which target it.
async fn mock_broker() -> (TcpListener, ProducerOptions) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock broker");
    let port = listener.local_addr().expect("local addr").port();
    (listener, ProducerOptions::default().host("127.0.0.1").port(port))
}

/// Read one length-prefixed frame, including its length prefix.
async fn read_frame(conn: &mut TcpStream) -> Bytes {
    let len = timeout(Duration::from_secs(5), conn.read_i32()).await.expect("timeout reading frame").expect("frame length");
    let mut body = vec![0u8; len as usize];
    conn.read_exact(&mut body).await.expect("frame body");
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_i32(len);
    frame.extend_from_slice(&body);
    frame.freeze()
}

async fn assert_no_connection(listener: &TcpListener) {
    let res = timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(res.is_err(), "expected no further connection to the broker");
}

fn expected_frame(options: &ProducerOptions, topic: &str, partition: i32, payloads: impl Into<Payloads>) -> Bytes {
    FrameEncoder::new(options).encode(topic, partition, &payloads.into().into_messages()).expect("encode")
}

#[tokio::test]
async fn first_send_opens_the_connection_and_writes_one_frame() {
    let (listener, options) = mock_broker().await;
    let producer = Producer::new(TOPIC, options.clone()).expect("producer");
    assert_eq!(producer.state(), ConnectionState::Absent);

    let (res, accepted) = tokio::join!(producer.send("hello", None), listener.accept());
    res.expect("send");
    let (mut conn, _) = accepted.expect("accept");

    // A lone payload is framed exactly like a one element sequence.
    assert_eq!(read_frame(&mut conn).await, expected_frame(&options, TOPIC, 0, vec!["hello"]));
    assert_eq!(producer.state(), ConnectionState::Established);
    assert_no_connection(&listener).await;
}

#[tokio::test]
async fn send_is_replayed_once_after_the_broker_closes_the_connection() {
    let (listener, options) = mock_broker().await;
    let producer = Producer::new(TOPIC, options.clone()).expect("producer");

    let (res, accepted) = tokio::join!(producer.connect(), listener.accept());
    res.expect("connect");
    drop(accepted.expect("accept"));

    let mut states = producer.state_changes();
    timeout(Duration::from_secs(5), states.wait_for(|state| *state == ConnectionState::Absent))
        .await
        .expect("timeout waiting for disconnect")
        .expect("state channel open");

    let (res, accepted) = tokio::join!(producer.send(vec!["x", "y"], None), listener.accept());
    res.expect("send after reconnect");
    let (mut conn, _) = accepted.expect("accept reconnect");
    assert_eq!(read_frame(&mut conn).await, expected_frame(&options, TOPIC, 0, vec!["x", "y"]));
    assert_eq!(producer.state(), ConnectionState::Established);
}

#[tokio::test]
async fn refused_reconnect_fails_the_send() {
    let (listener, options) = mock_broker().await;
    drop(listener);
    let producer = Producer::new(TOPIC, options).expect("producer");

    let err = timeout(Duration::from_secs(5), producer.send(vec!["x", "y"], None))
        .await
        .expect("send must not hang")
        .expect_err("broker refuses connections");
    assert!(matches!(err, ClientError::BrokerReconnect(_)), "unexpected error: {err:?}");
    assert_eq!(producer.state(), ConnectionState::Absent);

    // The producer stays usable, each send makes its own single attempt.
    let err = producer.send("z", None).await.expect_err("broker still refuses connections");
    assert!(matches!(err, ClientError::BrokerReconnect(_)));
    let err = producer.connect().await.expect_err("broker still refuses connections");
    assert!(matches!(err, ClientError::BrokerReconnect(_)));
}

#[tokio::test]
async fn concurrent_sends_share_a_single_reconnect() {
    let (listener, options) = mock_broker().await;
    let producer = Producer::new(TOPIC, options.clone()).expect("producer");
    let other = producer.clone();

    let (a, b, accepted) = tokio::join!(producer.send("a", None), other.send("b", None), listener.accept());
    a.expect("send a");
    b.expect("send b");
    let (mut conn, _) = accepted.expect("accept");

    let mut frames = vec![read_frame(&mut conn).await, read_frame(&mut conn).await];
    frames.sort();
    let mut expected = vec![expected_frame(&options, TOPIC, 0, "a"), expected_frame(&options, TOPIC, 0, "b")];
    expected.sort();
    assert_eq!(frames, expected);
    assert_no_connection(&listener).await;
}

#[tokio::test]
async fn concurrent_connects_open_one_connection() {
    let (listener, options) = mock_broker().await;
    let producer = Producer::new(TOPIC, options).expect("producer");

    let (a, b, accepted) = tokio::join!(producer.connect(), producer.connect(), listener.accept());
    a.expect("connect a");
    b.expect("connect b");
    let _conn = accepted.expect("accept");
    producer.connect().await.expect("connect while established");
    assert_no_connection(&listener).await;
}

#[tokio::test]
async fn send_options_override_topic_and_partition() {
    let (listener, options) = mock_broker().await;
    let producer = Producer::new(TOPIC, options.clone().partition(1)).expect("producer");
    assert_eq!(producer.partition(), 1);

    let opts = SendOptions::default().topic("audit").partition(7);
    let (res, accepted) = tokio::join!(producer.send("x", Some(opts)), listener.accept());
    res.expect("send");
    let (mut conn, _) = accepted.expect("accept");
    assert_eq!(read_frame(&mut conn).await, expected_frame(&options, "audit", 7, "x"));

    producer.send("y", Some(SendOptions::default().partition(0))).await.expect("send");
    assert_eq!(read_frame(&mut conn).await, expected_frame(&options, TOPIC, 0, "y"));
}

#[tokio::test]
async fn contract_violations_fail_without_touching_the_network() {
    let (listener, options) = mock_broker().await;
    assert!(matches!(Producer::new("", options.clone()), Err(ClientError::InvalidTopic)));
    let zero_keepalive = options.clone().keepalive(Duration::ZERO);
    assert!(matches!(Producer::new(TOPIC, zero_keepalive), Err(ClientError::InvalidConfig(_))));

    let producer = Producer::new(TOPIC, options.clone().max_message_size(8)).expect("producer");
    let err = producer.send(Vec::<&str>::new(), None).await.expect_err("empty message set");
    assert!(matches!(err, ClientError::ProducerMessagesEmpty));
    let err = producer.send("x", Some(SendOptions::default().topic(""))).await.expect_err("empty topic");
    assert!(matches!(err, ClientError::InvalidTopic));
    let err = producer.send("more than eight bytes", None).await.expect_err("oversized message");
    assert!(matches!(err, ClientError::MessageTooLarge { max: 8, .. }));

    assert_eq!(producer.state(), ConnectionState::Absent);
    assert_no_connection(&listener).await;
}

#[tokio::test]
async fn send_against_a_broker_dropping_every_connection_returns_after_one_reconnect() {
    let (listener, options) = mock_broker().await;
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    let acceptor = tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(conn);
        }
    });
    let producer = Producer::new(TOPIC, options).expect("producer");

    for n in 0..5 {
        let before = producer.connect_attempts();
        let res = timeout(Duration::from_secs(5), producer.send(format!("m{n}"), None)).await.expect("send must not hang");
        match res {
            Ok(()) | Err(ClientError::BrokerError(BrokerErrorKind::SocketClosed)) => (),
            Err(err) => panic!("unexpected error on send {n}: {err:?}"),
        }
        assert!(producer.connect_attempts() - before <= 1, "send {n} reconnected more than once");
    }
    assert!(producer.connect_attempts() >= 1);
    assert!(accepts.load(Ordering::SeqCst) as u64 <= producer.connect_attempts());
    acceptor.abort();
}

#[tokio::test]
async fn send_issued_during_a_refused_connect_shares_its_outcome() {
    let (listener, options) = mock_broker().await;
    drop(listener);
    let producer = Producer::new(TOPIC, options).expect("producer");

    let (connected, sent) = timeout(Duration::from_secs(5), async { tokio::join!(producer.connect(), producer.send("x", None)) })
        .await
        .expect("connect and send must not hang");
    assert!(matches!(connected, Err(ClientError::BrokerReconnect(_))), "unexpected connect result: {connected:?}");
    assert!(matches!(sent, Err(ClientError::BrokerReconnect(_))), "unexpected send result: {sent:?}");
    assert_eq!(producer.connect_attempts(), 1);
    assert_eq!(producer.state(), ConnectionState::Absent);
}

#[tokio::test]
async fn send_issued_during_a_connect_is_written_before_later_sends() {
    let (listener, options) = mock_broker().await;
    let producer = Producer::new(TOPIC, options.clone()).expect("producer");

    let (connected, sent, accepted) = tokio::join!(producer.connect(), producer.send("deferred", None), listener.accept());
    connected.expect("connect");
    sent.expect("deferred send");
    let (mut conn, _) = accepted.expect("accept");
    producer.send("after", None).await.expect("send after connect");

    assert_eq!(read_frame(&mut conn).await, expected_frame(&options, TOPIC, 0, "deferred"));
    assert_eq!(read_frame(&mut conn).await, expected_frame(&options, TOPIC, 0, "after"));
    assert_eq!(producer.connect_attempts(), 1);
    assert_no_connection(&listener).await;
}
