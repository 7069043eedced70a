//! Unit tests for client configuration and the reconnecting link.

use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use rstest::rstest;

use super::*;
use crate::{
    framed::FramedClient,
    reactor::{Reactor, ReactorHandle},
};

const WAIT: Duration = Duration::from_secs(5);

fn spawn_reactor() -> (ReactorHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut reactor = Reactor::new().expect("reactor");
        tx.send(reactor.handle()).expect("send handle");
        reactor.process_requests().expect("reactor loop");
    });
    (rx.recv().expect("reactor handle"), join)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut wire = u64::try_from(payload.len())
        .expect("length fits")
        .to_be_bytes()
        .to_vec();
    wire.extend_from_slice(payload);
    wire
}

#[test]
fn config_defaults_reconnect_in_cleartext() {
    let config = ClientConfig::new("localhost", 4044);
    assert!(config.tls.is_none());
    assert!(config.reconnect);
    assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    assert_eq!(config.backoff, BackoffConfig::default());
}

#[rstest]
#[case(Duration::ZERO, Duration::ZERO, Duration::from_millis(1), Duration::from_millis(1))]
#[case(Duration::from_secs(2), Duration::from_millis(50), Duration::from_millis(50), Duration::from_secs(2))]
#[case(Duration::from_millis(20), Duration::from_millis(80), Duration::from_millis(20), Duration::from_millis(80))]
fn backoff_is_normalized_by_the_builder(
    #[case] initial_delay: Duration,
    #[case] max_delay: Duration,
    #[case] expected_initial: Duration,
    #[case] expected_max: Duration,
) {
    let config = ClientConfig::new("localhost", 1).backoff(BackoffConfig {
        initial_delay,
        max_delay,
    });
    assert_eq!(config.backoff.initial_delay, expected_initial);
    assert_eq!(config.backoff.max_delay, expected_max);
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let backoff = BackoffConfig::default();
    let mut delay = backoff.initial_delay;
    let mut seen = vec![delay];
    for _ in 0..8 {
        delay = backoff.next_delay(delay);
        seen.push(delay);
    }
    assert_eq!(seen[1], Duration::from_millis(20));
    assert_eq!(seen.last(), Some(&backoff.max_delay));
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn refused_connection_is_reported() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let reactor = Reactor::new().expect("reactor");
    let err = FramedClient::connect(
        ClientConfig::new("127.0.0.1", port)
            .reconnect(false)
            .connect_timeout(Duration::from_secs(1)),
        &reactor.handle(),
    )
    .expect_err("nothing listens");
    assert!(matches!(err, ClientError::Connect { .. }), "{err}");
}

#[test]
fn framed_link_sends_receives_and_notices_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let (reactor, join) = spawn_reactor();

    let client = FramedClient::connect(ClientConfig::new("127.0.0.1", port).reconnect(false), &reactor)
        .expect("connect");
    let (tx, rx) = mpsc::channel();
    client.set_message_handler(Arc::new(move |incoming: Incoming| {
        let _ = tx.send(incoming);
    }));
    client
        .send(Bytes::from_static(b"{\"ping\":1}"), None)
        .expect("send");

    let (mut peer, _) = listener.accept().expect("accept");
    peer.set_read_timeout(Some(WAIT)).expect("timeout");
    let mut expected = framed(b"");
    expected.extend(framed(b"{\"ping\":1}"));
    let mut received = vec![0; expected.len()];
    peer.read_exact(&mut received).expect("read frame");
    assert_eq!(received, expected);

    peer.write_all(&framed(b"{\"pong\":1}")).expect("write frame");
    let incoming = rx.recv_timeout(WAIT).expect("message delivered");
    assert_eq!(&incoming.payload[..], b"{\"pong\":1}");
    assert_eq!(incoming.destination, None);

    drop(peer);
    wait_until(|| !client.is_connected());
    assert!(matches!(
        client.send(Bytes::from_static(b"{}"), None),
        Err(ClientError::Disconnected)
    ));

    client.close();
    assert!(matches!(
        client.send(Bytes::from_static(b"{}"), None),
        Err(ClientError::Closed)
    ));

    reactor.stop();
    join.join().expect("reactor thread");
}

#[test]
fn close_flushes_queued_output() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let (reactor, join) = spawn_reactor();

    let client = FramedClient::connect(ClientConfig::new("127.0.0.1", port).reconnect(false), &reactor)
        .expect("connect");
    client.send(Bytes::from_static(b"last"), None).expect("send");
    client.close();

    let (mut peer, _) = listener.accept().expect("accept");
    peer.set_read_timeout(Some(WAIT)).expect("timeout");
    let mut received = Vec::new();
    peer.read_to_end(&mut received).expect("read until close");
    let mut expected = framed(b"");
    expected.extend(framed(b"last"));
    assert_eq!(received, expected);

    reactor.stop();
    join.join().expect("reactor thread");
}
