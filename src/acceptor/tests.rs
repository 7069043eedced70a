//! Unit tests for the accept path.

use std::{
    net::TcpStream as StdTcpStream,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use mio::{Registry, Token};

use super::*;
use crate::reactor::Reactor;

/// Fails the first `failures` accepts with `kind`, then defers to a real
/// listener.
struct Flaky {
    inner: TcpListener,
    kind: io::ErrorKind,
    failures: AtomicUsize,
    attempts: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
}

impl Source for Flaky {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> { self.inner.deregister(registry) }
}

impl AcceptSource for Flaky {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::new(self.kind, "too many open files"));
        }
        let accepted = self.inner.accept()?;
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(accepted)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> { self.inner.take_error() }
}

struct Harness {
    reactor: Reactor,
    addr: SocketAddr,
    attempts: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
}

fn harness(kind: io::ErrorKind, failures: usize) -> Harness {
    let inner = TcpListener::bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
    let addr = inner.local_addr().expect("local addr");
    let attempts = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::new(AtomicUsize::new(0));
    let listener = Listener {
        listener: Flaky {
            inner,
            kind,
            failures: AtomicUsize::new(failures),
            attempts: Arc::clone(&attempts),
            accepted: Arc::clone(&accepted),
        },
        local_addr: addr,
        registry: ProtocolRegistry::default(),
        tls: None,
        detection_timeout: Duration::from_secs(5),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        retry: None,
    };
    let mut reactor = Reactor::new().expect("reactor");
    reactor
        .create_dispatcher(Box::new(listener))
        .expect("register listener");
    Harness {
        reactor,
        addr,
        attempts,
        accepted,
    }
}

#[test]
fn backlog_is_drained_after_failed_accepts() {
    let mut harness = harness(io::ErrorKind::Other, 2);
    let _client = StdTcpStream::connect(harness.addr).expect("connect");

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.accepted.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "queued connection never accepted");
        harness
            .reactor
            .turn(Duration::from_millis(50))
            .expect("turn");
    }
    assert!(harness.attempts.load(Ordering::SeqCst) >= 3);
}

#[test]
fn healthy_listener_has_no_deadline() {
    let mut harness = harness(io::ErrorKind::Other, 0);
    let _client = StdTcpStream::connect(harness.addr).expect("connect");

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.accepted.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "connection never accepted");
        harness
            .reactor
            .turn(Duration::from_millis(50))
            .expect("turn");
    }
    let attempts = harness.attempts.load(Ordering::SeqCst);
    for _ in 0..5 {
        harness
            .reactor
            .turn(Duration::from_millis(10))
            .expect("turn");
    }
    assert_eq!(harness.attempts.load(Ordering::SeqCst), attempts);
}

#[test]
#[should_panic(expected = "listening socket")]
fn listener_faults_are_fatal() {
    let mut harness = harness(io::ErrorKind::InvalidInput, 1);
    let _client = StdTcpStream::connect(harness.addr).expect("connect");
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        harness
            .reactor
            .turn(Duration::from_millis(50))
            .expect("turn");
    }
}
