//! Dispatcher that drives a TLS handshake to completion before handing the
//! encrypted stream on.

use std::{
    fmt,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use mio::event::Source;
use tracing::{debug, warn};

use crate::{
    metrics,
    reactor::{Context, Dispatcher, ReactorHandle, Step},
    stream::Stream,
};

/// Builds the dispatcher that takes over once the handshake completes.
pub type Continuation =
    Box<dyn FnOnce(Stream, SocketAddr, &ReactorHandle) -> Box<dyn Dispatcher> + Send>;

/// Progress of a [`TlsHandshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Records are still being exchanged.
    Handshaking,
    /// The session is established; the continuation takes over.
    Complete,
    /// The peer violated the protocol or failed certificate checks.
    Failed,
    /// The deadline passed first.
    TimedOut,
}

/// Drives one non-blocking handshake step per readiness event.
///
/// On completion the dispatcher returns [`Step::Switch`] and its
/// continuation builds the replacement from the encrypted stream. On failure
/// or timeout the connection is closed and the continuation is dropped
/// without running.
pub struct TlsHandshake {
    stream: Stream,
    peer: SocketAddr,
    deadline: Instant,
    state: HandshakeState,
    next: Continuation,
}

impl fmt::Debug for TlsHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandshake")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TlsHandshake {
    /// Start a handshake over `stream`, which must already carry a TLS
    /// session. A plain stream completes immediately.
    pub fn new(stream: Stream, peer: SocketAddr, timeout: Duration, next: Continuation) -> Self {
        Self {
            stream,
            peer,
            deadline: Instant::now() + timeout,
            state: HandshakeState::Handshaking,
            next,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandshakeState { self.state }

    fn step(&mut self) -> io::Result<Step> {
        let done = match &mut self.stream {
            Stream::Tls(tls) => tls.drive_handshake()?,
            Stream::Plain(_) => true,
        };
        if !done {
            return Ok(Step::Continue);
        }
        self.state = HandshakeState::Complete;
        debug!(peer = %self.peer, "TLS handshake complete");
        Ok(Step::Switch)
    }
}

impl Dispatcher for TlsHandshake {
    fn name(&self) -> &'static str { "tls-handshake" }

    fn source(&mut self) -> &mut dyn Source { self.stream.source() }

    fn writable(&self) -> bool { self.stream.wants_write() }

    fn deadline(&self) -> Option<Instant> { Some(self.deadline) }

    fn is_handshaking(&self) -> bool { self.state == HandshakeState::Handshaking }

    fn handle_read(&mut self, _cx: &mut Context<'_>) -> io::Result<Step> { self.step() }

    fn handle_write(&mut self, _cx: &mut Context<'_>) -> io::Result<Step> { self.step() }

    fn handle_timeout(&mut self, _cx: &mut Context<'_>) -> Step {
        warn!(peer = %self.peer, "TLS handshake timed out, closing");
        self.state = HandshakeState::TimedOut;
        metrics::inc_handshake_failures();
        Step::Close
    }

    fn handle_error(&mut self, err: io::Error) -> Step {
        warn!(peer = %self.peer, error = %err, "TLS handshake failed, closing");
        self.state = HandshakeState::Failed;
        metrics::inc_handshake_failures();
        Step::Close
    }

    fn switch(self: Box<Self>, cx: &mut Context<'_>) -> Box<dyn Dispatcher> {
        let this = *self;
        (this.next)(this.stream, this.peer, cx.reactor())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream as StdTcpStream},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use mio::net::TcpStream;
    use rcgen::{CertificateParams, KeyPair};

    use super::*;
    use crate::{
        reactor::Reactor,
        tls::{ClientTls, ServerTls},
    };

    const WAIT: Duration = Duration::from_secs(5);

    /// Holds the handed-over stream without touching it.
    struct Parked(Stream);

    impl Dispatcher for Parked {
        fn name(&self) -> &'static str { "parked" }

        fn source(&mut self) -> &mut dyn Source { self.0.source() }

        fn handle_read(&mut self, _cx: &mut Context<'_>) -> io::Result<Step> { Ok(Step::Continue) }

        fn switch(self: Box<Self>, _cx: &mut Context<'_>) -> Box<dyn Dispatcher> { self }
    }

    struct Harness {
        reactor: Reactor,
        peer: StdTcpStream,
        handed_over: Arc<AtomicUsize>,
        cert: Vec<u8>,
    }

    fn harness(timeout: Duration) -> Harness {
        let key = KeyPair::generate().expect("key");
        let cert = CertificateParams::new(vec!["localhost".to_owned()])
            .expect("params")
            .self_signed(&key)
            .expect("self-sign");
        let cert = cert.pem().into_bytes();
        let tls = ServerTls::from_pem(&cert, key.serialize_pem().as_bytes(), None).expect("server tls");

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = StdTcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        peer.set_read_timeout(Some(WAIT)).expect("read timeout");
        let (socket, addr) = listener.accept().expect("accept");
        socket.set_nonblocking(true).expect("non-blocking");
        let stream = tls.accept(TcpStream::from_std(socket)).expect("server session");

        let handed_over = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handed_over);
        let handshake = TlsHandshake::new(
            stream,
            addr,
            timeout,
            Box::new(move |stream: Stream, _peer: SocketAddr, _reactor: &ReactorHandle| -> Box<dyn Dispatcher> {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(Parked(stream))
            }),
        );
        let mut reactor = Reactor::new().expect("reactor");
        reactor
            .create_dispatcher(Box::new(handshake))
            .expect("register handshake");
        Harness {
            reactor,
            peer,
            handed_over,
            cert,
        }
    }

    fn run_until_empty(reactor: &mut Reactor) {
        let deadline = Instant::now() + WAIT;
        while !reactor.is_empty() {
            assert!(Instant::now() < deadline, "handshake still registered");
            reactor.turn(Duration::from_millis(20)).expect("turn");
        }
    }

    /// Read until the server closes, skipping any alert it sends first.
    fn assert_closed(peer: &mut StdTcpStream) {
        let mut buf = [0_u8; 256];
        loop {
            match peer.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => return,
                Err(err) => panic!("connection still open: {err}"),
            }
        }
    }

    #[test]
    fn silent_peer_times_out_without_handoff() {
        let mut harness = harness(Duration::from_millis(100));
        let started = Instant::now();
        run_until_empty(&mut harness.reactor);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(harness.handed_over.load(Ordering::SeqCst), 0);
        assert_closed(&mut harness.peer);
    }

    #[test]
    fn plaintext_greeting_fails_without_handoff() {
        let mut harness = harness(WAIT);
        harness
            .peer
            .write_all(b"CONNECT\naccept-version:1.2\n\n\0")
            .expect("write greeting");
        run_until_empty(&mut harness.reactor);
        assert_eq!(harness.handed_over.load(Ordering::SeqCst), 0);
        assert_closed(&mut harness.peer);
    }

    #[test]
    fn completed_handshake_hands_over_once() {
        let mut harness = harness(WAIT);
        let client_tls = ClientTls::from_pem(&harness.cert, "localhost", None).expect("client tls");
        let socket = harness.peer.try_clone().expect("clone peer");
        socket.set_nonblocking(true).expect("non-blocking");
        let mut client = client_tls
            .connect(TcpStream::from_std(socket))
            .expect("client session");

        let deadline = Instant::now() + WAIT;
        while harness.handed_over.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "handshake never completed");
            if let Stream::Tls(tls) = &mut client {
                tls.drive_handshake().expect("client handshake step");
            }
            harness
                .reactor
                .turn(Duration::from_millis(10))
                .expect("turn");
        }
        for _ in 0..3 {
            harness
                .reactor
                .turn(Duration::from_millis(10))
                .expect("turn");
        }
        assert_eq!(harness.handed_over.load(Ordering::SeqCst), 1);
        assert_eq!(harness.reactor.len(), 1);
    }
}
