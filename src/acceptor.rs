//! Single-port, multi-protocol listener.
//!
//! The acceptor owns one listening socket registered with a reactor. Each
//! accepted connection is optionally wrapped in a [`TlsHandshake`] and then
//! handed to a [`ProtocolDetector`] built from the acceptor's
//! [`ProtocolRegistry`].
//!
//! Accept failures that leave the backlog queued (descriptor exhaustion,
//! for instance) are retried with exponential back-off: the listener is
//! edge-triggered, so no further readiness event would arrive for
//! connections already waiting.

use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs},
    sync::Arc,
    time::{Duration, Instant},
};

use log::warn;
use mio::{
    Interest,
    Token,
    event::Source,
    net::{TcpListener, TcpStream},
};
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tracing::debug;

use crate::{
    client::BackoffConfig,
    detector::{DEFAULT_DETECTION_TIMEOUT, Protocol, ProtocolDetector, ProtocolRegistry},
    reactor::{Context, Dispatcher, ReactorHandle, Step},
    stream::Stream,
    tls::{ServerTls, TlsHandshake},
};

const LISTEN_BACKLOG: i32 = 128;

/// Errors raised while creating the listening socket.
#[derive(Debug, Error)]
pub enum AcceptorError {
    /// Host name resolution failed.
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        /// `host:port` being resolved.
        address: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but produced no address.
    #[error("{0} resolved to no addresses")]
    NoAddress(String),

    /// Creating, binding or listening on the socket failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// Address being bound.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A pre-bound listener could not be adopted.
    #[error("failed to adopt listener: {0}")]
    Io(#[from] io::Error),
}

/// Builder for a listening acceptor.
///
/// ```no_run
/// use hostwire::{acceptor::Acceptor, reactor::Reactor};
///
/// let reactor = Reactor::new().expect("reactor");
/// let acceptor = Acceptor::new()
///     .bind(&reactor.handle(), "localhost", 4044)
///     .expect("bind");
/// println!("listening on {}", acceptor.local_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Acceptor {
    registry: ProtocolRegistry,
    tls: Option<ServerTls>,
    detection_timeout: Duration,
    backoff: BackoffConfig,
}

impl Default for Acceptor {
    fn default() -> Self { Self::new() }
}

impl Acceptor {
    /// Cleartext acceptor with no protocols and the default detection
    /// timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: ProtocolRegistry::default(),
            tls: None,
            detection_timeout: DEFAULT_DETECTION_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }

    /// Require a TLS handshake before protocol detection.
    #[must_use]
    pub fn tls(mut self, tls: ServerTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Time a connection has to identify its protocol.
    #[must_use]
    pub fn detection_timeout(mut self, timeout: Duration) -> Self {
        self.detection_timeout = timeout;
        self
    }

    /// Delays between attempts to drain the backlog after a failed accept.
    #[must_use]
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Register a protocol; earlier registrations win on overlap.
    #[must_use]
    pub fn protocol(self, protocol: Arc<dyn Protocol>) -> Self {
        self.registry.add(protocol);
        self
    }

    /// Resolve `host`, bind the first address it yields and register the
    /// listener with `reactor`.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if resolution, bind or listen fails.
    pub fn bind(
        self,
        reactor: &ReactorHandle,
        host: &str,
        port: u16,
    ) -> Result<AcceptorHandle, AcceptorError> {
        let listener = listen(host, port)?;
        self.bind_listener(reactor, listener)
    }

    /// Adopt an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError::Io`] if the listener cannot be made
    /// non-blocking or has no local address.
    pub fn bind_listener(
        self,
        reactor: &ReactorHandle,
        listener: StdTcpListener,
    ) -> Result<AcceptorHandle, AcceptorError> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let Self {
            registry,
            tls,
            detection_timeout,
            backoff,
        } = self;
        let token = reactor.register(Box::new(Listener {
            listener: TcpListener::from_std(listener),
            local_addr,
            registry: registry.clone(),
            tls,
            detection_timeout,
            backoff,
            retry: None,
        }));
        debug!(%local_addr, "acceptor listening");
        Ok(AcceptorHandle {
            local_addr,
            token,
            registry,
            reactor: reactor.clone(),
        })
    }
}

fn listen(host: &str, port: u16) -> Result<StdTcpListener, AcceptorError> {
    let address = format!("{host}:{port}");
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|source| AcceptorError::Resolve {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or(AcceptorError::NoAddress(address))?;
    let bind = |addr: SocketAddr| -> io::Result<StdTcpListener> {
        // socket2 opens the descriptor with close-on-exec set.
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    };
    bind(addr).map_err(|source| AcceptorError::Bind { addr, source })
}

/// Control surface for a bound acceptor.
#[derive(Debug, Clone)]
pub struct AcceptorHandle {
    local_addr: SocketAddr,
    token: Token,
    registry: ProtocolRegistry,
    reactor: ReactorHandle,
}

impl AcceptorHandle {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Register another protocol. Connections accepted afterwards consult
    /// it after every earlier registration.
    pub fn add_detector(&self, protocol: Arc<dyn Protocol>) { self.registry.add(protocol); }

    /// Close the listening socket and stop the owning reactor.
    pub fn stop(&self) {
        self.reactor.close(self.token);
        self.reactor.stop();
    }
}

/// Socket the acceptor takes connections from.
trait AcceptSource: Source + Send {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

impl AcceptSource for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> { TcpListener::accept(self) }

    fn take_error(&self) -> io::Result<Option<io::Error>> { TcpListener::take_error(self) }
}

/// A pending re-drain of the backlog.
#[derive(Debug, Clone, Copy)]
struct Retry {
    at: Instant,
    delay: Duration,
}

struct Listener<L = TcpListener> {
    listener: L,
    local_addr: SocketAddr,
    registry: ProtocolRegistry,
    tls: Option<ServerTls>,
    detection_timeout: Duration,
    backoff: BackoffConfig,
    retry: Option<Retry>,
}

impl<L: AcceptSource> Listener<L> {
    /// Accept until the backlog is empty or an error stops the drain.
    fn drain(&mut self, cx: &mut Context<'_>) -> io::Result<Step> {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted connection");
                    self.retry = None;
                    self.route(socket, peer, cx);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.retry = None;
                    return Ok(Step::Continue);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // The peer went away between SYN and accept; its queue
                // entry is gone, so keep draining.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!("failed to accept connection: {e}");
                }
                Err(e) => {
                    if let Ok(Some(fault)) = self.listener.take_error() {
                        return Err(fault);
                    }
                    if e.kind() == io::ErrorKind::InvalidInput {
                        return Err(e);
                    }
                    let delay = self
                        .retry
                        .map_or(self.backoff.initial_delay, |retry| self.backoff.next_delay(retry.delay));
                    warn!(
                        "failed to accept connection: {e}; retrying in {}ms",
                        delay.as_millis()
                    );
                    self.retry = Some(Retry {
                        at: cx.now() + delay,
                        delay,
                    });
                    return Ok(Step::Continue);
                }
            }
        }
    }

    fn route(&self, socket: TcpStream, peer: SocketAddr, cx: &mut Context<'_>) {
        let Some(tls) = &self.tls else {
            cx.spawn(Box::new(ProtocolDetector::new(
                Stream::from(socket),
                peer,
                &self.registry,
                self.detection_timeout,
            )));
            return;
        };
        let stream = match tls.accept(socket) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to start TLS session for {peer}: {e}");
                return;
            }
        };
        let registry = self.registry.clone();
        let timeout = self.detection_timeout;
        cx.spawn(Box::new(TlsHandshake::new(
            stream,
            peer,
            tls.handshake_timeout(),
            Box::new(
                move |stream: Stream, peer: SocketAddr, _reactor: &ReactorHandle| -> Box<dyn Dispatcher> {
                    Box::new(ProtocolDetector::new(stream, peer, &registry, timeout))
                },
            ),
        )));
    }
}

impl<L: AcceptSource + 'static> Dispatcher for Listener<L> {
    fn name(&self) -> &'static str { "acceptor" }

    fn source(&mut self) -> &mut dyn Source { &mut self.listener }

    fn interest(&self) -> Interest { Interest::READABLE }

    fn deadline(&self) -> Option<Instant> { self.retry.map(|retry| retry.at) }

    fn handle_read(&mut self, cx: &mut Context<'_>) -> io::Result<Step> { self.drain(cx) }

    // Switching to itself re-offers a read, so a fault found while
    // draining still reaches `handle_error` on the fatal path.
    fn handle_timeout(&mut self, _cx: &mut Context<'_>) -> Step { Step::Switch }

    fn handle_error(&mut self, err: io::Error) -> Step {
        panic!("listening socket {} failed: {err}", self.local_addr);
    }

    fn switch(self: Box<Self>, _cx: &mut Context<'_>) -> Box<dyn Dispatcher> { self }
}

#[cfg(test)]
mod tests;
