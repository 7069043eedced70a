//! Protocol sniffing for freshly accepted connections.
//!
//! A [`ProtocolDetector`] peeks at the first bytes of a connection without
//! consuming them, asks each registered [`Protocol`] in turn whether it
//! recognises them and hands the untouched stream to the first that does.
//! The chosen protocol's dispatcher replaces the detector in the reactor, so
//! its parser starts from byte zero.

use std::{
    fmt,
    io,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

use bytes::Bytes;
use mio::event::Source;
use tracing::{debug, info, warn};

use crate::{
    metrics,
    reactor::{Context, Dispatcher, ReactorHandle, Step},
    stream::{ReadOutcome, Stream},
};

/// Default time a connection has to identify its protocol.
pub const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// A protocol that can claim a connection from its first bytes.
pub trait Protocol: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Bytes needed before [`detect`](Self::detect) can decide.
    fn required_size(&self) -> usize;

    /// Whether `prefix` starts this protocol. `prefix` holds at least
    /// [`required_size`](Self::required_size) bytes.
    fn detect(&self, prefix: &[u8]) -> bool;

    /// Take ownership of the connection. The returned dispatcher replaces
    /// the detector under the same reactor registration.
    fn handle_socket(
        &self,
        stream: Stream,
        peer: SocketAddr,
        reactor: &ReactorHandle,
    ) -> Box<dyn Dispatcher>;
}

/// Ordered, shareable list of registered protocols.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: Arc<RwLock<Vec<Arc<dyn Protocol>>>>,
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self.snapshot().iter().map(|p| p.name()).collect();
        f.debug_tuple("ProtocolRegistry").field(&names).finish()
    }
}

impl ProtocolRegistry {
    /// Append `protocol`; earlier registrations take precedence.
    pub fn add(&self, protocol: Arc<dyn Protocol>) {
        self.protocols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(protocol);
    }

    /// Protocols registered so far, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Protocol>> {
        self.protocols
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Progress of a [`ProtocolDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Fewer than the required bytes have arrived.
    WaitingForData,
    /// A protocol claimed the connection.
    Matched(&'static str),
    /// The deadline passed before a match.
    TimedOut,
    /// The peer closed, nothing matched or reading failed.
    Closed,
}

/// Per-connection dispatcher that picks a protocol.
pub struct ProtocolDetector {
    stream: Stream,
    peer: SocketAddr,
    protocols: Vec<Arc<dyn Protocol>>,
    required: usize,
    deadline: Instant,
    state: DetectorState,
    matched: Option<Arc<dyn Protocol>>,
}

impl fmt::Debug for ProtocolDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDetector")
            .field("peer", &self.peer)
            .field("required", &self.required)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ProtocolDetector {
    /// Start detection over `stream` with the protocols currently in
    /// `registry`.
    #[must_use]
    pub fn new(stream: Stream, peer: SocketAddr, registry: &ProtocolRegistry, timeout: Duration) -> Self {
        let protocols = registry.snapshot();
        let required = protocols
            .iter()
            .map(|p| p.required_size())
            .max()
            .unwrap_or(0);
        Self {
            stream,
            peer,
            protocols,
            required,
            deadline: Instant::now() + timeout,
            state: DetectorState::WaitingForData,
            matched: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DetectorState { self.state }

    /// Bytes buffered before detection runs.
    #[must_use]
    pub fn required_size(&self) -> usize { self.required }

    fn fail(&mut self, state: DetectorState) -> Step {
        self.state = state;
        metrics::inc_detection_failures();
        Step::Close
    }
}

impl Dispatcher for ProtocolDetector {
    fn name(&self) -> &'static str { "protocol-detector" }

    fn source(&mut self) -> &mut dyn Source { self.stream.source() }

    fn writable(&self) -> bool { self.stream.wants_write() }

    fn deadline(&self) -> Option<Instant> { Some(self.deadline) }

    fn is_handshaking(&self) -> bool { self.stream.is_handshaking() }

    fn handle_read(&mut self, cx: &mut Context<'_>) -> io::Result<Step> {
        if cx.now() >= self.deadline {
            return Ok(self.handle_timeout(cx));
        }
        if self.protocols.is_empty() {
            warn!(peer = %self.peer, "no protocols registered, closing");
            return Ok(self.fail(DetectorState::Closed));
        }

        let mut prefix = vec![0_u8; self.required];
        let available = match self.stream.peek(&mut prefix) {
            ReadOutcome::Data(n) => n,
            ReadOutcome::WouldBlock => return Ok(Step::Continue),
            ReadOutcome::Closed => {
                debug!(peer = %self.peer, "peer closed before identifying its protocol");
                return Ok(self.fail(DetectorState::Closed));
            }
            ReadOutcome::Error(err) => return Err(err),
        };
        if available < self.required {
            return Ok(Step::Continue);
        }

        match self.protocols.iter().find(|p| p.detect(&prefix)) {
            Some(protocol) => {
                debug!(peer = %self.peer, protocol = protocol.name(), "protocol detected");
                metrics::inc_detected(protocol.name());
                self.state = DetectorState::Matched(protocol.name());
                self.matched = Some(Arc::clone(protocol));
                Ok(Step::Switch)
            }
            None => {
                warn!(
                    peer = %self.peer,
                    data = ?Bytes::from(prefix),
                    "unrecognized protocol, closing"
                );
                Ok(self.fail(DetectorState::Closed))
            }
        }
    }

    fn handle_write(&mut self, _cx: &mut Context<'_>) -> io::Result<Step> {
        self.stream.flush()?;
        Ok(Step::Continue)
    }

    fn handle_timeout(&mut self, _cx: &mut Context<'_>) -> Step {
        info!(peer = %self.peer, "protocol detection timed out, closing");
        self.fail(DetectorState::TimedOut)
    }

    fn switch(self: Box<Self>, cx: &mut Context<'_>) -> Box<dyn Dispatcher> {
        let Some(protocol) = self.matched.clone() else {
            return self;
        };
        let this = *self;
        protocol.handle_socket(this.stream, this.peer, cx.reactor())
    }
}
