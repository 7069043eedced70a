//! Length-prefixed transport: server protocol and client.
//!
//! Every payload travels as an 8-byte big-endian length followed by the
//! payload bytes (see [`LengthPrefixedCodec`]). The server side plugs into the
//! [`ProtocolDetector`](crate::detector::ProtocolDetector) and surfaces each
//! payload to a [`RequestHandler`]; the client side implements
//! [`ClientTransport`].
//!
//! An empty payload carries no request. Clients send one as soon as they
//! connect so the server can detect the protocol, and therefore hold a
//! session for event delivery, before the first call.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tracing::debug;

use crate::{
    client::{ClientConfig, ClientError, ClientTransport, Incoming, Link, LinkProtocol, MessageHandler},
    codec::{DEFAULT_MAX_FRAME_LENGTH, LENGTH_HEADER_SIZE, LengthPrefixedCodec, peek_length},
    connection::{Connection, ConnectionHandle, FrameHandler},
    detector::Protocol,
    reactor::{Dispatcher, ReactorHandle},
    session::{EventPublisher, SessionRegistry},
    stream::Stream,
    transport::{RequestHandler, Responder},
};

/// Detector name of the length-prefixed protocol.
pub const PROTOCOL_NAME: &str = "framed";

/// Server-side state of one framed connection.
#[derive(Debug)]
pub struct FramedSession {
    conn: ConnectionHandle<LengthPrefixedCodec>,
}

impl FramedSession {
    /// Sending handle of the connection.
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle<LengthPrefixedCodec> { &self.conn }
}

/// Detector plugin and session owner for length-prefixed connections.
///
/// A connection is claimed when its first 8 bytes form a length no greater
/// than the maximum frame length; STOMP's `CONNECT` or any printable text
/// decodes to a far larger number.
pub struct FramedProtocol {
    handler: Arc<dyn RequestHandler>,
    max_frame_length: usize,
    sessions: Arc<SessionRegistry<FramedSession>>,
}

impl std::fmt::Debug for FramedProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedProtocol")
            .field("max_frame_length", &self.max_frame_length)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl FramedProtocol {
    /// Serve payloads to `handler` with the default maximum frame length.
    #[must_use]
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            handler,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            sessions: Arc::new(SessionRegistry::default()),
        }
    }

    /// Override the maximum payload length.
    #[must_use]
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Live sessions.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry<FramedSession>> { &self.sessions }
}

impl Protocol for FramedProtocol {
    fn name(&self) -> &'static str { PROTOCOL_NAME }

    fn required_size(&self) -> usize { LENGTH_HEADER_SIZE }

    fn detect(&self, prefix: &[u8]) -> bool {
        peek_length(prefix).is_some_and(|length| {
            usize::try_from(length).is_ok_and(|length| length <= self.max_frame_length)
        })
    }

    fn handle_socket(
        &self,
        stream: Stream,
        peer: SocketAddr,
        reactor: &ReactorHandle,
    ) -> Box<dyn Dispatcher> {
        Box::new(Connection::new(
            stream,
            peer,
            LengthPrefixedCodec::new(self.max_frame_length),
            FramedServerHandler {
                handler: Arc::clone(&self.handler),
                sessions: Arc::clone(&self.sessions),
                session: None,
            },
            reactor,
        ))
    }
}

impl EventPublisher for FramedProtocol {
    /// Framed connections have no destinations: every live session receives
    /// every event.
    fn publish(&self, _destination: &str, payload: Bytes) -> usize {
        self.sessions
            .active_sessions()
            .into_iter()
            .filter(|(_, session)| session.conn.send(payload.clone()).is_ok())
            .count()
    }
}

struct FramedServerHandler {
    handler: Arc<dyn RequestHandler>,
    sessions: Arc<SessionRegistry<FramedSession>>,
    session: Option<Arc<FramedSession>>,
}

impl FrameHandler<LengthPrefixedCodec> for FramedServerHandler {
    fn name(&self) -> &'static str { PROTOCOL_NAME }

    fn handle_open(&mut self, conn: &ConnectionHandle<LengthPrefixedCodec>) {
        let session = Arc::new(FramedSession { conn: conn.clone() });
        self.sessions.insert(conn.id(), &session);
        self.session = Some(session);
    }

    fn handle_frame(&mut self, payload: Bytes, conn: &ConnectionHandle<LengthPrefixedCodec>) {
        if payload.is_empty() {
            debug!(id = %conn.id(), "empty frame");
            return;
        }
        self.handler
            .handle_request(payload, Arc::new(FramedResponder(conn.clone())));
    }

    fn handle_close(&mut self, conn: &ConnectionHandle<LengthPrefixedCodec>) {
        self.sessions.remove(&conn.id());
        self.session = None;
    }
}

struct FramedResponder(ConnectionHandle<LengthPrefixedCodec>);

impl Responder for FramedResponder {
    fn respond(&self, payload: Bytes) {
        if let Err(err) = self.0.send(payload) {
            debug!(id = %self.0.id(), error = %err, "dropping reply");
        }
    }
}

#[derive(Debug)]
struct FramedLink {
    max_frame_length: usize,
}

impl LinkProtocol for FramedLink {
    type Codec = LengthPrefixedCodec;

    fn name(&self) -> &'static str { PROTOCOL_NAME }

    fn codec(&self) -> LengthPrefixedCodec { LengthPrefixedCodec::new(self.max_frame_length) }

    fn on_connect(&self, conn: &ConnectionHandle<LengthPrefixedCodec>) {
        if let Err(err) = conn.send(Bytes::new()) {
            debug!(error = %err, "greeting not sent");
        }
    }

    fn on_frame(&self, payload: Bytes, _conn: &ConnectionHandle<LengthPrefixedCodec>) -> Option<Incoming> {
        if payload.is_empty() {
            return None;
        }
        Some(Incoming {
            payload,
            destination: None,
        })
    }
}

/// Client for the length-prefixed transport.
///
/// ```no_run
/// use bytes::Bytes;
/// use hostwire::{
///     client::{ClientConfig, ClientTransport},
///     framed::FramedClient,
///     reactor::Reactor,
/// };
///
/// let reactor = Reactor::new().expect("reactor");
/// let client = FramedClient::connect(ClientConfig::new("localhost", 4044), &reactor.handle())
///     .expect("connect");
/// client
///     .send(Bytes::from_static(br#"{"jsonrpc":"2.0","method":"Host.ping","id":1}"#), None)
///     .expect("send");
/// ```
#[derive(Debug)]
pub struct FramedClient {
    link: Link<FramedLink>,
}

impl FramedClient {
    /// Dial the server described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the first connection attempt fails.
    pub fn connect(config: ClientConfig, reactor: &ReactorHandle) -> Result<Self, ClientError> {
        Self::connect_with_max_frame_length(config, reactor, DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Dial with a non-default maximum payload length.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the first connection attempt fails.
    pub fn connect_with_max_frame_length(
        config: ClientConfig,
        reactor: &ReactorHandle,
        max_frame_length: usize,
    ) -> Result<Self, ClientError> {
        let link = Link::connect(FramedLink { max_frame_length }, config, reactor)?;
        Ok(Self { link })
    }

    /// Whether a connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.link.is_connected() }
}

impl ClientTransport for FramedClient {
    fn send(&self, payload: Bytes, _destination: Option<&str>) -> Result<(), ClientError> { self.link.send(payload) }

    fn set_message_handler(&self, handler: MessageHandler) { self.link.set_message_handler(handler); }

    fn close(&self) { self.link.close(); }
}

impl Drop for FramedClient {
    fn drop(&mut self) { self.link.close(); }
}
