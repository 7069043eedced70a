//! Server side of the STOMP transport.
//!
//! Each connection must open with `CONNECT` (or `STOMP`) accepting version
//! 1.2. `SEND` bodies addressed to the request destination go to the
//! [`RequestHandler`]; replies come back as `MESSAGE` frames addressed to the
//! request's `reply-to` destination, or to the configured response
//! destination. A `SEND` to any other destination is relayed to the sessions
//! subscribed to it, which is how client notifications reach their topic.
//! Subscriptions are tracked per session so published events reach only the
//! clients that asked for them.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{
    DEFAULT_REQUEST_DESTINATION,
    DEFAULT_RESPONSE_DESTINATION,
    codec::StompCodec,
    frame::{Command, Frame, JSON_CONTENT_TYPE, STOMP_VERSION, headers},
};
use crate::{
    codec::DEFAULT_MAX_FRAME_LENGTH,
    connection::{Connection, ConnectionHandle, FrameHandler},
    detector::Protocol,
    reactor::{Dispatcher, ReactorHandle},
    session::{EventPublisher, SessionRegistry},
    stream::Stream,
    transport::{RequestHandler, Responder},
};

/// Detector name of the STOMP protocol.
pub const PROTOCOL_NAME: &str = "stomp";

/// Bytes needed to recognise a `CONNECT` frame.
const REQUIRED_SIZE: usize = 7;

/// Server-side state of one STOMP connection.
#[derive(Debug)]
pub struct StompSession {
    conn: ConnectionHandle<StompCodec>,
    subscriptions: Mutex<HashMap<String, String>>,
    next_message_id: AtomicU64,
}

impl StompSession {
    fn new(conn: ConnectionHandle<StompCodec>) -> Self {
        Self {
            conn,
            subscriptions: Mutex::new(HashMap::new()),
            next_message_id: AtomicU64::new(0),
        }
    }

    /// Sending handle of the connection.
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle<StompCodec> { &self.conn }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Identifier of a subscription to `destination`, if any.
    #[must_use]
    pub fn subscription_for(&self, destination: &str) -> Option<String> {
        self.subscriptions()
            .iter()
            .find(|(_, subscribed)| subscribed.as_str() == destination)
            .map(|(id, _)| id.clone())
    }

    /// Whether the client subscribed to `destination`.
    #[must_use]
    pub fn is_subscribed(&self, destination: &str) -> bool { self.subscription_for(destination).is_some() }

    fn message(&self, destination: &str, payload: Bytes) -> Frame {
        let sequence = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = Frame::new(Command::Message)
            .header(headers::DESTINATION, destination)
            .header(headers::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(
                headers::MESSAGE_ID,
                format!("{}-{sequence}", self.conn.id().as_u64()),
            );
        if let Some(id) = self.subscription_for(destination) {
            frame = frame.header(headers::SUBSCRIPTION, id);
        }
        frame.with_body(payload)
    }

    /// Queue a `MESSAGE` carrying `payload` to `destination`.
    ///
    /// # Errors
    ///
    /// Fails with [`std::io::ErrorKind::NotConnected`] once the connection
    /// has closed.
    pub fn deliver(&self, destination: &str, payload: Bytes) -> std::io::Result<()> {
        self.conn.send(self.message(destination, payload))
    }
}

/// Detector plugin and session owner for STOMP connections.
pub struct StompProtocol {
    handler: Arc<dyn RequestHandler>,
    max_frame_length: usize,
    request_destination: Arc<str>,
    response_destination: Arc<str>,
    sessions: Arc<SessionRegistry<StompSession>>,
}

impl std::fmt::Debug for StompProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompProtocol")
            .field("max_frame_length", &self.max_frame_length)
            .field("request_destination", &self.request_destination)
            .field("response_destination", &self.response_destination)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl StompProtocol {
    /// Serve `SEND` bodies to `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            handler,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            request_destination: Arc::from(DEFAULT_REQUEST_DESTINATION),
            response_destination: Arc::from(DEFAULT_RESPONSE_DESTINATION),
            sessions: Arc::new(SessionRegistry::default()),
        }
    }

    /// Override the maximum frame body length.
    #[must_use]
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Destination whose `SEND` bodies are requests.
    #[must_use]
    pub fn with_request_destination(mut self, destination: impl Into<String>) -> Self {
        self.request_destination = Arc::from(destination.into());
        self
    }

    /// Destination of replies to requests without `reply-to`.
    #[must_use]
    pub fn with_response_destination(mut self, destination: impl Into<String>) -> Self {
        self.response_destination = Arc::from(destination.into());
        self
    }

    /// Live sessions.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry<StompSession>> { &self.sessions }
}

impl Protocol for StompProtocol {
    fn name(&self) -> &'static str { PROTOCOL_NAME }

    fn required_size(&self) -> usize { REQUIRED_SIZE }

    fn detect(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(Command::Connect.as_str().as_bytes())
            || prefix.starts_with(Command::Stomp.as_str().as_bytes())
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
            StompCodec::new(self.max_frame_length),
            StompServerHandler {
                handler: Arc::clone(&self.handler),
                request_destination: Arc::clone(&self.request_destination),
                response_destination: Arc::clone(&self.response_destination),
                sessions: Arc::clone(&self.sessions),
                session: None,
                connected: false,
            },
            reactor,
        ))
    }
}

impl EventPublisher for StompProtocol {
    /// Deliver to every session subscribed to `destination`.
    fn publish(&self, destination: &str, payload: Bytes) -> usize { fan_out(&self.sessions, destination, &payload) }
}

fn fan_out(sessions: &SessionRegistry<StompSession>, destination: &str, payload: &Bytes) -> usize {
    sessions
        .active_sessions()
        .into_iter()
        .filter(|(_, session)| session.is_subscribed(destination))
        .filter(|(_, session)| session.deliver(destination, payload.clone()).is_ok())
        .count()
}

struct StompServerHandler {
    handler: Arc<dyn RequestHandler>,
    request_destination: Arc<str>,
    response_destination: Arc<str>,
    sessions: Arc<SessionRegistry<StompSession>>,
    session: Option<Arc<StompSession>>,
    connected: bool,
}

impl StompServerHandler {
    fn connect(&mut self, frame: &Frame, conn: &ConnectionHandle<StompCodec>) {
        let accepted = frame
            .get(headers::ACCEPT_VERSION)
            .is_some_and(|versions| versions.split(',').any(|v| v.trim() == STOMP_VERSION));
        if !accepted {
            reject(
                conn,
                &format!("unsupported protocol version, supported versions are {STOMP_VERSION}"),
            );
            return;
        }
        self.connected = true;
        info!(id = %conn.id(), peer = %conn.peer(), "stomp session established");
        send(
            conn,
            Frame::new(Command::Connected)
                .header(headers::VERSION, STOMP_VERSION)
                .header(headers::HEART_BEAT, "0,0")
                .header(
                    headers::SERVER,
                    concat!("hostwire/", env!("CARGO_PKG_VERSION")),
                ),
        );
    }

    fn request(&self, frame: Frame, session: &Arc<StompSession>) {
        let Some(destination) = frame.get(headers::DESTINATION) else {
            reject(&session.conn, "SEND frame has no destination");
            return;
        };
        if destination != &*self.request_destination {
            let reached = fan_out(&self.sessions, destination, &frame.body);
            debug!(id = %session.conn.id(), destination, reached, "relayed message");
            return;
        }
        debug!(id = %session.conn.id(), destination, "request received");
        let reply_to = frame
            .get(headers::REPLY_TO)
            .map_or_else(|| Arc::clone(&self.response_destination), Arc::from);
        let responder = StompResponder {
            session: Arc::clone(session),
            destination: reply_to,
        };
        self.handler.handle_request(frame.body, Arc::new(responder));
    }

    fn subscribe(frame: &Frame, session: &StompSession) -> bool {
        let (Some(id), Some(destination)) = (frame.get(headers::ID), frame.get(headers::DESTINATION))
        else {
            reject(&session.conn, "SUBSCRIBE frame needs id and destination");
            return false;
        };
        debug!(id = %session.conn.id(), subscription = id, destination, "subscribed");
        session
            .subscriptions()
            .insert(id.to_owned(), destination.to_owned());
        true
    }

    fn unsubscribe(frame: &Frame, session: &StompSession) -> bool {
        let Some(id) = frame.get(headers::ID) else {
            reject(&session.conn, "UNSUBSCRIBE frame needs id");
            return false;
        };
        if session.subscriptions().remove(id).is_none() {
            debug!(id = %session.conn.id(), subscription = id, "unknown subscription");
        }
        true
    }
}

impl FrameHandler<StompCodec> for StompServerHandler {
    fn name(&self) -> &'static str { PROTOCOL_NAME }

    fn handle_open(&mut self, conn: &ConnectionHandle<StompCodec>) {
        let session = Arc::new(StompSession::new(conn.clone()));
        self.sessions.insert(conn.id(), &session);
        self.session = Some(session);
    }

    fn handle_frame(&mut self, frame: Frame, conn: &ConnectionHandle<StompCodec>) {
        if matches!(frame.command, Command::Connect | Command::Stomp) {
            self.connect(&frame, conn);
            return;
        }
        if !self.connected {
            reject(conn, "not connected");
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        let receipt = frame.get(headers::RECEIPT).map(str::to_owned);
        let acknowledged = match frame.command {
            Command::Send => {
                self.request(frame, &session);
                true
            }
            Command::Subscribe => Self::subscribe(&frame, &session),
            Command::Unsubscribe => Self::unsubscribe(&frame, &session),
            Command::Disconnect => {
                if let Some(receipt) = &receipt {
                    send(conn, receipt_frame(receipt));
                }
                debug!(id = %conn.id(), "client disconnected");
                conn.close();
                return;
            }
            Command::Ack | Command::Nack | Command::Begin | Command::Commit | Command::Abort => {
                debug!(id = %conn.id(), command = %frame.command, "ignoring frame");
                true
            }
            Command::Connected
            | Command::Message
            | Command::Receipt
            | Command::Error
            | Command::Connect
            | Command::Stomp => {
                reject(conn, &format!("unexpected {} frame", frame.command));
                false
            }
        };
        if acknowledged && let Some(receipt) = receipt {
            send(conn, receipt_frame(&receipt));
        }
    }

    fn handle_close(&mut self, conn: &ConnectionHandle<StompCodec>) {
        self.sessions.remove(&conn.id());
        self.session = None;
    }
}

fn receipt_frame(receipt: &str) -> Frame { Frame::new(Command::Receipt).header(headers::RECEIPT_ID, receipt) }

fn send(conn: &ConnectionHandle<StompCodec>, frame: Frame) {
    if let Err(err) = conn.send(frame) {
        debug!(id = %conn.id(), error = %err, "dropping frame");
    }
}

/// Answer with `ERROR` and close once it is flushed.
fn reject(conn: &ConnectionHandle<StompCodec>, message: &str) {
    warn!(id = %conn.id(), peer = %conn.peer(), reason = message, "rejecting stomp client");
    send(conn, Frame::error(message));
    conn.close();
}

struct StompResponder {
    session: Arc<StompSession>,
    destination: Arc<str>,
}

impl Responder for StompResponder {
    fn respond(&self, payload: Bytes) {
        if let Err(err) = self.session.deliver(&self.destination, payload) {
            debug!(id = %self.session.conn.id(), error = %err, "dropping reply");
        }
    }
}
