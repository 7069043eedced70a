//! Client side of the STOMP transport.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{
    DEFAULT_REQUEST_DESTINATION,
    DEFAULT_RESPONSE_DESTINATION,
    codec::StompCodec,
    frame::{Command, Frame, JSON_CONTENT_TYPE, STOMP_VERSION, headers},
};
use crate::{
    client::{ClientConfig, ClientError, ClientTransport, Incoming, Link, LinkProtocol, MessageHandler},
    codec::DEFAULT_MAX_FRAME_LENGTH,
    connection::ConnectionHandle,
    reactor::ReactorHandle,
};

/// Destinations and limits of a [`StompClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StompOptions {
    /// Where `send` without an explicit destination goes.
    pub request_destination: String,
    /// Where the server should deliver replies; subscribed on connect.
    pub response_destination: String,
    /// Maximum frame body length in either direction.
    pub max_frame_length: usize,
}

impl Default for StompOptions {
    fn default() -> Self {
        Self {
            request_destination: DEFAULT_REQUEST_DESTINATION.to_owned(),
            response_destination: DEFAULT_RESPONSE_DESTINATION.to_owned(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

#[derive(Debug)]
struct StompLink {
    host: String,
    options: StompOptions,
    /// Destination to subscription id; replayed on every connect.
    subscriptions: Mutex<HashMap<String, String>>,
    next_subscription: AtomicU64,
}

impl StompLink {
    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a subscription, returning its id if it is new.
    fn add_subscription(&self, destination: &str) -> Option<String> {
        let mut subscriptions = self.subscriptions();
        if subscriptions.contains_key(destination) {
            return None;
        }
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        subscriptions.insert(destination.to_owned(), id.clone());
        Some(id)
    }
}

fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header(headers::ID, id)
        .header(headers::DESTINATION, destination)
        .header(headers::ACK, "auto")
}

impl LinkProtocol for StompLink {
    type Codec = StompCodec;

    fn name(&self) -> &'static str { super::PROTOCOL_NAME }

    fn codec(&self) -> StompCodec { StompCodec::new(self.options.max_frame_length) }

    fn on_connect(&self, conn: &ConnectionHandle<StompCodec>) {
        let mut frames = vec![
            Frame::new(Command::Connect)
                .header(headers::ACCEPT_VERSION, STOMP_VERSION)
                .header(headers::HOST, self.host.as_str())
                .header(headers::HEART_BEAT, "0,0"),
        ];
        frames.extend(
            self.subscriptions()
                .iter()
                .map(|(destination, id)| subscribe_frame(id, destination)),
        );
        for frame in frames {
            if let Err(err) = conn.send(frame) {
                debug!(error = %err, "connect sequence interrupted");
                return;
            }
        }
    }

    fn on_frame(&self, frame: Frame, conn: &ConnectionHandle<StompCodec>) -> Option<Incoming> {
        match frame.command {
            Command::Message => Some(Incoming {
                destination: frame.get(headers::DESTINATION).map(str::to_owned),
                payload: frame.body,
            }),
            Command::Error => {
                warn!(
                    id = %conn.id(),
                    reason = frame.get(headers::MESSAGE).unwrap_or_default(),
                    body = %String::from_utf8_lossy(&frame.body),
                    "server reported an error"
                );
                None
            }
            Command::Connected => {
                debug!(
                    id = %conn.id(),
                    version = frame.get(headers::VERSION).unwrap_or_default(),
                    "stomp session established"
                );
                None
            }
            other => {
                debug!(id = %conn.id(), command = %other, "ignoring frame");
                None
            }
        }
    }
}

/// Client for the STOMP transport.
///
/// Requests go out as `SEND` frames to the request destination with
/// `reply-to` naming the response destination, which the client subscribes
/// to on every (re)connect. Subscriptions made through
/// [`ClientTransport::subscribe`] survive reconnects the same way.
#[derive(Debug)]
pub struct StompClient {
    link: Link<StompLink>,
}

impl StompClient {
    /// Dial with the default destinations.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the first connection attempt fails.
    pub fn connect(config: ClientConfig, reactor: &ReactorHandle) -> Result<Self, ClientError> {
        Self::connect_with(config, reactor, StompOptions::default())
    }

    /// Dial with explicit destinations and limits.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the first connection attempt fails.
    pub fn connect_with(
        config: ClientConfig,
        reactor: &ReactorHandle,
        options: StompOptions,
    ) -> Result<Self, ClientError> {
        let protocol = StompLink {
            host: config.host.clone(),
            options,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
        };
        protocol.add_subscription(&protocol.options.response_destination);
        let link = Link::connect(protocol, config, reactor)?;
        Ok(Self { link })
    }

    /// Whether a connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.link.is_connected() }

    /// Destinations currently subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.link.protocol().subscriptions().keys().cloned().collect();
        destinations.sort();
        destinations
    }

    /// Send `frame` now if connected; a disconnected link replays
    /// subscriptions on reconnect, so the frame is not needed then.
    fn send_control(&self, frame: Frame) -> Result<(), ClientError> {
        match self.link.send(frame) {
            Err(ClientError::Disconnected) => Ok(()),
            other => other,
        }
    }
}

impl ClientTransport for StompClient {
    fn send(&self, payload: Bytes, destination: Option<&str>) -> Result<(), ClientError> {
        let options = &self.link.protocol().options;
        let frame = Frame::new(Command::Send)
            .header(
                headers::DESTINATION,
                destination.unwrap_or(&options.request_destination),
            )
            .header(headers::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(headers::REPLY_TO, options.response_destination.as_str())
            .with_body(payload);
        self.link.send(frame)
    }

    fn set_message_handler(&self, handler: MessageHandler) { self.link.set_message_handler(handler); }

    fn subscribe(&self, destination: &str) -> Result<(), ClientError> {
        let Some(id) = self.link.protocol().add_subscription(destination) else {
            return Ok(());
        };
        self.send_control(subscribe_frame(&id, destination))
    }

    fn unsubscribe(&self, destination: &str) -> Result<(), ClientError> {
        let Some(id) = self.link.protocol().subscriptions().remove(destination) else {
            return Ok(());
        };
        self.send_control(Frame::new(Command::Unsubscribe).header(headers::ID, id))
    }

    fn close(&self) {
        if self.link.is_connected()
            && let Err(err) = self.link.send(Frame::new(Command::Disconnect))
        {
            debug!(error = %err, "DISCONNECT not sent");
        }
        self.link.close();
    }
}

impl Drop for StompClient {
    fn drop(&mut self) { self.close(); }
}
