//! STOMP 1.2 frame model.

use std::{fmt, str::FromStr};

use bytes::Bytes;

use crate::codec::ProtocolError;

/// Header names used by the transport.
pub mod headers {
    /// Versions the client accepts (`CONNECT`).
    pub const ACCEPT_VERSION: &str = "accept-version";
    /// Negotiated version (`CONNECTED`).
    pub const VERSION: &str = "version";
    /// Virtual host (`CONNECT`).
    pub const HOST: &str = "host";
    /// Heart-beat intervals in milliseconds.
    pub const HEART_BEAT: &str = "heart-beat";
    /// Server identification (`CONNECTED`).
    pub const SERVER: &str = "server";
    /// Target of `SEND`, `SUBSCRIBE` and `MESSAGE`.
    pub const DESTINATION: &str = "destination";
    /// Subscription identifier.
    pub const ID: &str = "id";
    /// Subscription a `MESSAGE` is delivered for.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Unique identifier of a `MESSAGE`.
    pub const MESSAGE_ID: &str = "message-id";
    /// Body MIME type.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Body length in octets.
    pub const CONTENT_LENGTH: &str = "content-length";
    /// Receipt requested by the client.
    pub const RECEIPT: &str = "receipt";
    /// Receipt being acknowledged (`RECEIPT`).
    pub const RECEIPT_ID: &str = "receipt-id";
    /// Short error description (`ERROR`).
    pub const MESSAGE: &str = "message";
    /// Destination replies to a `SEND` should go to.
    pub const REPLY_TO: &str = "reply-to";
    /// Acknowledgement mode of a subscription.
    pub const ACK: &str = "ack";
}

/// Content type of JSON-RPC bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The only protocol version spoken.
pub const STOMP_VERSION: &str = "1.2";

/// STOMP frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client connect.
    Connect,
    /// Client connect, 1.2 spelling.
    Stomp,
    /// Server accepts a connect.
    Connected,
    /// Client sends a message.
    Send,
    /// Client subscribes to a destination.
    Subscribe,
    /// Client cancels a subscription.
    Unsubscribe,
    /// Server delivers a message.
    Message,
    /// Server acknowledges a `receipt` header.
    Receipt,
    /// Server reports an error.
    Error,
    /// Client disconnects.
    Disconnect,
    /// Client acknowledges a message.
    Ack,
    /// Client rejects a message.
    Nack,
    /// Client starts a transaction.
    Begin,
    /// Client commits a transaction.
    Commit,
    /// Client aborts a transaction.
    Abort,
}

impl Command {
    /// Wire spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
        }
    }

    /// Whether header values are escaped in frames with this command.
    /// `CONNECT` and `CONNECTED` are exempt for 1.0 compatibility.
    #[must_use]
    pub fn escapes_headers(self) -> bool { !matches!(self, Self::Connect | Self::Connected) }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            other => {
                return Err(ProtocolError::UnknownCommand {
                    command: other.to_owned(),
                });
            }
        })
    }
}

/// One STOMP frame.
///
/// Headers keep their wire order. When a header repeats, the first
/// occurrence is authoritative.
///
/// ```
/// use hostwire::stomp::{Command, Frame};
///
/// let frame = Frame::new(Command::Send)
///     .header("destination", "/queue/a")
///     .with_body(&b"{}"[..]);
/// assert_eq!(frame.get("destination"), Some("/queue/a"));
/// assert_eq!(&frame.body[..], b"{}");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Header name/value pairs in wire order.
    pub headers: Vec<(String, String)>,
    /// Frame body.
    pub body: Bytes,
}

impl Frame {
    /// Frame with no headers and an empty body.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `ERROR` frame carrying `message` in both header and body.
    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::new(Command::Error)
            .header(headers::MESSAGE, message)
            .header(headers::CONTENT_TYPE, "text/plain")
            .with_body(Bytes::copy_from_slice(message.as_bytes()))
    }
}
