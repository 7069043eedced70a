//! Client transports.
//!
//! A client dials one server, registers the connection with a reactor and
//! keeps it alive: when the connection drops for any reason other than
//! [`ClientTransport::close`], it re-dials with exponential back-off and
//! replays the protocol's connect sequence. The framed and STOMP clients
//! both implement [`ClientTransport`], which is all the JSON-RPC client needs.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;

mod backoff;
mod error;
mod link;

pub use backoff::BackoffConfig;
pub use error::ClientError;
pub(crate) use link::{Link, LinkProtocol};

use crate::tls::ClientTls;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A payload received from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Incoming {
    /// Message body.
    pub payload: Bytes,
    /// Destination the message was delivered on, for transports that have
    /// destinations.
    pub destination: Option<String>,
}

/// Callback invoked on the reactor thread for every inbound payload.
pub type MessageHandler = Arc<dyn Fn(Incoming) + Send + Sync>;

/// Byte transport used by the JSON-RPC client.
pub trait ClientTransport: Send + Sync {
    /// Queue `payload` for the server. `destination` selects a STOMP
    /// destination; transports without destinations ignore it.
    ///
    /// # Errors
    ///
    /// [`ClientError::Disconnected`] while no connection is established,
    /// [`ClientError::Closed`] after [`close`](Self::close).
    fn send(&self, payload: Bytes, destination: Option<&str>) -> Result<(), ClientError>;

    /// Replace the callback receiving inbound payloads.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Ask the server to deliver messages published to `destination`.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    fn subscribe(&self, _destination: &str) -> Result<(), ClientError> { Ok(()) }

    /// Stop delivery for `destination`.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    fn unsubscribe(&self, _destination: &str) -> Result<(), ClientError> { Ok(()) }

    /// Close the connection and stop reconnecting.
    fn close(&self);
}

/// Where and how a client connects.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TLS settings; `None` connects in cleartext.
    pub tls: Option<ClientTls>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Delays between reconnection attempts.
    pub backoff: BackoffConfig,
    /// Whether to re-dial after the connection drops.
    pub reconnect: bool,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("backoff", &self.backoff)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl ClientConfig {
    /// Cleartext connection to `host:port` with default timeouts, reconnecting
    /// on failure.
    ///
    /// ```
    /// use hostwire::client::ClientConfig;
    ///
    /// let config = ClientConfig::new("localhost", 4044).reconnect(false);
    /// assert_eq!(config.port, 4044);
    /// assert!(!config.reconnect);
    /// ```
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffConfig::default(),
            reconnect: true,
        }
    }

    /// Connect over TLS.
    #[must_use]
    pub fn tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Override the TCP connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the reconnection back-off.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Enable or disable reconnection.
    #[must_use]
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[cfg(test)]
mod tests;
