//! Error types for client transports.

use std::io;

use crate::tls::TlsError;

/// Errors emitted by [`ClientTransport`](super::ClientTransport)
/// implementations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport or codec error.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The server address could not be resolved.
    #[error("failed to resolve {address}")]
    Resolve {
        /// `host:port` being resolved.
        address: String,
        /// Underlying error, if resolution itself failed.
        #[source]
        source: Option<io::Error>,
    },
    /// The TCP connection could not be established.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Address dialled.
        address: std::net::SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// TLS could not be set up for the connection.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    /// No connection is currently established; a reconnect may be under way.
    #[error("not connected")]
    Disconnected,
    /// The client was closed.
    #[error("client closed")]
    Closed,
}
