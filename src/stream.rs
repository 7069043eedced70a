//! Byte stream handed between dispatchers.
//!
//! A [`Stream`] is either a plain non-blocking TCP socket or the same socket
//! wrapped in a TLS session. Every dispatcher that owns a connection holds
//! one, and ownership moves with each handoff: handshake, detection, then
//! the bound protocol.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};

use mio::{event::Source, net::TcpStream};
use tracing::debug;

use crate::tls::TlsStream;

/// Result of a non-blocking read or peek.
#[derive(Debug)]
pub enum ReadOutcome {
    /// This many bytes were copied into the buffer.
    Data(usize),
    /// Nothing available yet; wait for the next readiness event.
    WouldBlock,
    /// The peer closed its side cleanly.
    Closed,
    /// The read failed.
    Error(io::Error),
}

impl ReadOutcome {
    fn from_io(result: io::Result<usize>) -> Self {
        match result {
            Ok(0) => Self::Closed,
            Ok(n) => Self::Data(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Self::WouldBlock,
            Err(err) => Self::Error(err),
        }
    }
}

/// A connected socket, optionally encrypted.
pub enum Stream {
    /// Cleartext TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream>),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "plain",
            Self::Tls(_) => "tls",
        };
        f.debug_struct("Stream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl From<TcpStream> for Stream {
    fn from(socket: TcpStream) -> Self { Self::Plain(socket) }
}

impl From<TlsStream> for Stream {
    fn from(stream: TlsStream) -> Self { Self::Tls(Box::new(stream)) }
}

impl Stream {
    fn socket(&self) -> &TcpStream {
        match self {
            Self::Plain(socket) => socket,
            Self::Tls(tls) => tls.socket(),
        }
    }

    /// The registrable socket.
    pub fn source(&mut self) -> &mut dyn Source {
        match self {
            Self::Plain(socket) => socket,
            Self::Tls(tls) => tls.socket_mut(),
        }
    }

    /// Remote address of the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is no longer connected.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> { self.socket().peer_addr() }

    /// Whether the stream is encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool { matches!(self, Self::Tls(_)) }

    /// Whether a TLS handshake is still in progress.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Tls(tls) => tls.is_handshaking(),
        }
    }

    /// Whether output is buffered below the caller, waiting for the socket.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Tls(tls) => tls.wants_write(),
        }
    }

    /// Copy incoming bytes into `buf` without consuming them.
    pub fn peek(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self {
            Self::Plain(socket) => ReadOutcome::from_io(socket.peek(buf)),
            Self::Tls(tls) => tls.peek(buf),
        }
    }

    /// Read incoming bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self {
            Self::Plain(socket) => loop {
                match socket.read(buf) {
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    other => break ReadOutcome::from_io(other),
                }
            },
            Self::Tls(tls) => tls.read(buf),
        }
    }

    /// Write as much of `buf` as the socket accepts.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when nothing could be written; any other socket error.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(socket) => socket.write(buf),
            Self::Tls(tls) => tls.write(buf),
        }
    }

    /// Push buffered TLS records to the socket.
    ///
    /// # Errors
    ///
    /// Any socket error other than `WouldBlock`.
    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(_) => Ok(()),
            Self::Tls(tls) => tls.flush_tls(),
        }
    }

    /// Close the write side, sending `close_notify` first over TLS.
    pub fn shutdown(&mut self) {
        if let Self::Tls(tls) = self {
            tls.shutdown();
        }
        if let Err(err) = self.socket().shutdown(Shutdown::Write) {
            debug!(error = %err, "socket shutdown failed");
        }
    }
}
