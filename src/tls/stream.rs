//! Non-blocking TLS over a `mio` TCP socket.

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use rustls::Connection;
use tracing::debug;

use crate::stream::ReadOutcome;

const CHUNK: usize = 16 * 1024;

/// A TCP socket paired with one `rustls` session.
///
/// Decrypted bytes are staged in a local buffer so callers can peek at them
/// without consuming, exactly as they would with a plain socket.
pub struct TlsStream {
    socket: TcpStream,
    conn: Connection,
    plaintext: BytesMut,
    eof: bool,
}

impl TlsStream {
    /// Wrap `socket` with a client or server session.
    pub fn new(socket: TcpStream, conn: impl Into<Connection>) -> Self {
        Self {
            socket,
            conn: conn.into(),
            plaintext: BytesMut::new(),
            eof: false,
        }
    }

    /// The underlying socket.
    pub fn socket(&self) -> &TcpStream { &self.socket }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream { &mut self.socket }

    /// Whether the handshake is still in progress.
    #[must_use]
    pub fn is_handshaking(&self) -> bool { self.conn.is_handshaking() }

    /// Whether encrypted records are waiting to be written to the socket.
    #[must_use]
    pub fn wants_write(&self) -> bool { self.conn.wants_write() }

    /// Advance the handshake as far as the socket allows.
    ///
    /// Returns `true` once the handshake has completed.
    ///
    /// # Errors
    ///
    /// Returns an error on a TLS protocol or certificate failure, or if the
    /// peer closes the socket mid-handshake.
    pub fn drive_handshake(&mut self) -> io::Result<bool> {
        self.flush_tls()?;
        self.fill()?;
        self.flush_tls()?;
        if self.conn.is_handshaking() && self.eof {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection during the TLS handshake",
            ));
        }
        Ok(!self.conn.is_handshaking())
    }

    /// Copy up to `buf.len()` decrypted bytes without consuming them.
    pub fn peek(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if let Err(err) = self.fill() {
            return ReadOutcome::Error(err);
        }
        let n = buf.len().min(self.plaintext.len());
        buf[..n].copy_from_slice(&self.plaintext[..n]);
        self.outcome(n)
    }

    /// Read decrypted bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.plaintext.is_empty()
            && let Err(err) = self.fill()
        {
            return ReadOutcome::Error(err);
        }
        let n = buf.len().min(self.plaintext.len());
        buf[..n].copy_from_slice(&self.plaintext[..n]);
        self.plaintext.advance(n);
        self.outcome(n)
    }

    /// Encrypt `buf` and push as many records as the socket accepts.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if the session cannot buffer more plaintext; any socket
    /// error.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.flush_tls()?;
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    /// Write pending TLS records until the socket would block.
    ///
    /// # Errors
    ///
    /// Any socket error other than `WouldBlock`.
    pub fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.socket) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Queue a `close_notify` alert and try to send it.
    pub fn shutdown(&mut self) {
        self.conn.send_close_notify();
        if let Err(err) = self.flush_tls() {
            debug!(error = %err, "failed to send TLS close_notify");
        }
    }

    fn outcome(&self, n: usize) -> ReadOutcome {
        if n > 0 {
            ReadOutcome::Data(n)
        } else if self.eof {
            ReadOutcome::Closed
        } else {
            ReadOutcome::WouldBlock
        }
    }

    /// Pull every available record off the socket and stage its plaintext.
    fn fill(&mut self) -> io::Result<()> {
        while !self.eof {
            match self.conn.read_tls(&mut self.socket) {
                Ok(0) => self.eof = true,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            if let Err(err) = self.conn.process_new_packets() {
                // Send the alert rustls queued for the peer before failing.
                if let Err(flush) = self.flush_tls() {
                    debug!(error = %flush, "failed to send TLS alert");
                }
                return Err(io::Error::new(io::ErrorKind::InvalidData, err));
            }
            self.drain_plaintext()?;
        }
        Ok(())
    }

    fn drain_plaintext(&mut self) -> io::Result<()> {
        let mut chunk = [0_u8; CHUNK];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.plaintext.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}
