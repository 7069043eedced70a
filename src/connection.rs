//! Codec-driven connection dispatcher.
//!
//! [`Connection`] owns a [`Stream`] and drives any `tokio_util` codec over
//! it: bytes read from the socket accumulate in a receive buffer, complete
//! frames are decoded and handed to a [`FrameHandler`] in arrival order.
//! Outbound frames are encoded by a cloneable [`ConnectionHandle`] on the
//! sending thread, queued under a lock and flushed by the reactor.

use std::{
    fmt,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{Buf, BytesMut};
use mio::event::Source;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::{
    metrics::{self, Direction},
    reactor::{Context, Dispatcher, ReactorHandle, Step},
    stream::{ReadOutcome, Stream},
};

const READ_CHUNK: usize = 8 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Allocate the next process-wide identifier.
    #[must_use]
    pub fn next() -> Self { Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ConnectionId({})", self.0) }
}

/// A codec usable by [`Connection`]: decodes and encodes the same frame
/// type with `io::Error` failures.
///
/// Implemented for every `tokio_util` codec of that shape.
pub trait FrameCodec: Send + 'static {
    /// Frame type carried in both directions.
    type Frame: Send + 'static;

    /// Decode one frame from `src` if it holds a complete one.
    ///
    /// # Errors
    ///
    /// Returns an error if `src` cannot be parsed.
    fn decode_frame(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Frame>>;

    /// Decode a final frame once the peer has closed.
    ///
    /// # Errors
    ///
    /// Returns an error if `src` holds a truncated frame.
    fn decode_frame_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Frame>>;

    /// Append the wire form of `frame` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded.
    fn encode_frame(&mut self, frame: Self::Frame, dst: &mut BytesMut) -> io::Result<()>;
}

impl<C> FrameCodec for C
where
    C: Decoder<Error = io::Error> + Encoder<<C as Decoder>::Item, Error = io::Error> + Send + 'static,
    <C as Decoder>::Item: Send + 'static,
{
    type Frame = <C as Decoder>::Item;

    fn decode_frame(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Frame>> { self.decode(src) }

    fn decode_frame_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Frame>> {
        self.decode_eof(src)
    }

    fn encode_frame(&mut self, frame: Self::Frame, dst: &mut BytesMut) -> io::Result<()> {
        self.encode(frame, dst)
    }
}

/// Application callbacks for a [`Connection`]. All run on the reactor
/// thread.
pub trait FrameHandler<C: FrameCodec>: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str { "connection" }

    /// The connection was installed in the reactor. Runs once, before any
    /// frame is delivered.
    fn handle_open(&mut self, _conn: &ConnectionHandle<C>) {}

    /// A complete frame arrived.
    fn handle_frame(&mut self, frame: C::Frame, conn: &ConnectionHandle<C>);

    /// The connection is being removed from the reactor.
    fn handle_close(&mut self, _conn: &ConnectionHandle<C>) {}
}

struct Outbound<C> {
    codec: C,
    buf: BytesMut,
}

struct Shared<C> {
    id: ConnectionId,
    peer: SocketAddr,
    reactor: ReactorHandle,
    outbound: Mutex<Outbound<C>>,
    close_requested: AtomicBool,
    closed: AtomicBool,
}

impl<C> Shared<C> {
    fn outbound(&self) -> std::sync::MutexGuard<'_, Outbound<C>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread-safe sending surface of a [`Connection`].
pub struct ConnectionHandle<C>(Arc<Shared<C>>);

impl<C> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}

impl<C> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.0.id)
            .field("peer", &self.0.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<C> ConnectionHandle<C> {
    /// Identifier of the connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.0.id }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr { self.0.peer }

    /// Whether the connection has closed or a close was requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire) || self.0.close_requested.load(Ordering::Acquire)
    }

    /// Flush pending output, then close. Safe to call from any thread.
    pub fn close(&self) {
        self.0.close_requested.store(true, Ordering::Release);
        self.0.reactor.wakeup();
    }
}

impl<C: FrameCodec> ConnectionHandle<C> {
    /// Encode `frame` and queue it for the reactor to write. Safe to call
    /// from any thread; never waits for the reactor.
    ///
    /// # Errors
    ///
    /// `NotConnected` once the connection is closing; any encoding error.
    pub fn send(&self, frame: C::Frame) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        {
            let mut outbound = self.0.outbound();
            let Outbound { codec, buf } = &mut *outbound;
            codec.encode_frame(frame, buf)?;
        }
        metrics::inc_frames(Direction::Outbound);
        self.0.reactor.wakeup();
        Ok(())
    }

    fn has_pending(&self) -> bool { !self.0.outbound().buf.is_empty() }
}

/// Reactor dispatcher that frames a stream with codec `C` and feeds `H`.
pub struct Connection<C: FrameCodec, H> {
    stream: Stream,
    decoder: C,
    read_buf: BytesMut,
    write_buf: BytesMut,
    handler: H,
    handle: ConnectionHandle<C>,
    opened: bool,
    handshake_deadline: Option<Instant>,
}

impl<C: FrameCodec, H> fmt::Debug for Connection<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("buffered_in", &self.read_buf.len())
            .field("buffered_out", &self.write_buf.len())
            .finish_non_exhaustive()
    }
}

impl<C, H> Connection<C, H>
where
    C: FrameCodec + Clone,
    H: FrameHandler<C>,
{
    /// Wrap `stream`; `codec` is cloned so decoding on the reactor thread and
    /// encoding on sender threads never share state.
    pub fn new(stream: Stream, peer: SocketAddr, codec: C, handler: H, reactor: &ReactorHandle) -> Self {
        let handle = ConnectionHandle(Arc::new(Shared {
            id: ConnectionId::next(),
            peer,
            reactor: reactor.clone(),
            outbound: Mutex::new(Outbound {
                codec: codec.clone(),
                buf: BytesMut::new(),
            }),
            close_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }));
        metrics::inc_connections();
        Self {
            stream,
            decoder: codec,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            handler,
            handle,
            opened: false,
            handshake_deadline: None,
        }
    }
}

impl<C: FrameCodec, H: FrameHandler<C>> Connection<C, H> {
    /// Close the connection if a TLS stream has not finished its handshake
    /// within `timeout`. The handshake itself is driven by ordinary reads
    /// and writes.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_deadline = Some(Instant::now() + timeout);
        self
    }

    /// Sending handle for this connection.
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle<C> { self.handle.clone() }

    fn ensure_open(&mut self) {
        if !self.opened {
            self.opened = true;
            self.handler.handle_open(&self.handle);
        }
    }

    fn flush(&mut self) -> io::Result<Step> {
        {
            let mut outbound = self.handle.0.outbound();
            if self.write_buf.is_empty() {
                std::mem::swap(&mut self.write_buf, &mut outbound.buf);
            } else if !outbound.buf.is_empty() {
                self.write_buf.extend_from_slice(&outbound.buf);
                outbound.buf.clear();
            }
        }
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        self.stream.flush()?;
        if self.handle.0.close_requested.load(Ordering::Acquire)
            && self.write_buf.is_empty()
            && !self.handle.has_pending()
            && !self.stream.wants_write()
        {
            debug!(id = %self.handle.id(), "closing after flushing output");
            self.stream.shutdown();
            return Ok(Step::Close);
        }
        Ok(Step::Continue)
    }

    fn deliver(&mut self, eof: bool) -> io::Result<()> {
        while !self.handle.is_closed()
            && let Some(frame) = self.decoder.decode_frame(&mut self.read_buf)?
        {
            metrics::inc_frames(Direction::Inbound);
            self.handler.handle_frame(frame, &self.handle);
        }
        if eof
            && !self.handle.is_closed()
            && let Some(frame) = self.decoder.decode_frame_eof(&mut self.read_buf)?
        {
            metrics::inc_frames(Direction::Inbound);
            self.handler.handle_frame(frame, &self.handle);
        }
        Ok(())
    }
}

impl<C: FrameCodec, H: FrameHandler<C>> Dispatcher for Connection<C, H> {
    fn name(&self) -> &'static str { self.handler.name() }

    fn source(&mut self) -> &mut dyn Source { self.stream.source() }

    fn writable(&self) -> bool {
        !self.write_buf.is_empty()
            || self.stream.wants_write()
            || self.handle.0.close_requested.load(Ordering::Acquire)
            || self.handle.has_pending()
    }

    fn is_handshaking(&self) -> bool { self.stream.is_handshaking() }

    fn deadline(&self) -> Option<Instant> {
        self.handshake_deadline
            .filter(|_| self.stream.is_handshaking())
    }

    fn handle_timeout(&mut self, _cx: &mut Context<'_>) -> Step {
        warn!(peer = %self.handle.peer(), "TLS handshake timed out, closing");
        metrics::inc_handshake_failures();
        Step::Close
    }

    fn handle_read(&mut self, _cx: &mut Context<'_>) -> io::Result<Step> {
        self.ensure_open();
        let mut chunk = [0_u8; READ_CHUNK];
        let mut eof = false;
        loop {
            match self.stream.read(&mut chunk) {
                ReadOutcome::Data(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    // Decode as we go so one busy peer cannot grow the
                    // buffer without bound before frames are checked.
                    self.deliver(false)?;
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Closed => {
                    eof = true;
                    break;
                }
                ReadOutcome::Error(err) => return Err(err),
            }
        }
        self.deliver(eof)?;
        if eof {
            debug!(id = %self.handle.id(), peer = %self.handle.peer(), "peer closed connection");
            return Ok(Step::Close);
        }
        self.flush()
    }

    fn handle_write(&mut self, _cx: &mut Context<'_>) -> io::Result<Step> {
        self.ensure_open();
        self.flush()
    }

    fn handle_close(&mut self) {
        self.handle.0.closed.store(true, Ordering::Release);
        self.handler.handle_close(&self.handle);
    }

    fn switch(self: Box<Self>, _cx: &mut Context<'_>) -> Box<dyn Dispatcher> { self }
}

impl<C: FrameCodec, H> Drop for Connection<C, H> {
    fn drop(&mut self) {
        self.handle.0.closed.store(true, Ordering::Release);
        metrics::dec_connections();
    }
}
