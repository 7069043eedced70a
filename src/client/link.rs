//! Reconnecting connection shared by the client transports.

use std::{
    fmt,
    net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        RwLock,
        Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use socket2::SockRef;
use tracing::{debug, info, warn};

use super::{ClientConfig, ClientError, Incoming, MessageHandler};
use crate::{
    connection::{Connection, ConnectionHandle, ConnectionId, FrameCodec, FrameHandler},
    reactor::ReactorHandle,
    stream::Stream,
};

/// Protocol-specific behaviour of a [`Link`].
pub(crate) trait LinkProtocol: Send + Sync + 'static {
    /// Codec framing the connection.
    type Codec: FrameCodec + Clone;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Fresh codec for a new connection.
    fn codec(&self) -> Self::Codec;

    /// Queue whatever the protocol sends first on every new connection.
    fn on_connect(&self, conn: &ConnectionHandle<Self::Codec>);

    /// Turn an inbound frame into an application message, or consume it.
    fn on_frame(
        &self,
        frame: <Self::Codec as FrameCodec>::Frame,
        conn: &ConnectionHandle<Self::Codec>,
    ) -> Option<Incoming>;
}

struct Inner<P: LinkProtocol> {
    protocol: P,
    config: ClientConfig,
    reactor: ReactorHandle,
    conn: Mutex<Option<ConnectionHandle<P::Codec>>>,
    handler: RwLock<Option<MessageHandler>>,
    closed: AtomicBool,
}

/// One logical client connection that survives reconnects.
pub(crate) struct Link<P: LinkProtocol> {
    inner: Arc<Inner<P>>,
}

impl<P: LinkProtocol> fmt::Debug for Link<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("protocol", &self.inner.protocol.name())
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<P: LinkProtocol> Link<P> {
    /// Dial the server and register the connection with `reactor`.
    pub(crate) fn connect(
        protocol: P,
        config: ClientConfig,
        reactor: &ReactorHandle,
    ) -> Result<Self, ClientError> {
        let inner = Arc::new(Inner {
            protocol,
            config,
            reactor: reactor.clone(),
            conn: Mutex::new(None),
            handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        });
        Inner::dial(&inner)?;
        Ok(Self { inner })
    }

    pub(crate) fn protocol(&self) -> &P { &self.inner.protocol }

    /// Whether a connection is currently established.
    pub(crate) fn is_connected(&self) -> bool { self.inner.current().is_some() }

    /// Run `f` against the live connection.
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&ConnectionHandle<P::Codec>) -> std::io::Result<T>,
    ) -> Result<T, ClientError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let guard = self.inner.conn();
        let conn = guard.as_ref().ok_or(ClientError::Disconnected)?;
        f(conn).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotConnected => ClientError::Disconnected,
            _ => ClientError::Io(err),
        })
    }

    /// Queue `frame` on the live connection.
    pub(crate) fn send(&self, frame: <P::Codec as FrameCodec>::Frame) -> Result<(), ClientError> {
        self.with_connection(|conn| conn.send(frame))
    }

    pub(crate) fn set_message_handler(&self, handler: MessageHandler) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Close the connection and stop reconnecting.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = self.inner.conn().take() {
            conn.close();
        }
        debug!(protocol = self.inner.protocol.name(), "client closed");
    }
}

impl<P: LinkProtocol> Inner<P> {
    fn conn(&self) -> MutexGuard<'_, Option<ConnectionHandle<P::Codec>>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<ConnectionHandle<P::Codec>> { self.conn().clone() }

    fn resolve(&self) -> Result<SocketAddr, ClientError> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|source| ClientError::Resolve {
                address: address.clone(),
                source: Some(source),
            })?
            .next()
            .ok_or(ClientError::Resolve {
                address,
                source: None,
            })
    }

    /// Connect synchronously, queue the protocol's opening frames and hand
    /// the connection to the reactor.
    fn dial(this: &Arc<Self>) -> Result<(), ClientError> {
        let address = this.resolve()?;
        let socket = StdTcpStream::connect_timeout(&address, this.config.connect_timeout)
            .map_err(|source| ClientError::Connect { address, source })?;
        SockRef::from(&socket).set_nodelay(true)?;
        socket.set_nonblocking(true)?;
        let socket = mio::net::TcpStream::from_std(socket);

        let (stream, handshake_timeout) = match &this.config.tls {
            Some(tls) => (tls.connect(socket)?, Some(tls.handshake_timeout())),
            None => (Stream::from(socket), None),
        };
        let handler = LinkHandler {
            link: Arc::downgrade(this),
        };
        let mut connection = Connection::new(
            stream,
            address,
            this.protocol.codec(),
            handler,
            &this.reactor,
        );
        if let Some(timeout) = handshake_timeout {
            connection = connection.with_handshake_timeout(timeout);
        }
        let conn = connection.handle();
        this.protocol.on_connect(&conn);
        {
            let mut slot = this.conn();
            if this.closed.load(Ordering::Acquire) {
                conn.close();
            }
            *slot = Some(conn);
        }
        this.reactor.register(Box::new(connection));
        info!(protocol = this.protocol.name(), %address, "client connected");
        Ok(())
    }

    fn on_frame(&self, frame: <P::Codec as FrameCodec>::Frame, conn: &ConnectionHandle<P::Codec>) {
        let Some(message) = self.protocol.on_frame(frame, conn) else {
            return;
        };
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(message),
            None => debug!(protocol = self.protocol.name(), "no message handler, dropping message"),
        }
    }

    fn on_disconnect(this: &Arc<Self>, id: ConnectionId) {
        {
            let mut slot = this.conn();
            if slot.as_ref().is_none_or(|conn| conn.id() != id) {
                return;
            }
            *slot = None;
        }
        if this.closed.load(Ordering::Acquire) || !this.config.reconnect {
            return;
        }
        warn!(
            protocol = this.protocol.name(),
            host = %this.config.host,
            port = this.config.port,
            "connection lost, reconnecting"
        );
        let link = Arc::clone(this);
        let spawned = thread::Builder::new()
            .name("hostwire-reconnect".into())
            .spawn(move || Self::reconnect(&link));
        if let Err(err) = spawned {
            warn!(error = %err, "failed to start reconnect thread");
        }
    }

    fn reconnect(this: &Arc<Self>) {
        let backoff = this.config.backoff.normalized();
        let mut delay = backoff.initial_delay;
        loop {
            thread::sleep(delay);
            if this.closed.load(Ordering::Acquire) || this.reactor.is_stopping() {
                return;
            }
            match Self::dial(this) {
                Ok(()) => return,
                Err(err) => {
                    debug!(error = %err, ?delay, "reconnect attempt failed");
                    delay = backoff.next_delay(delay);
                }
            }
        }
    }
}

struct LinkHandler<P: LinkProtocol> {
    link: Weak<Inner<P>>,
}

impl<P: LinkProtocol> FrameHandler<P::Codec> for LinkHandler<P> {
    fn name(&self) -> &'static str {
        self.link
            .upgrade()
            .map_or("client", |link| link.protocol.name())
    }

    fn handle_frame(&mut self, frame: <P::Codec as FrameCodec>::Frame, conn: &ConnectionHandle<P::Codec>) {
        if let Some(link) = self.link.upgrade() {
            link.on_frame(frame, conn);
        }
    }

    fn handle_close(&mut self, conn: &ConnectionHandle<P::Codec>) {
        if let Some(link) = self.link.upgrade() {
            Inner::on_disconnect(&link, conn.id());
        }
    }
}
