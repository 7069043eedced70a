//! The polymorphic handler interface driven by the [`Reactor`](super::Reactor).

use std::{io, time::Instant};

use mio::{Interest, event::Source};
use tracing::warn;

use super::ReactorHandle;

/// What the reactor should do with a dispatcher after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Step {
    /// Keep the dispatcher registered.
    Continue,
    /// Deregister the socket, call [`Dispatcher::handle_close`] and drop it.
    Close,
    /// Replace this dispatcher with the one returned by
    /// [`Dispatcher::switch`]. The socket stays registered under the same
    /// token and the replacement is offered a read immediately.
    Switch,
}

/// Per-callback access to the reactor.
pub struct Context<'a> {
    handle: &'a ReactorHandle,
    spawned: &'a mut Vec<Box<dyn Dispatcher>>,
    now: Instant,
}

impl<'a> Context<'a> {
    pub(super) fn new(
        handle: &'a ReactorHandle,
        spawned: &'a mut Vec<Box<dyn Dispatcher>>,
        now: Instant,
    ) -> Self {
        Self {
            handle,
            spawned,
            now,
        }
    }

    /// Cloneable handle to the reactor running this callback.
    #[must_use]
    pub fn reactor(&self) -> &ReactorHandle { self.handle }

    /// Register a new dispatcher once the current callback returns.
    pub fn spawn(&mut self, dispatcher: Box<dyn Dispatcher>) { self.spawned.push(dispatcher); }

    /// Time the current loop iteration started.
    #[must_use]
    pub fn now(&self) -> Instant { self.now }
}

/// A handler bound to one socket and driven by a single reactor thread.
///
/// Callbacks never run concurrently with each other, so implementations need
/// no locking against the reactor. State shared with other threads (outbound
/// queues, close requests) must be synchronised by the implementation.
///
/// Errors returned from [`handle_read`](Self::handle_read) and
/// [`handle_write`](Self::handle_write) are routed to
/// [`handle_error`](Self::handle_error); panics are caught, logged and close
/// the dispatcher.
pub trait Dispatcher: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// The socket this dispatcher is registered with.
    fn source(&mut self) -> &mut dyn Source;

    /// Readiness interest for the socket.
    fn interest(&self) -> Interest { Interest::READABLE | Interest::WRITABLE }

    /// Whether there is output waiting to be written. Queried before every
    /// poll; `true` makes the reactor call [`handle_write`](Self::handle_write).
    fn writable(&self) -> bool { false }

    /// Monotonic deadline after which [`handle_timeout`](Self::handle_timeout)
    /// fires.
    fn deadline(&self) -> Option<Instant> { None }

    /// Whether the socket is mid TLS handshake.
    fn is_handshaking(&self) -> bool { false }

    /// The socket is readable (or a replacement was just installed).
    ///
    /// # Errors
    ///
    /// Any I/O error; it is passed to [`handle_error`](Self::handle_error).
    fn handle_read(&mut self, cx: &mut Context<'_>) -> io::Result<Step>;

    /// The socket is writable or [`writable`](Self::writable) reported
    /// pending output.
    ///
    /// # Errors
    ///
    /// Any I/O error; it is passed to [`handle_error`](Self::handle_error).
    fn handle_write(&mut self, _cx: &mut Context<'_>) -> io::Result<Step> { Ok(Step::Continue) }

    /// The deadline elapsed.
    fn handle_timeout(&mut self, _cx: &mut Context<'_>) -> Step { Step::Close }

    /// A callback failed or the poller flagged the socket.
    fn handle_error(&mut self, err: io::Error) -> Step {
        if self.is_handshaking() {
            warn!(dispatcher = self.name(), error = %err, "error during TLS handshake, closing");
        } else {
            warn!(dispatcher = self.name(), error = %err, "I/O error, closing connection");
        }
        Step::Close
    }

    /// The dispatcher is being removed; its socket closes when it is dropped.
    fn handle_close(&mut self) {}

    /// Consume this dispatcher after it returned [`Step::Switch`], handing its
    /// socket to the dispatcher that replaces it.
    fn switch(self: Box<Self>, cx: &mut Context<'_>) -> Box<dyn Dispatcher>;
}
