//! Single-threaded readiness reactor.
//!
//! A [`Reactor`] owns one `mio` poller and a table mapping tokens to boxed
//! [`Dispatcher`]s. Exactly one thread runs [`Reactor::process_requests`];
//! every dispatcher callback runs on that thread. Other threads interact
//! through a cloneable [`ReactorHandle`]: they may register dispatchers, ask
//! for one to be closed, wake the poll, or stop the loop.
//!
//! Sockets are registered edge-triggered. Deadlines and pending output are
//! checked on every iteration and the poll never blocks for longer than
//! [`MAX_POLL_WAIT`], so deadline checks stay responsive even when no socket
//! becomes ready.

use std::{
    collections::HashMap,
    fmt,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use mio::{Events, Poll, Token};
use tracing::{debug, error, warn};

use crate::panic::format_panic;

mod dispatcher;
mod waker;

pub use dispatcher::{Context, Dispatcher, Step};
use waker::Wakeup;

/// Upper bound on a single blocking poll.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 256;

enum Command {
    Register(Token, Box<dyn Dispatcher>),
    Close(Token),
}

struct Shared {
    wakeup: Wakeup,
    commands: Mutex<Vec<Command>>,
    stopping: AtomicBool,
    next_token: AtomicUsize,
}

/// Thread-safe handle to a [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

impl ReactorHandle {
    /// Force a blocked poll to return.
    ///
    /// Repeated calls before the reactor drains the signal coalesce into a
    /// single wake.
    pub fn wakeup(&self) {
        if let Err(err) = self.shared.wakeup.wake() {
            warn!(error = %err, "failed to signal reactor wakeup");
        }
    }

    /// Ask the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.wakeup();
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopping(&self) -> bool { self.shared.stopping.load(Ordering::SeqCst) }

    /// Register `dispatcher` from any thread.
    ///
    /// The socket is added to the poller at the start of the next loop
    /// iteration; the returned token identifies it until it closes.
    pub fn register(&self, dispatcher: Box<dyn Dispatcher>) -> Token {
        let token = self.next_token();
        self.push(Command::Register(token, dispatcher));
        token
    }

    /// Close the dispatcher registered under `token`, from any thread.
    pub fn close(&self, token: Token) { self.push(Command::Close(token)); }

    fn push(&self, command: Command) {
        self.shared
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
        self.wakeup();
    }

    fn next_token(&self) -> Token { Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed)) }

    fn take_commands(&self) -> Vec<Command> {
        std::mem::take(
            &mut *self
                .shared
                .commands
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

#[derive(Clone, Copy, Debug)]
enum Op {
    Read,
    Write,
    Timeout,
}

/// Single-threaded event loop over registered dispatchers.
pub struct Reactor {
    poll: Poll,
    events: Events,
    slots: HashMap<Token, Box<dyn Dispatcher>>,
    spawned: Vec<Box<dyn Dispatcher>>,
    kicks: Vec<Token>,
    handle: ReactorHandle,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("dispatchers", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Create a reactor with its own poller and wakeup primitive.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller or eventfd cannot be created.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let wakeup = Wakeup::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(Shared {
            wakeup,
            commands: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        });
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            slots: HashMap::new(),
            spawned: Vec::new(),
            kicks: Vec::new(),
            handle: ReactorHandle { shared },
        })
    }

    /// Handle usable from other threads.
    #[must_use]
    pub fn handle(&self) -> ReactorHandle { self.handle.clone() }

    /// Register `dispatcher` immediately. Only callable from the thread that
    /// owns the reactor; other threads use [`ReactorHandle::register`].
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the socket.
    pub fn create_dispatcher(&mut self, dispatcher: Box<dyn Dispatcher>) -> io::Result<Token> {
        let token = self.handle.next_token();
        self.insert(token, dispatcher)?;
        Ok(token)
    }

    /// Number of registered dispatchers.
    #[must_use]
    pub fn len(&self) -> usize { self.slots.len() }

    /// Whether no dispatcher is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    /// Run the loop on the calling thread until [`ReactorHandle::stop`] is
    /// called, then close every remaining dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if polling itself fails.
    pub fn process_requests(&mut self) -> io::Result<()> {
        debug!("reactor started");
        let result = loop {
            if self.handle.is_stopping() {
                break Ok(());
            }
            if let Err(err) = self.turn(MAX_POLL_WAIT) {
                break Err(err);
            }
        };
        self.close_all();
        debug!("reactor stopped");
        result
    }

    /// Run one loop iteration, blocking for at most `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns an error if polling fails for a reason other than `EINTR`.
    pub fn turn(&mut self, max_wait: Duration) -> io::Result<()> {
        self.apply_commands();

        let now = Instant::now();
        let pending: Vec<Token> = self
            .slots
            .iter()
            .filter(|(_, d)| d.writable())
            .map(|(token, _)| *token)
            .collect();
        for token in pending {
            self.dispatch(token, Op::Write, now);
        }
        self.register_spawned();

        let timeout = self.poll_timeout(max_wait);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let now = Instant::now();
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                (event.token(), readable, writable)
            })
            .collect();
        for (token, readable, writable) in ready {
            if token == WAKE_TOKEN {
                self.handle.shared.wakeup.drain();
                continue;
            }
            // The table is consulted afresh for every event: an earlier
            // event in this batch may have closed or replaced the handler.
            if readable {
                self.dispatch(token, Op::Read, now);
            }
            if writable {
                self.dispatch(token, Op::Write, now);
            }
        }
        self.run_kicks(now);

        let expired: Vec<Token> = self
            .slots
            .iter()
            .filter(|(_, d)| d.deadline().is_some_and(|deadline| deadline <= now))
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            self.dispatch(token, Op::Timeout, now);
        }
        self.run_kicks(now);
        self.register_spawned();
        Ok(())
    }

    /// Eventfd signals sent and wake events drained so far.
    #[cfg(test)]
    pub(crate) fn wake_stats(&self) -> (u64, u64) {
        let wakeup = &self.handle.shared.wakeup;
        (wakeup.signals(), wakeup.drains())
    }

    fn poll_timeout(&self, max_wait: Duration) -> Duration {
        let now = Instant::now();
        self.slots
            .values()
            .filter_map(|d| d.deadline())
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(max_wait, Duration::min)
    }

    fn apply_commands(&mut self) {
        for command in self.handle.take_commands() {
            match command {
                Command::Register(token, dispatcher) => {
                    if let Err(err) = self.insert(token, dispatcher) {
                        warn!(error = %err, "failed to register dispatcher");
                    }
                }
                Command::Close(token) => self.remove(token),
            }
        }
    }

    fn register_spawned(&mut self) {
        for dispatcher in std::mem::take(&mut self.spawned) {
            let token = self.handle.next_token();
            if let Err(err) = self.insert(token, dispatcher) {
                warn!(error = %err, "failed to register dispatcher");
            }
        }
    }

    fn insert(&mut self, token: Token, mut dispatcher: Box<dyn Dispatcher>) -> io::Result<()> {
        let interest = dispatcher.interest();
        self.poll
            .registry()
            .register(dispatcher.source(), token, interest)?;
        debug!(dispatcher = dispatcher.name(), token = token.0, "dispatcher registered");
        self.slots.insert(token, dispatcher);
        Ok(())
    }

    fn run_kicks(&mut self, now: Instant) {
        while let Some(token) = self.kicks.pop() {
            self.dispatch(token, Op::Read, now);
        }
    }

    fn dispatch(&mut self, token: Token, op: Op, now: Instant) {
        let Some(dispatcher) = self.slots.get_mut(&token) else {
            return;
        };
        let mut cx = Context::new(&self.handle, &mut self.spawned, now);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match op {
            Op::Read => dispatcher.handle_read(&mut cx),
            Op::Write => dispatcher.handle_write(&mut cx),
            Op::Timeout => Ok(dispatcher.handle_timeout(&mut cx)),
        }));
        let step = match outcome {
            Ok(Ok(step)) => step,
            // Outside `catch_unwind`: a panic from `handle_error` (the
            // listening socket) ends the loop.
            Ok(Err(err)) => dispatcher.handle_error(err),
            Err(payload) => {
                error!(
                    dispatcher = dispatcher.name(),
                    ?op,
                    panic = %format_panic(payload.as_ref()),
                    "dispatcher callback panicked"
                );
                Step::Close
            }
        };
        match step {
            Step::Continue => {}
            Step::Close => self.remove(token),
            Step::Switch => self.switch(token, now),
        }
    }

    fn switch(&mut self, token: Token, now: Instant) {
        let Some(current) = self.slots.remove(&token) else {
            return;
        };
        let name = current.name();
        let mut cx = Context::new(&self.handle, &mut self.spawned, now);
        let mut next = match panic::catch_unwind(AssertUnwindSafe(|| current.switch(&mut cx))) {
            Ok(next) => next,
            Err(payload) => {
                error!(
                    dispatcher = name,
                    panic = %format_panic(payload.as_ref()),
                    "dispatcher handoff panicked"
                );
                return;
            }
        };
        let interest = next.interest();
        if let Err(err) = self
            .poll
            .registry()
            .reregister(next.source(), token, interest)
        {
            warn!(from = name, to = next.name(), error = %err, "failed to install replacement dispatcher");
            return;
        }
        debug!(from = name, to = next.name(), token = token.0, "dispatcher switched");
        self.slots.insert(token, next);
        self.kicks.push(token);
    }

    fn remove(&mut self, token: Token) {
        let Some(mut dispatcher) = self.slots.remove(&token) else {
            return;
        };
        if let Err(err) = self.poll.registry().deregister(dispatcher.source()) {
            debug!(dispatcher = dispatcher.name(), error = %err, "deregister failed");
        }
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(|| dispatcher.handle_close()))
        {
            error!(
                dispatcher = dispatcher.name(),
                panic = %format_panic(payload.as_ref()),
                "dispatcher close panicked"
            );
        }
        debug!(dispatcher = dispatcher.name(), token = token.0, "dispatcher closed");
    }

    fn close_all(&mut self) {
        // Registrations that raced with `stop` are dropped without running.
        self.apply_commands();
        self.register_spawned();
        let tokens: Vec<Token> = self.slots.keys().copied().collect();
        for token in tokens {
            self.remove(token);
        }
    }
}
