//! Coalescing cross-thread wakeup for the reactor's poll.

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::{
    io,
    sync::{Mutex, PoisonError},
};

use mio::{Registry, Token, Waker};

/// Thread-safe wakeup primitive registered with the reactor's poller.
///
/// The first [`wake`](Self::wake) after a drain signals the underlying
/// eventfd; later calls see the `signalled` flag and return without touching
/// it. [`drain`](Self::drain) clears the flag under the same lock.
pub(crate) struct Wakeup {
    waker: Waker,
    signalled: Mutex<bool>,
    #[cfg(test)]
    signals: AtomicU64,
    #[cfg(test)]
    drains: AtomicU64,
}

impl Wakeup {
    pub(crate) fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            waker: Waker::new(registry, token)?,
            signalled: Mutex::new(false),
            #[cfg(test)]
            signals: AtomicU64::new(0),
            #[cfg(test)]
            drains: AtomicU64::new(0),
        })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        if *signalled {
            return Ok(());
        }
        self.waker.wake()?;
        *signalled = true;
        #[cfg(test)]
        self.signals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn drain(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        *signalled = false;
        #[cfg(test)]
        self.drains.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of times the eventfd was actually signalled.
    #[cfg(test)]
    pub(crate) fn signals(&self) -> u64 { self.signals.load(Ordering::Relaxed) }

    /// Number of wake events the reactor observed and drained.
    #[cfg(test)]
    pub(crate) fn drains(&self) -> u64 { self.drains.load(Ordering::Relaxed) }
}
