//! Bounded worker pool for RPC method execution.
//!
//! Methods run on the blocking threads of a dedicated `tokio` runtime so a
//! slow method never stalls the reactor. A semaphore caps how many jobs may
//! be queued or running; when no permit is free the job is refused rather
//! than queued without bound. Jobs run inside the span that was current
//! when they were queued.

use std::{future::Future, io, sync::Arc};

use thiserror::Error;
use tokio::{
    runtime::{Builder, Handle, Runtime},
    sync::Semaphore,
};
use tracing::Span;

/// Default number of concurrently executing methods.
pub const DEFAULT_WORKERS: usize = 8;

/// Default number of jobs admitted at once, running or waiting.
pub const DEFAULT_CAPACITY: usize = 1024;

/// The pool has no free capacity.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("worker pool exhausted")]
pub struct PoolExhausted;

/// Executor with bounded capacity.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Pool running at most `workers` methods at once and admitting at most
    /// `capacity` jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime threads cannot be started.
    pub fn new(workers: usize, capacity: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("hostwire-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        })
    }

    /// Pool with the default sizes.
    ///
    /// # Errors
    ///
    /// As for [`new`](Self::new).
    pub fn with_defaults() -> io::Result<Self> { Self::new(DEFAULT_WORKERS, DEFAULT_CAPACITY) }

    /// Queue `job` if capacity allows.
    ///
    /// # Errors
    ///
    /// [`PoolExhausted`] when every permit is taken.
    pub fn try_spawn<F>(&self, job: F) -> Result<(), PoolExhausted>
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| PoolExhausted)?;
        let span = Span::current();
        drop(self.handle.spawn_blocking(move || {
            let _permit = permit;
            span.in_scope(job);
        }));
        Ok(())
    }

    /// Free capacity right now.
    #[must_use]
    pub fn available(&self) -> usize { self.permits.available_permits() }

    /// Drive `future` to completion on the pool's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output { self.handle.block_on(future) }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        time::Duration,
    };

    use super::*;

    #[test]
    fn runs_jobs_off_the_calling_thread() {
        let pool = WorkerPool::new(2, 4).expect("pool");
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        pool.try_spawn(move || {
            tx.send(std::thread::current().id()).expect("send");
        })
        .expect("spawn");
        let worker = rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        assert_ne!(worker, caller);
    }

    #[test]
    fn refuses_jobs_beyond_capacity() {
        let pool = WorkerPool::new(1, 1).expect("pool");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.try_spawn(move || {
            let _ = release_rx.recv();
        })
        .expect("first job");
        assert_eq!(pool.try_spawn(|| {}), Err(PoolExhausted));
        release_tx.send(()).expect("release");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.available() == 0 {
            assert!(std::time::Instant::now() < deadline, "permit never returned");
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.try_spawn(|| {}).expect("capacity restored");
    }
}
