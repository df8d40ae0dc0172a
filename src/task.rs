//! Job execution.
//!
//! Continuations, connection handlers and the read/write syscalls of a
//! [crate::net::Channel] never run on the reactor thread. Instead they are
//! handed to an [Executor] as a boxed [Job]. Two executors are provided:
//!
//! 1. [ThreadPool], a fixed set of named worker threads fed through a
//!    multi-producer channel. This is what a [crate::reactor::Reactor] uses
//!    unless it is configured otherwise.
//! 2. [Inline], which runs the job on the calling thread. Useful in tests and
//!    for continuations cheap enough that a thread hop would dominate.
//!
//! # Example
//!
//! ```
//! use tether::futures::Promise;
//! use tether::task::{Executor, ThreadPool};
//! use std::sync::Arc;
//!
//! let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(2, "example").unwrap());
//! let promise = Promise::new();
//! let fut = promise.future().with_executor(pool.clone(), true);
//!
//! pool.execute(Box::new(move || {
//!     promise.complete(2 + 8);
//! }))
//! .unwrap();
//!
//! assert_eq!(fut.get().unwrap(), 10);
//! ```
use std::{
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Mutex, PoisonError, RwLock},
    thread::{self, JoinHandle, ThreadId},
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error};

use crate::error::{Error, Result};

/// A unit of work handed to an [Executor].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs.
///
/// Implementations must be callable from any thread, including the reactor
/// thread, and must never run the job on the caller's stack *unless* they are
/// documented to do so (as [Inline] is).
pub trait Executor: Send + Sync {
    /// Schedule `job` for execution. Returns [Error::Rejected] if the executor
    /// can no longer accept work; the job is dropped in that case.
    fn execute(&self, job: Job) -> Result<()>;
}

/// Runs each job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}

/// A fixed-size pool of worker threads.
///
/// Jobs are run in the order they were submitted by whichever worker is free
/// first. A panicking job is logged and does not take its worker down with it.
/// Dropping the pool (or calling [ThreadPool::shutdown]) stops accepting jobs,
/// lets the workers drain what has already been queued and joins them.
pub struct ThreadPool {
    tx: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ids: Vec<ThreadId>,
}

impl ThreadPool {
    /// Spawn `size` workers named `{name}-{n}`. A `size` of zero is treated as
    /// one.
    pub fn new(size: usize, name: &str) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size.max(1));

        for n in 0..size.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_loop(rx))?;

            workers.push(handle);
        }

        let ids = workers.iter().map(|w| w.thread().id()).collect();

        Ok(Self {
            tx: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            ids,
        })
    }

    /// The number of worker threads.
    pub fn size(&self) -> usize {
        self.ids.len()
    }

    /// Stop accepting jobs and wait for the workers to drain the queue.
    ///
    /// When called from one of the pool's own workers the workers are told to
    /// stop but are not joined, as that would deadlock.
    pub fn shutdown(&self) {
        let tx = self
            .tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if tx.is_none() {
            return;
        }

        drop(tx);

        if self.ids.contains(&thread::current().id()) {
            debug!("thread pool shut down from one of its own workers");
            return;
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for worker in workers {
            if worker.join().is_err() {
                error!("thread pool worker exited abnormally");
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                "job panicked on worker {}",
                thread::current().name().unwrap_or("<unnamed>")
            );
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> Result<()> {
        let tx = self.tx.read().unwrap_or_else(PoisonError::into_inner);

        match tx.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| Error::Rejected),
            None => Err(Error::Rejected),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc::channel,
            Arc,
        },
        time::Duration,
    };

    use super::{Executor, Inline, ThreadPool};
    use crate::error::Error;

    #[test]
    fn inline_runs_on_caller() {
        let caller = std::thread::current().id();
        let (tx, rx) = channel();

        Inline
            .execute(Box::new(move || tx.send(std::thread::current().id()).unwrap()))
            .unwrap();

        assert_eq!(rx.recv().unwrap(), caller);
    }

    #[test]
    fn pool_runs_all_jobs() {
        let pool = ThreadPool::new(4, "pool-test").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel();

        for _ in 0..100 {
            let count = count.clone();
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }))
            .unwrap();
        }

        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 100);
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn pool_survives_panicking_job() {
        let pool = ThreadPool::new(1, "pool-panic").unwrap();
        let (tx, rx) = channel();

        pool.execute(Box::new(|| panic!("boom"))).unwrap();
        pool.execute(Box::new(move || tx.send(7).unwrap())).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn shutdown_rejects_jobs() {
        let pool = ThreadPool::new(2, "pool-shutdown").unwrap();
        pool.shutdown();

        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(Error::Rejected)
        ));
    }
}
