//! Single-flight task queues.
//!
//! A [SingleFlight] queue runs future-producing tasks strictly one at a time
//! and in the order they were enqueued, no matter which threads enqueue them.
//! A task is considered running from the moment it is started until the
//! future it returned reaches a terminal state; only then does the next task
//! start.
//!
//! # Example
//!
//! ```
//! use tether::futures::{queue::SingleFlight, Future};
//! use tether::task::ThreadPool;
//! use std::sync::Arc;
//!
//! let queue = SingleFlight::new(Arc::new(ThreadPool::new(4, "queue").unwrap()));
//! let first = queue.enqueue(|| Future::completed(1));
//! let second = queue.enqueue(|| Future::completed(2));
//!
//! assert_eq!(first.get().unwrap() + second.get().unwrap(), 3);
//! ```
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam::queue::SegQueue;
use log::{error, warn};

use super::{Future, Promise};
use crate::{error::Error, task::Executor};

/// Starts a task. Returns true if the task is already finished, false if it
/// will call [Inner::advance] once its future settles.
type Step = Box<dyn FnOnce(&Arc<Inner>) -> bool + Send>;

/// A FIFO of tasks of which at most one executes at a time.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SingleFlight {
    inner: Arc<Inner>,
}

struct Inner {
    steps: SegQueue<Step>,
    /// Number of enqueued tasks that have not finished, including the one
    /// running. Whoever moves it away from zero starts the drain; whoever
    /// brings it back to zero ends it.
    pending: AtomicUsize,
    executor: Arc<dyn Executor>,
}

impl SingleFlight {
    /// Create a queue whose tasks are started on `executor`.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                steps: SegQueue::new(),
                pending: AtomicUsize::new(0),
                executor,
            }),
        }
    }

    /// Append `task` to the queue.
    ///
    /// The returned future mirrors the future produced by `task`. Cancelling
    /// it before the task has started skips the task; cancelling it while the
    /// task is running does not let the next task start early.
    pub fn enqueue<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Future<T> + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.future();

        self.inner.steps.push(Box::new(move |inner: &Arc<Inner>| {
            if promise.is_done() {
                return true;
            }

            let fut = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(fut) => fut,
                Err(_) => {
                    error!("single-flight task panicked");
                    Future::failed(Error::failed("task panicked"))
                }
            };

            fut.forward(&promise);

            if fut.is_done() {
                return true;
            }

            let inner = inner.clone();
            fut.listen(move |_| inner.advance());
            false
        }));

        if self.inner.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            self.inner.clone().schedule();
        }

        out
    }

    /// Number of tasks enqueued but not yet finished.
    pub fn len(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn schedule(self: Arc<Self>) {
        let inner = self.clone();

        if let Err(e) = self.executor.execute(Box::new(move || inner.drain())) {
            warn!("single-flight executor unavailable ({e}), running task in place");
            self.drain();
        }
    }

    /// Run tasks until one suspends or the queue is empty. Tasks that finish
    /// synchronously are chained here rather than through their listener,
    /// so a long backlog does not grow the stack.
    fn drain(self: Arc<Self>) {
        loop {
            let Some(step) = self.steps.pop() else {
                error!("single-flight queue drained while tasks were pending");
                return;
            };

            if !step(&self) {
                return;
            }

            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }

    /// Called once a suspended task has finished.
    fn advance(self: Arc<Self>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) > 1 {
            self.schedule();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Barrier, Mutex,
        },
        thread,
        time::Duration,
    };

    use anyhow::Result;

    use super::SingleFlight;
    use crate::{
        error::Error,
        futures::{Future, Promise},
        task::{Inline, ThreadPool},
    };

    #[test]
    fn runs_in_enqueue_order() -> Result<()> {
        let queue = SingleFlight::new(Arc::new(ThreadPool::new(4, "order")?));
        let log = Arc::new(Mutex::new(Vec::new()));

        let futs: Vec<_> = (0..50)
            .map(|i| {
                let log = log.clone();
                queue.enqueue(move || {
                    log.lock().unwrap().push(i);
                    Future::completed(i)
                })
            })
            .collect();

        for f in &futs {
            f.get()?;
        }

        assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
        assert!(queue.is_empty());

        Ok(())
    }

    #[test]
    fn never_runs_two_tasks_at_once_and_keeps_producer_order() -> Result<()> {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let queue = SingleFlight::new(Arc::new(ThreadPool::new(4, "exclusive")?));
        let running = Arc::new(AtomicBool::new(false));
        // Updated with a plain load/store pair, so overlapping tasks would
        // lose increments.
        let counter = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(THREADS));

        let threads: Vec<_> = (0..THREADS)
            .map(|producer| {
                let queue = queue.clone();
                let running = running.clone();
                let counter = counter.clone();
                let started = started.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();
                    (0..PER_THREAD)
                        .map(|seq| {
                            let running = running.clone();
                            let counter = counter.clone();
                            let started = started.clone();
                            queue.enqueue(move || {
                                assert!(!running.swap(true, Ordering::SeqCst));
                                started.lock().unwrap().push((producer, seq));
                                let v = counter.load(Ordering::Relaxed);
                                thread::yield_now();
                                counter.store(v + 1, Ordering::Relaxed);

                                let promise = Promise::new();
                                let fut = promise.future();
                                let running = running.clone();
                                thread::spawn(move || {
                                    running.store(false, Ordering::SeqCst);
                                    promise.complete(v);
                                });
                                fut
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut results = Vec::new();
        for t in threads {
            for f in t.join().unwrap() {
                results.push(f.get()?);
            }
        }

        assert_eq!(counter.load(Ordering::SeqCst), THREADS * PER_THREAD);
        results.sort();
        assert_eq!(results, (0..THREADS * PER_THREAD).collect::<Vec<_>>());

        let started = started.lock().unwrap();
        for producer in 0..THREADS {
            let seqs: Vec<_> = started
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect();
            assert_eq!(seqs, (0..PER_THREAD).collect::<Vec<_>>());
        }

        Ok(())
    }

    #[test]
    fn next_task_waits_for_previous_future() {
        let queue = SingleFlight::new(Arc::new(Inline));
        let gate = Promise::<u8>::new();
        let started = Arc::new(AtomicBool::new(false));

        let g = gate.future();
        let first = queue.enqueue(move || g);

        let s = started.clone();
        let second = queue.enqueue(move || {
            s.store(true, Ordering::SeqCst);
            Future::completed(2u8)
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 2);

        gate.complete(1);

        assert_eq!(first.get().unwrap(), 1);
        assert_eq!(second.get().unwrap(), 2);
        assert!(started.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelled_task_is_skipped() {
        let queue = SingleFlight::new(Arc::new(Inline));
        let gate = Promise::<u8>::new();
        let ran = Arc::new(AtomicBool::new(false));

        let g = gate.future();
        let _first = queue.enqueue(move || g);

        let r = ran.clone();
        let skipped = queue.enqueue(move || {
            r.store(true, Ordering::SeqCst);
            Future::completed(0u8)
        });
        let third = queue.enqueue(|| Future::completed(3u8));

        assert!(skipped.cancel());
        gate.complete(1);

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(third.get().unwrap(), 3);
    }

    #[test]
    fn panicking_task_fails_its_future_only() {
        let queue = SingleFlight::new(Arc::new(Inline));

        let bad = queue.enqueue(|| -> Future<u8> { panic!("task failure") });
        let good = queue.enqueue(|| Future::completed(1u8));

        assert!(matches!(bad.get(), Err(Error::Failed(_))));
        assert_eq!(good.get().unwrap(), 1);
    }

    #[test]
    fn long_synchronous_backlog_runs_inline() {
        const TASKS: usize = 100_000;

        let queue = SingleFlight::new(Arc::new(Inline));
        let gate = Promise::<usize>::new();

        let g = gate.future();
        let first = queue.enqueue(move || g);
        let rest: Vec<_> = (1..=TASKS)
            .map(|i| queue.enqueue(move || Future::completed(i)))
            .collect();

        assert_eq!(queue.len(), TASKS + 1);
        gate.complete(0);

        assert_eq!(first.get().unwrap(), 0);
        assert!(rest.iter().all(|f| f.is_done()));
        assert_eq!(rest[TASKS - 1].get().unwrap(), TASKS);
        assert!(queue.is_empty());
    }
}
