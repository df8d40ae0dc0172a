//! The read ([Future]) and write ([Promise]) halves of a result cell.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use log::warn;

use super::cell::{Cell, Listener, Outcome, Progress, PROGRESS_DONE};
use crate::{
    error::{Error, Result},
    reactor,
    task::Executor,
};

/// The read side of a single-assignment, multi-listener result.
///
/// Handles are cheap to clone; all clones observe the same cell.
pub struct Future<T> {
    cell: Arc<Cell<T>>,
}

/// The write side of a result cell.
///
/// Exactly one of [Promise::complete], [Promise::fail] or [Promise::cancel]
/// (or [Future::cancel]) ever succeeds for a given cell.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.cell.outcome().as_deref() {
            None => "pending",
            Some(Outcome::Value(_)) => "done",
            Some(Outcome::Cancelled) => "cancelled",
            Some(Outcome::Failed(_)) => "failed",
        };

        f.debug_struct("Future").field("state", &state).finish()
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Create a new pending promise.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Cell::new()),
        }
    }

    /// The future observing this promise.
    pub fn future(&self) -> Future<T> {
        Future {
            cell: self.cell.clone(),
        }
    }

    /// Complete with `value`. Returns false, dropping `value`, if the cell was
    /// already terminal.
    pub fn complete(&self, value: T) -> bool {
        self.cell.settle(Arc::new(Outcome::Value(value)))
    }

    /// Fail with `error`. Failing with [Error::Cancelled] is the same as
    /// [Promise::cancel].
    pub fn fail(&self, error: impl Into<Error>) -> bool {
        self.cell.settle(Arc::new(Outcome::failure(error.into())))
    }

    /// Cancel the pending computation.
    pub fn cancel(&self) -> bool {
        self.cell.settle(Arc::new(Outcome::Cancelled))
    }

    /// Settle with the outcome of a result.
    pub fn settle(&self, result: Result<T>) -> bool {
        match result {
            Ok(v) => self.complete(v),
            Err(e) => self.fail(e),
        }
    }

    /// Report an interim value. Only meaningful while pending; returns false
    /// if the cell is terminal or `progress` is the reserved
    /// [PROGRESS_DONE] marker.
    ///
    /// Listeners may observe fewer updates than were reported: an update that
    /// arrives while an earlier one is still being delivered replaces any
    /// update not yet picked up.
    pub fn set_progress(&self, partial: T, progress: u64, total: u64) -> bool {
        if progress == PROGRESS_DONE {
            warn!("set_progress called with the terminal progress marker");
            return false;
        }

        self.cell.set_progress(Arc::new(Progress {
            partial,
            progress,
            total,
        }))
    }

    pub fn is_done(&self) -> bool {
        self.cell.outcome().is_some()
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// A future that has already completed with `value`.
    pub fn completed(value: T) -> Self {
        Self::with_outcome(Outcome::Value(value))
    }

    /// A future that has already failed with `error`.
    pub fn failed(error: impl Into<Error>) -> Self {
        Self::with_outcome(Outcome::failure(error.into()))
    }

    /// A future that has already been cancelled.
    pub fn cancelled() -> Self {
        Self::with_outcome(Outcome::Cancelled)
    }

    fn with_outcome(outcome: Outcome<T>) -> Self {
        Self {
            cell: Arc::new(Cell::with_outcome(outcome)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.cell.outcome().is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.cell.outcome().is_some_and(|o| o.is_failed())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.outcome().is_some_and(|o| o.is_cancelled())
    }

    /// The failure of a terminal future, [Error::Cancelled] if it was
    /// cancelled, or `None` if it is pending or completed normally.
    pub fn failure(&self) -> Option<Error> {
        self.cell.outcome().and_then(|o| o.error())
    }

    /// The terminal outcome, if there is one yet.
    pub fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        self.cell.outcome()
    }

    /// Cancel the future. Returns true iff this call performed the terminal
    /// transition.
    ///
    /// Cancellation is cooperative: the computation feeding the future is
    /// only stopped if it observes the cancellation.
    pub fn cancel(&self) -> bool {
        self.cell.settle(Arc::new(Outcome::Cancelled))
    }

    /// Register a continuation for the terminal outcome.
    ///
    /// Continuations registered while pending run in registration order on the
    /// thread that settles the future. If the future is already terminal, `f`
    /// runs on the calling thread before this returns.
    pub fn on_complete(&self, f: impl FnOnce(&Outcome<T>) + Send + 'static) {
        self.cell.add(Listener::done(move |o| f(&**o)));
    }

    /// Register a callback for interim progress updates.
    pub fn on_progress(&self, f: impl Fn(&Progress<T>) + Send + Sync + 'static) {
        self.cell
            .add(Listener::Progress(Box::new(move |p: &Arc<Progress<T>>| {
                f(&**p)
            })));
    }

    pub(crate) fn listen(&self, f: impl FnOnce(&Arc<Outcome<T>>) + Send + 'static) {
        self.cell.add(Listener::done(f));
    }

    /// Mirror this future's progress and outcome into `promise`.
    pub fn forward(&self, promise: &Promise<T>) {
        self.cell.add(Listener::Forward(promise.cell.clone()));
    }

    /// A future of `f` applied to this future's value.
    ///
    /// Failure and cancellation pass straight through without invoking `f`.
    /// Progress updates are not mapped.
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.future();

        self.listen(move |outcome| match &**outcome {
            Outcome::Value(v) => {
                promise.complete(f(v));
            }
            other => {
                if let Some(o) = other.reinterpret() {
                    promise.cell.settle(Arc::new(o));
                }
            }
        });

        out
    }

    /// Chain a future-producing step onto this future.
    ///
    /// The returned future mirrors the outcome and progress of the future `f`
    /// returns. Cancelling the returned future does not cancel the inner
    /// future; the inner computation simply loses its consumer.
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Future<U> + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.future();

        self.listen(move |outcome| match &**outcome {
            Outcome::Value(v) => {
                if !promise.is_done() {
                    f(v).forward(&promise);
                }
            }
            other => {
                if let Some(o) = other.reinterpret() {
                    promise.cell.settle(Arc::new(o));
                }
            }
        });

        out
    }

    /// A future whose continuations run on `executor`.
    ///
    /// If this future is already terminal and `force` is false, it is
    /// returned unchanged and continuations keep running on the registering
    /// thread.
    pub fn with_executor(&self, executor: Arc<dyn Executor>, force: bool) -> Future<T> {
        if !force && self.is_done() {
            return self.clone();
        }

        let promise = Promise::new();
        let out = promise.future();

        {
            let relay = Arc::new(Relay {
                latest: Mutex::new(None),
                scheduled: AtomicBool::new(false),
                executor: executor.clone(),
                cell: promise.cell.clone(),
            });

            self.cell
                .add(Listener::Progress(Box::new(move |p: &Arc<Progress<T>>| {
                    relay.push(p.clone());
                })));
        }

        self.listen(move |outcome| {
            let cell = promise.cell.clone();
            let handed_off = outcome.clone();

            let job = Box::new(move || {
                cell.settle(handed_off);
            });

            if let Err(e) = executor.execute(job) {
                warn!("executor hand-off failed ({e}), settling in place");
                promise.cell.settle(outcome.clone());
            }
        });

        out
    }

    /// Block until the future is terminal.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        self.wait(None)
    }

    /// Block until the future is terminal or `timeout` elapses, in which case
    /// [Error::Timeout] is returned and the future is left untouched.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T>
    where
        T: Clone,
    {
        self.wait(Some(Instant::now() + timeout))
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<T>
    where
        T: Clone,
    {
        if let Some(outcome) = self.cell.outcome() {
            return outcome.result();
        }

        if reactor::is_reactor_thread() {
            return Err(Error::ReactorThread);
        }

        self.cell
            .wait(deadline)
            .map_or(Err(Error::Timeout), |outcome| outcome.result())
    }
}

/// Carries progress updates across an executor hand-off.
///
/// Updates are coalesced into a single slot and at most one drain job is
/// queued at a time, so the downstream cell sees them in the order they were
/// reported and always ends on the newest one.
struct Relay<T> {
    latest: Mutex<Option<Arc<Progress<T>>>>,
    scheduled: AtomicBool,
    executor: Arc<dyn Executor>,
    cell: Arc<Cell<T>>,
}

impl<T: Send + Sync + 'static> Relay<T> {
    fn push(self: &Arc<Self>, update: Arc<Progress<T>>) {
        *self.slot() = Some(update);

        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let relay = self.clone();
        if let Err(e) = self.executor.execute(Box::new(move || relay.drain())) {
            warn!("could not hand progress to executor ({e}), delivering in place");
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            let update = self.slot().take();
            if let Some(update) = update {
                self.cell.set_progress(update);
            }

            self.scheduled.store(false, Ordering::Release);

            // An update pushed after the take above saw the flag still set
            // and left it to us.
            if self.slot().is_none() || self.scheduled.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Progress<T>>>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier, Mutex,
        },
        thread,
        time::{Duration, Instant},
    };

    use anyhow::Result;

    use super::{Future, Promise};
    use crate::{
        error::Error,
        futures::PROGRESS_DONE,
        task::{Executor, ThreadPool},
    };

    #[test]
    fn exactly_one_transition_succeeds() {
        for _ in 0..50 {
            let promise = Promise::<usize>::new();
            let wins = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(3));

            let threads: Vec<_> = (0..3)
                .map(|i| {
                    let promise = promise.clone();
                    let wins = wins.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let won = match i {
                            0 => promise.complete(1),
                            1 => promise.fail(Error::failed("nope")),
                            _ => promise.cancel(),
                        };
                        if won {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);

            let seen = promise.future().outcome().unwrap();
            assert!(!promise.complete(2));
            assert!(!promise.cancel());
            assert!(Arc::ptr_eq(&seen, &promise.future().outcome().unwrap()));
        }
    }

    #[test]
    fn listeners_race_with_completion() {
        for _ in 0..20 {
            let promise = Promise::<u32>::new();
            let fut = promise.future();
            let fired = Arc::new(AtomicUsize::new(0));

            let adder = {
                let fut = fut.clone();
                let fired = fired.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let fired = fired.clone();
                        fut.on_complete(move |o| {
                            assert_eq!(o.value(), Some(&5));
                            fired.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            };

            promise.complete(5);
            adder.join().unwrap();

            assert_eq!(fired.load(Ordering::SeqCst), 200);
        }
    }

    #[test]
    fn get_blocks_until_completed() -> Result<()> {
        let promise = Promise::new();
        let fut = promise.future();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            promise.complete("hello".to_string());
        });

        assert_eq!(fut.get()?, "hello");
        t.join().unwrap();

        Ok(())
    }

    #[test]
    fn get_timeout_leaves_future_pending() {
        let promise = Promise::<u8>::new();
        let fut = promise.future();
        let before = Instant::now();

        assert!(matches!(
            fut.get_timeout(Duration::from_millis(100)),
            Err(Error::Timeout)
        ));
        assert!(before.elapsed() >= Duration::from_millis(100));
        assert!(!fut.is_done());

        promise.complete(3);
        assert_eq!(fut.get_timeout(Duration::from_millis(10)).unwrap(), 3);
    }

    #[test]
    fn get_distinguishes_cancel_and_failure() {
        let cancelled = Future::<u8>::cancelled();
        let failed = Future::<u8>::failed(Error::failed("bad"));

        assert!(matches!(cancelled.get(), Err(Error::Cancelled)));
        assert!(matches!(failed.get(), Err(Error::Failed(_))));
        assert!(cancelled.is_cancelled());
        assert!(failed.is_failed());
        assert!(matches!(failed.failure(), Some(Error::Failed(_))));
    }

    #[test]
    fn map_skips_function_on_failure() {
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();

        let fut = Future::<u32>::failed(Error::Closed).map(move |v| {
            c.fetch_add(1, Ordering::SeqCst);
            *v + 1
        });

        assert!(matches!(fut.get(), Err(Error::Closed)));
        assert_eq!(called.load(Ordering::SeqCst), 0);

        assert_eq!(Future::completed(1).map(|v| v + 1).get().unwrap(), 2);
    }

    #[test]
    fn then_chains_and_leaves_inner_running() {
        let inner = Promise::<u32>::new();
        let inner_fut = inner.future();

        let outer = Future::completed(2).then(move |_| inner_fut.clone());
        assert!(!outer.is_done());

        assert!(outer.cancel());
        assert!(!inner.is_done());

        inner.complete(4);
        assert!(outer.is_cancelled());

        let chained = Future::completed(2).then(|v| Future::completed(v * 10));
        assert_eq!(chained.get().unwrap(), 20);
    }

    #[test]
    fn cancellation_propagates_down_the_chain() {
        let promise = Promise::<u32>::new();
        let mapped = promise.future().map(|v| v + 1).then(|v| Future::completed(*v));

        promise.cancel();
        assert!(mapped.is_cancelled());
    }

    #[test]
    fn progress_is_coalesced_and_terminal_is_kept() {
        let promise = Promise::<u64>::new();
        let fut = promise.future();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            fut.on_progress(move |p| {
                thread::sleep(Duration::from_millis(1));
                seen.lock().unwrap().push(p.progress);
            });
        }

        let reporters: Vec<_> = (0..4)
            .map(|t| {
                let promise = promise.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        promise.set_progress(0, t * 25 + i, 100);
                    }
                })
            })
            .collect();

        for r in reporters {
            r.join().unwrap();
        }

        promise.complete(100);

        let seen = seen.lock().unwrap();
        assert!(seen.len() <= 100);
        assert!(!seen.is_empty());
        assert_eq!(fut.get().unwrap(), 100);
    }

    #[test]
    fn progress_latest_wins_single_thread() {
        let promise = Promise::<u64>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            promise
                .future()
                .on_progress(move |p| seen.lock().unwrap().push(p.partial));
        }

        for i in 1..=3 {
            assert!(promise.set_progress(i, i, 3));
        }

        assert_eq!(*seen.lock().unwrap().last().unwrap(), 3);
        assert!(!promise.set_progress(4, PROGRESS_DONE, 3));

        promise.complete(0);
        assert!(!promise.set_progress(5, 1, 3));
    }

    #[test]
    fn with_executor_runs_continuations_on_pool() -> Result<()> {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(1, "hand-off")?);
        let promise = Promise::<u32>::new();
        let fut = promise.future().with_executor(pool, false);
        let (tx, rx) = std::sync::mpsc::channel();

        fut.on_complete(move |_| {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        });

        promise.complete(1);

        let name = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(name.as_deref(), Some("hand-off-0"));

        Ok(())
    }

    #[test]
    fn with_executor_short_circuits_when_done() -> Result<()> {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(1, "short")?);
        let done = Future::completed(1u8);

        let same = done.with_executor(pool.clone(), false);
        assert!(same.is_done());

        let forced = done.with_executor(pool, true);
        assert_eq!(forced.get()?, 1);

        Ok(())
    }

    #[test]
    fn with_executor_ends_on_latest_progress() -> Result<()> {
        const UPDATES: u64 = 2000;

        let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(4, "relay")?);

        for _ in 0..20 {
            let promise = Promise::<u64>::new();
            let seen = Arc::new(Mutex::new(Vec::new()));

            {
                let seen = seen.clone();
                promise
                    .future()
                    .with_executor(pool.clone(), true)
                    .on_progress(move |p| seen.lock().unwrap().push(p.progress));
            }

            for i in 1..=UPDATES {
                assert!(promise.set_progress(i, i, UPDATES));
            }

            let deadline = Instant::now() + Duration::from_secs(5);
            while seen.lock().unwrap().last() != Some(&UPDATES) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }

            let seen = seen.lock().unwrap();
            assert_eq!(seen.last(), Some(&UPDATES));
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }

        Ok(())
    }

    #[test]
    fn timed_out_gets_share_one_listener() {
        let promise = Promise::<u8>::new();
        let fut = promise.future();

        for _ in 0..10_000 {
            assert!(matches!(
                fut.get_timeout(Duration::from_nanos(1)),
                Err(Error::Timeout)
            ));
        }

        assert_eq!(fut.cell.listener_count(), 1);

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let fut = fut.clone();
                thread::spawn(move || fut.get())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(fut.cell.listener_count(), 1);
        promise.complete(7);

        for w in waiters {
            assert_eq!(w.join().unwrap().unwrap(), 7);
        }
    }
}
