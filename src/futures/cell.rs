use std::{
    cell::UnsafeCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc, Condvar, Mutex, OnceLock, PoisonError},
    time::Instant,
};

use crossbeam::epoch::{self, Atomic, Owned};
use log::error;

use crate::error::{Error, Result};

/// Progress value reserved for terminal transitions. It is never accepted by
/// [crate::futures::Promise::set_progress].
pub const PROGRESS_DONE: u64 = u64::MAX;

/// The terminal outcome of a future.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The future completed normally.
    Value(T),
    /// The future was voluntarily abandoned.
    Cancelled,
    /// The future failed.
    Failed(Error),
}

impl<T> Outcome<T> {
    /// The value, if the future completed normally.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The failure, if any. Cancellation is reported as [Error::Cancelled].
    pub fn error(&self) -> Option<Error> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Cancelled => Some(Error::Cancelled),
            Outcome::Failed(e) => Some(e.clone()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Borrow the outcome as a result, mapping cancellation to
    /// [Error::Cancelled].
    pub fn as_result(&self) -> Result<&T> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Cancelled => Err(Error::Cancelled),
            Outcome::Failed(e) => Err(e.clone()),
        }
    }

    pub(crate) fn failure(error: Error) -> Self {
        match error {
            Error::Cancelled => Outcome::Cancelled,
            e => Outcome::Failed(e),
        }
    }

    /// Carry a non-value outcome over to a future of a different type.
    pub(crate) fn reinterpret<U>(&self) -> Option<Outcome<U>> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Cancelled => Some(Outcome::Cancelled),
            Outcome::Failed(e) => Some(Outcome::Failed(e.clone())),
        }
    }
}

impl<T: Clone> Outcome<T> {
    /// Clone the outcome out as a result.
    pub fn result(&self) -> Result<T> {
        self.as_result().cloned()
    }
}

/// An interim, non-terminal update of a pending future.
#[derive(Debug)]
pub struct Progress<T> {
    pub partial: T,
    pub progress: u64,
    pub total: u64,
}

pub(crate) type DoneFn<T> = Box<dyn FnOnce(&Arc<Outcome<T>>) + Send>;
pub(crate) type ProgressFn<T> = Box<dyn Fn(&Arc<Progress<T>>) + Send + Sync>;

/// A continuation registered on a [Cell].
pub(crate) enum Listener<T> {
    /// Called once with the terminal outcome.
    Done(Once<DoneFn<T>>),
    /// Called with each delivered progress update; ignores the terminal
    /// outcome.
    Progress(ProgressFn<T>),
    /// Mirror progress and outcome into another cell.
    Forward(Arc<Cell<T>>),
}

impl<T> Listener<T> {
    pub(crate) fn done(f: impl FnOnce(&Arc<Outcome<T>>) + Send + 'static) -> Self {
        Listener::Done(Once::new(Box::new(f)))
    }

    fn fire_done(&self, outcome: &Arc<Outcome<T>>) {
        match self {
            // SAFETY: see [Once].
            Listener::Done(f) => {
                if let Some(f) = unsafe { f.take() } {
                    f(outcome)
                }
            }
            Listener::Progress(_) => {}
            Listener::Forward(cell) => {
                cell.settle(outcome.clone());
            }
        }
    }

    fn fire_progress(&self, update: &Arc<Progress<T>>) {
        match self {
            Listener::Done(_) => {}
            Listener::Progress(f) => f(update),
            Listener::Forward(cell) => {
                cell.set_progress(update.clone());
            }
        }
    }
}

/// A value that is taken at most once.
///
/// A listener's terminal continuation is only ever taken by the thread that
/// won the transition into [State::Done] (or, for a listener added after
/// that, by the thread adding it before it is published), so no two threads
/// race on the slot.
pub(crate) struct Once<F>(UnsafeCell<Option<F>>);

unsafe impl<F: Send> Sync for Once<F> {}

impl<F> Once<F> {
    fn new(f: F) -> Self {
        Self(UnsafeCell::new(Some(f)))
    }

    /// # Safety
    ///
    /// The caller must be the unique deliverer of the terminal outcome for the
    /// listener owning this slot.
    unsafe fn take(&self) -> Option<F> {
        (*self.0.get()).take()
    }
}

/// A link in the prepend-only listener chain.
struct Node<T> {
    listener: Listener<T>,
    next: Option<Arc<Node<T>>>,
}

impl<T> Node<T> {
    /// Collect the chain starting at `head` in registration order.
    fn in_order(head: Option<Arc<Node<T>>>) -> Vec<Arc<Node<T>>> {
        let mut nodes = Vec::new();
        let mut cur = head;

        while let Some(node) = cur {
            cur = node.next.clone();
            nodes.push(node);
        }

        nodes.reverse();
        nodes
    }
}

enum Delivery<T> {
    /// No progress is being delivered.
    Idle,
    /// A thread is delivering progress; the slot holds the newest update it
    /// has not picked up yet.
    Running(Option<Arc<Progress<T>>>),
}

impl<T> Clone for Delivery<T> {
    fn clone(&self) -> Self {
        match self {
            Delivery::Idle => Delivery::Idle,
            Delivery::Running(p) => Delivery::Running(p.clone()),
        }
    }
}

enum State<T> {
    Pending {
        listeners: Option<Arc<Node<T>>>,
        delivery: Delivery<T>,
    },
    Done(Arc<Outcome<T>>),
}

/// The shared result cell behind a future and its promise.
///
/// Every state is an immutable heap snapshot. All mutations load the current
/// snapshot, build the next one and publish it with a single compare and swap,
/// retrying from the top when another thread got there first. Replaced
/// snapshots are reclaimed through the epoch collector once no thread can
/// still be reading them.
pub(crate) struct Cell<T> {
    state: Atomic<State<T>>,
    sleepers: OnceLock<Arc<Sleepers>>,
}

/// Threads blocked until a cell settles. They share a single listener, which
/// is registered the first time anyone blocks.
#[derive(Default)]
struct Sleepers {
    lock: Mutex<()>,
    settled: Condvar,
}

impl Sleepers {
    fn wake(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.settled.notify_all();
    }
}

impl<T> Cell<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Atomic::new(State::Pending {
                listeners: None,
                delivery: Delivery::Idle,
            }),
            sleepers: OnceLock::new(),
        }
    }

    pub(crate) fn with_outcome(outcome: Outcome<T>) -> Self {
        Self {
            state: Atomic::new(State::Done(Arc::new(outcome))),
            sleepers: OnceLock::new(),
        }
    }

    /// The terminal outcome, if there is one yet.
    pub(crate) fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        let guard = epoch::pin();
        let cur = self.state.load(Ordering::Acquire, &guard);

        // SAFETY: the state pointer is never null and the snapshot is kept
        // alive by `guard`.
        match unsafe { cur.deref() } {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Transition to `outcome`. Returns false if the cell was already
    /// terminal, in which case nothing changes.
    pub(crate) fn settle(&self, outcome: Arc<Outcome<T>>) -> bool {
        let mut next = Owned::new(State::Done(outcome.clone()));

        let listeners = loop {
            let guard = epoch::pin();
            let cur = self.state.load(Ordering::Acquire, &guard);

            let listeners = match unsafe { cur.deref() } {
                State::Done(_) => return false,
                State::Pending { listeners, .. } => listeners.clone(),
            };

            match self
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire, &guard)
            {
                Ok(_) => {
                    unsafe { guard.defer_destroy(cur) };
                    break listeners;
                }
                Err(e) => next = e.new,
            }
        };

        for node in Node::in_order(listeners) {
            guarded(|| node.listener.fire_done(&outcome));
        }

        true
    }

    /// Publish a progress update. Returns false if the cell is already
    /// terminal.
    ///
    /// Updates are coalesced: if a delivery is already running, `update`
    /// replaces whatever that delivery has not picked up yet and the running
    /// thread delivers it. Otherwise the calling thread becomes the deliverer.
    pub(crate) fn set_progress(&self, update: Arc<Progress<T>>) -> bool {
        loop {
            let guard = epoch::pin();
            let cur = self.state.load(Ordering::Acquire, &guard);

            let (listeners, deliverer) = match unsafe { cur.deref() } {
                State::Done(_) => return false,
                State::Pending {
                    listeners,
                    delivery,
                } => (listeners.clone(), matches!(delivery, Delivery::Idle)),
            };

            let next = Owned::new(State::Pending {
                listeners,
                delivery: Delivery::Running(Some(update.clone())),
            });

            if self
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                unsafe { guard.defer_destroy(cur) };
                drop(guard);

                if deliverer {
                    self.deliver_progress();
                }

                return true;
            }
        }
    }

    fn deliver_progress(&self) {
        loop {
            let guard = epoch::pin();
            let cur = self.state.load(Ordering::Acquire, &guard);

            let (listeners, update) = match unsafe { cur.deref() } {
                State::Done(_) => return,
                State::Pending {
                    delivery: Delivery::Idle,
                    ..
                } => return,
                State::Pending {
                    listeners,
                    delivery: Delivery::Running(update),
                } => (listeners.clone(), update.clone()),
            };

            let delivery = match update {
                Some(_) => Delivery::Running(None),
                None => Delivery::Idle,
            };

            let next = Owned::new(State::Pending {
                listeners: listeners.clone(),
                delivery,
            });

            if self
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_err()
            {
                continue;
            }

            unsafe { guard.defer_destroy(cur) };
            drop(guard);

            let Some(update) = update else {
                return;
            };

            for node in Node::in_order(listeners) {
                guarded(|| node.listener.fire_progress(&update));
            }
        }
    }

    /// Register `listener`. If the cell is already terminal the listener is
    /// fired on the calling thread before this returns.
    pub(crate) fn add(&self, listener: Listener<T>) {
        let mut node = Arc::new(Node {
            listener,
            next: None,
        });

        loop {
            let guard = epoch::pin();
            let cur = self.state.load(Ordering::Acquire, &guard);

            let (listeners, delivery) = match unsafe { cur.deref() } {
                State::Done(outcome) => {
                    let outcome = outcome.clone();
                    drop(guard);
                    guarded(|| node.listener.fire_done(&outcome));
                    return;
                }
                State::Pending {
                    listeners,
                    delivery,
                } => (listeners.clone(), delivery.clone()),
            };

            // Unique: the only other reference lived in the snapshot of a
            // failed exchange, which has already been dropped.
            if let Some(node) = Arc::get_mut(&mut node) {
                node.next = listeners;
            }

            let next = Owned::new(State::Pending {
                listeners: Some(node.clone()),
                delivery,
            });

            if self
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                unsafe { guard.defer_destroy(cur) };
                return;
            }
        }
    }
}

impl<T> Cell<T> {
    /// Block the calling thread until the cell is terminal or `deadline`
    /// passes, returning `None` in the latter case.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Option<Arc<Outcome<T>>> {
        let mut fresh = false;
        let sleepers = self
            .sleepers
            .get_or_init(|| {
                fresh = true;
                Arc::default()
            })
            .clone();

        if fresh {
            let s = sleepers.clone();
            self.add(Listener::done(move |_| s.wake()));
        }

        let mut guard = sleepers.lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(outcome) = self.outcome() {
                return Some(outcome);
            }

            guard = match deadline {
                None => sleepers
                    .settled
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }

                    sleepers
                        .settled
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        let guard = epoch::pin();
        let cur = self.state.load(Ordering::Acquire, &guard);

        // SAFETY: as in `outcome`.
        match unsafe { cur.deref() } {
            State::Done(_) => 0,
            State::Pending { listeners, .. } => {
                let mut count = 0;
                let mut cur = listeners.as_ref();
                while let Some(node) = cur {
                    count += 1;
                    cur = node.next.as_ref();
                }
                count
            }
        }
    }
}

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can observe the state.
        unsafe {
            let cur = self.state.load(Ordering::Relaxed, epoch::unprotected());
            if !cur.is_null() {
                drop(cur.into_owned());
            }
        }
    }
}

/// Run a user continuation, containing any panic so the remaining listeners
/// still observe the outcome.
fn guarded(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("future continuation panicked");
    }
}
