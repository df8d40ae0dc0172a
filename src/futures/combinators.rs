//! Sequential and fan-in composition of futures.
//!
//! [iterate] and [for_each] run a sequence of future-producing steps one after
//! another and stop at the first failure. Steps that complete synchronously
//! are chained in a loop on the caller's stack; the first step that is still
//! pending when it is produced suspends the loop, which then resumes from that
//! step's continuation. Arbitrarily long chains therefore never grow the
//! native stack.
//!
//! # Example
//!
//! ```
//! use tether::futures::{combinators::iterate, Future};
//!
//! let counted = iterate(Future::completed(0u32), |n| {
//!     (*n < 10_000).then(|| Future::completed(n + 1))
//! });
//!
//! assert_eq!(counted.get().unwrap(), 10_000);
//! ```
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock,
};

use super::{Future, Outcome, Promise};

/// Repeatedly feed the last result into `next` to obtain the following step.
///
/// The chain ends with the last successful result when `next` returns `None`,
/// or with the first step that fails or is cancelled. Cancelling the returned
/// future stops the chain before the next step is produced.
pub fn iterate<T, F>(first: Future<T>, next: F) -> Future<T>
where
    T: Send + Sync + 'static,
    F: FnMut(&T) -> Option<Future<T>> + Send + 'static,
{
    Iteration {
        next,
        promise: None,
    }
    .drive(first)
}

/// Apply `f` to each item in turn, starting the step for an item only once the
/// previous one has completed. Stops at the first failure, which becomes the
/// result.
pub fn for_each<I, U, F>(items: I, mut f: F) -> Future<()>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    U: Send + Sync + 'static,
    F: FnMut(I::Item) -> Future<U> + Send + 'static,
{
    let mut items = items.into_iter();

    iterate(Future::completed(()), move |_| {
        items.next().map(|item| f(item).map(|_| ()))
    })
}

/// A future of all values of `futures`, in order.
///
/// Fails (or is cancelled) as soon as any input does; the remaining inputs are
/// left running.
pub fn all<T>(futures: Vec<Future<T>>) -> Future<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let promise = Promise::new();
    let out = promise.future();

    if futures.is_empty() {
        promise.complete(Vec::new());
        return out;
    }

    let slots: Arc<Vec<OnceLock<T>>> =
        Arc::new(futures.iter().map(|_| OnceLock::new()).collect());
    let remaining = Arc::new(AtomicUsize::new(futures.len()));

    for (idx, fut) in futures.into_iter().enumerate() {
        let promise = promise.clone();
        let slots = slots.clone();
        let remaining = remaining.clone();

        fut.on_complete(move |outcome| match outcome {
            Outcome::Value(v) => {
                let _ = slots[idx].set(v.clone());

                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    promise.complete(slots.iter().filter_map(|s| s.get().cloned()).collect());
                }
            }
            Outcome::Cancelled => {
                promise.cancel();
            }
            Outcome::Failed(e) => {
                promise.fail(e.clone());
            }
        });
    }

    out
}

struct Iteration<T, F> {
    next: F,
    /// Created the first time the chain has to suspend.
    promise: Option<Promise<T>>,
}

impl<T, F> Iteration<T, F>
where
    T: Send + Sync + 'static,
    F: FnMut(&T) -> Option<Future<T>> + Send + 'static,
{
    fn drive(mut self, mut current: Future<T>) -> Future<T> {
        loop {
            if self.promise.as_ref().is_some_and(|p| p.is_done()) {
                return current;
            }

            let Some(outcome) = current.outcome() else {
                let promise = self.promise.get_or_insert_with(Promise::new);
                let out = promise.future();
                let step = current.clone();

                current.listen(move |_| {
                    self.drive(step);
                });

                return out;
            };

            let step = match &*outcome {
                Outcome::Value(v) => (self.next)(v),
                _ => None,
            };

            match step {
                Some(step) => current = step,
                None => return self.finish(current),
            }
        }
    }

    fn finish(self, last: Future<T>) -> Future<T> {
        match self.promise {
            Some(promise) => {
                last.forward(&promise);
                promise.future()
            }
            None => last,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::Duration,
    };

    use super::{all, for_each, iterate};
    use crate::{
        error::Error,
        futures::{Future, Promise},
    };

    fn later<T: Send + Sync + 'static>(value: T) -> Future<T> {
        let promise = Promise::new();
        let fut = promise.future();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            promise.complete(value);
        });

        fut
    }

    #[test]
    fn iterate_long_synchronous_chain() {
        let fut = iterate(Future::completed(0u64), |n| {
            (*n < 100_000).then(|| Future::completed(n + 1))
        });

        assert_eq!(fut.get().unwrap(), 100_000);
    }

    #[test]
    fn iterate_resumes_after_async_steps() {
        let fut = iterate(Future::completed(0u32), |n| match n {
            n if *n >= 20 => None,
            n if n % 5 == 0 => Some(later(n + 1)),
            n => Some(Future::completed(n + 1)),
        });

        assert_eq!(fut.get().unwrap(), 20);
    }

    #[test]
    fn iterate_stops_on_failure() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();

        let fut = iterate(Future::completed(0u32), move |n| {
            s.fetch_add(1, Ordering::SeqCst);
            match n {
                3 => Some(Future::failed(Error::failed("step 4 failed"))),
                n => Some(Future::completed(n + 1)),
            }
        });

        assert!(matches!(fut.get(), Err(Error::Failed(_))));
        assert_eq!(steps.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn iterate_cancel_stops_chain() {
        let gate = Promise::<u32>::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let first = gate.future();

        let fut = iterate(first, move |n| {
            s.fetch_add(1, Ordering::SeqCst);
            Some(Future::completed(n + 1))
        });

        assert!(fut.cancel());
        gate.complete(0);

        assert_eq!(steps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn for_each_visits_in_order_and_stops_on_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();

        let fut = for_each(vec![1, 2, 3, 4], move |item| {
            s.lock().unwrap().push(item);
            if item == 3 {
                Future::<()>::failed(Error::Closed)
            } else {
                later(())
            }
        });

        assert!(matches!(fut.get(), Err(Error::Closed)));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn all_collects_in_input_order() {
        let fut = all(vec![later(1), Future::completed(2), later(3)]);
        assert_eq!(fut.get().unwrap(), vec![1, 2, 3]);

        assert!(all::<u8>(Vec::new()).get().unwrap().is_empty());
    }

    #[test]
    fn all_fails_fast() {
        let pending = Promise::<u8>::new();
        let fut = all(vec![pending.future(), Future::failed(Error::Closed)]);

        assert!(matches!(fut.get(), Err(Error::Closed)));
    }
}
