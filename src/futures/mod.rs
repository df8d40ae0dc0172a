//! Futures, promises and their combinators.
//!
//! The `futures` module is the foundation the rest of `tether` is built on. A
//! [Promise] and its [Future] are the write and read halves of a single
//! result cell which starts out pending and makes exactly one transition into
//! a terminal state: a value, cancellation or a failure. Either half can be
//! used from any thread; completing a promise never blocks and never takes a
//! lock.
//!
//! Consumers register continuations with [Future::on_complete]. Continuations
//! registered before the future is settled run in registration order on the
//! settling thread (use [Future::with_executor] to move them elsewhere), those
//! registered afterwards run immediately on the registering thread. A pending
//! future may also report interim [Progress], which listeners added with
//! [Future::on_progress] receive on a latest-wins basis.
//!
//! The following sub-modules are exposed by the `futures` module:
//!
//! - `combinators`: Sequential composition ([combinators::iterate],
//!   [combinators::for_each]) and fan-in ([combinators::all]).
//! - `queue`: A [queue::SingleFlight] queue that runs future-producing tasks
//!   strictly one after another.
//!
//! # Example
//!
//! ```
//! use tether::futures::Promise;
//! use std::thread;
//!
//! let promise = Promise::new();
//! let len = promise.future().map(|s: &String| s.len());
//!
//! thread::spawn(move || promise.complete("Hello, world!".to_string()));
//!
//! assert_eq!(len.get().unwrap(), 13);
//! ```
mod cell;
pub mod combinators;
mod promise;
pub mod queue;

pub use cell::{Outcome, Progress, PROGRESS_DONE};
pub use promise::{Future, Promise};
