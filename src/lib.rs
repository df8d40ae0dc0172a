//! # `tether`: futures and a socket reactor that meet at a promise
//!
//! `tether` provides two closely tied pieces:
//!
//! 1. A thread-safe [futures::Future]/[futures::Promise] pair. A promise can be
//!    completed, failed or cancelled from any thread without blocking or
//!    taking a lock; consumers chain continuations onto the future, observe
//!    progress updates, or block on it from a regular thread.
//! 2. A single threaded [reactor::Reactor] built on Linux's `epoll`. It
//!    multiplexes every listening socket, connection and timer onto one
//!    thread and reports back exclusively through futures, with application
//!    code and the socket syscalls themselves running on a worker
//!    [task::Executor].
//!
//! On top of futures, the [futures::combinators] module chains long sequences
//! of steps without growing the stack, and [futures::queue::SingleFlight]
//! serialises future-producing tasks.
//!
//! ## Example
//!
//! A server that echoes one message back, and a client talking to it:
//!
//! ```
//! use tether::reactor::{BindOptions, ConnectOptions, Reactor};
//!
//! let reactor = Reactor::new().unwrap();
//!
//! let server = reactor
//!     .bind(BindOptions::new("127.0.0.1:0".parse().unwrap(), |channel| {
//!         let echo = channel.clone();
//!         channel
//!             .read(vec![0; 1024])
//!             .then(move |msg| echo.write(msg.clone()));
//!         Ok(())
//!     }))
//!     .get()
//!     .unwrap();
//!
//! let client = reactor
//!     .connect(ConnectOptions::new(server.local_addr()))
//!     .get()
//!     .unwrap();
//!
//! client.write(b"Hello, world!".to_vec()).get().unwrap();
//! assert_eq!(client.read(vec![0; 1024]).get().unwrap(), b"Hello, world!");
//! ```
pub mod error;
pub mod futures;
pub mod net;
pub mod reactor;
pub mod task;

pub use error::{Error, Result};
