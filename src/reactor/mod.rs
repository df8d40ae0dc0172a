//! The I/O reactor.
//!
//! A [Reactor] owns one background thread which waits on an `epoll` instance
//! for every socket and timer it has been handed. The thread never runs
//! application code: once a socket is ready, the matching read, write, accept
//! or connect completion is handed to the reactor's worker [Executor] and the
//! thread goes straight back to waiting.
//!
//! Other threads never touch the `epoll` instance. Registrations, interest
//! changes and teardowns are pushed onto a lock-free queue of operations and
//! the reactor is woken through an `eventfd` to apply them. A descriptor is
//! only in the `epoll` set while somebody is waiting on it, and each time it
//! fires the interest that was satisfied is dropped again. A channel with a
//! full send buffer therefore simply stops asking for more writes until the
//! kernel reports it writable, which is all backpressure amounts to here.
//!
//! # Example
//!
//! ```
//! use tether::reactor::{BindOptions, ConnectOptions, Reactor};
//!
//! let reactor = Reactor::new().unwrap();
//!
//! let server = reactor
//!     .bind(BindOptions::new("127.0.0.1:0".parse().unwrap(), |channel| {
//!         let reply = channel.clone();
//!         channel.write(b"PONG".to_vec()).on_complete(move |_| reply.close());
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
//! assert_eq!(client.read(vec![0; 16]).get().unwrap(), b"PONG");
//! ```
use std::{
    cell::Cell,
    io,
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::queue::SegQueue;
use log::{debug, error, warn};

use crate::{
    error::{Error, Result},
    futures::{Future, Promise},
    net::{socket, Channel, ChannelInner, Server, ServerInner},
    task::{Executor, ThreadPool},
};

mod options;
mod poll;
mod selector;

pub use options::{BindOptions, ConnectOptions, ConnectionHandler, SocketOption};
pub(crate) use poll::Interest;

use poll::Waker;
use selector::Selector;

/// Default upper bound on the number of events taken from a single wait.
const MAX_EVENTS: usize = 512;

thread_local! {
    static ON_REACTOR: Cell<bool> = const { Cell::new(false) };
}

/// Returns true on a reactor's own thread, where blocking is not allowed.
pub(crate) fn is_reactor_thread() -> bool {
    ON_REACTOR.with(|on| on.get())
}

fn enter() {
    ON_REACTOR.with(|on| on.set(true));
}

/// Configures and starts a [Reactor].
pub struct ReactorBuilder {
    worker_threads: usize,
    name: String,
    max_events: usize,
    executor: Option<Arc<dyn Executor>>,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self {
            worker_threads: thread::available_parallelism().map_or(1, |n| n.get()),
            name: "tether-reactor".to_string(),
            max_events: MAX_EVENTS,
            executor: None,
        }
    }
}

impl ReactorBuilder {
    /// Size of the worker pool created for the reactor. Ignored if an
    /// executor is supplied.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Name of the reactor thread. Workers are named after it.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    /// Run completions, handlers and socket I/O on `executor` instead of a
    /// dedicated pool.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> io::Result<Reactor> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ThreadPool::new(
                self.worker_threads,
                &format!("{}-worker", self.name),
            )?),
        };

        let shared = Arc::new(Shared {
            ops: SegQueue::new(),
            waker: Waker::new()?,
            running: AtomicBool::new(true),
            executor,
        });

        let selector = Selector::new(self.max_events, shared.clone())?;
        let thread = thread::Builder::new()
            .name(self.name)
            .spawn(move || selector.run())?;

        Ok(Reactor {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// A handle to a running reactor.
///
/// Dropping the handle (or calling [Reactor::close]) stops the reactor thread.
/// Listeners stop accepting, pending connects fail with [Error::Closed],
/// pending delays are cancelled and every channel is closed.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Start a reactor with the default configuration.
    pub fn new() -> io::Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::default()
    }

    /// The executor that runs completions for this reactor.
    pub fn executor(&self) -> Arc<dyn Executor> {
        self.shared.executor.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Listen for connections. Every accepted connection is passed to the
    /// handler in `options` on a worker thread.
    pub fn bind(&self, options: BindOptions) -> Future<Server> {
        let BindOptions {
            addr,
            handler,
            backlog,
            options,
        } = options;

        let listening = || -> io::Result<_> {
            let fd = socket::stream_socket(&addr)?;

            for option in &options {
                option.apply(fd.as_fd())?;
            }

            socket::bind(fd.as_fd(), addr)?;
            socket::listen(fd.as_fd(), backlog)?;
            let local_addr = socket::local_addr(fd.as_fd())?;

            Ok((fd, local_addr))
        };

        let (fd, local_addr) = match listening() {
            Ok(x) => x,
            Err(e) => {
                warn!("could not listen on {addr}: {e}");
                return Future::failed(e);
            }
        };

        let promise = Promise::new();
        let fut = promise.future();

        self.shared.submit(Op::Listen {
            fd,
            handler,
            local_addr,
            promise,
        });

        fut
    }

    /// Open a connection.
    pub fn connect(&self, options: ConnectOptions) -> Future<Channel> {
        let connecting = || -> io::Result<_> {
            let fd = socket::stream_socket(&options.addr)?;

            for option in &options.options {
                option.apply(fd.as_fd())?;
            }

            if let Some(local) = options.local {
                socket::bind(fd.as_fd(), local)?;
            }

            socket::connect(fd.as_fd(), options.addr)?;

            Ok(fd)
        };

        let fd = match connecting() {
            Ok(fd) => fd,
            Err(e) => {
                debug!("connect to {} failed: {e}", options.addr);
                return Future::failed(e);
            }
        };

        let promise = Promise::new();
        let fut = promise.future();

        self.shared.submit(Op::Connect { fd, promise });

        fut
    }

    /// A future that completes once `duration` has elapsed.
    pub fn delay(&self, duration: Duration) -> Future<()> {
        let fd = match timer_fd(duration) {
            Ok(fd) => fd,
            Err(e) => return Future::failed(e),
        };

        let promise = Promise::new();
        let fut = promise.future();

        self.shared.submit(Op::Timer { fd, promise });

        fut
    }

    /// Cancel `future` if it is still pending after `duration`. Returns
    /// `future` itself.
    pub fn cancel_after<T>(&self, future: &Future<T>, duration: Duration) -> Future<T>
    where
        T: Send + Sync + 'static,
    {
        let timer = self.delay(duration);

        let target = future.clone();
        timer.on_complete(move |outcome| {
            if outcome.value().is_some() && target.cancel() {
                debug!("future cancelled after {duration:?}");
            }
        });

        future.on_complete(move |_| {
            timer.cancel();
        });

        future.clone()
    }

    /// Stop the reactor thread and wait for it to exit.
    pub fn close(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("stopping reactor");

            if let Err(e) = self.shared.waker.wake() {
                error!("could not wake reactor: {e}");
            }
        }

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }

            if thread.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

fn timer_fd(duration: Duration) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };

    if fd == -1 {
        return Err(io::Error::last_os_error());
    }

    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // An all-zero expiry disarms the timer instead of firing it.
    let duration = duration.max(Duration::from_nanos(1));
    let mut expiry: libc::itimerspec = unsafe { std::mem::zeroed() };
    expiry.it_value.tv_sec = duration.as_secs() as _;
    expiry.it_value.tv_nsec = duration.subsec_nanos() as _;

    if unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &expiry, std::ptr::null_mut()) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Work handed to the reactor thread.
pub(crate) enum Op {
    Listen {
        fd: OwnedFd,
        handler: ConnectionHandler,
        local_addr: std::net::SocketAddr,
        promise: Promise<Server>,
    },
    Connect {
        fd: OwnedFd,
        promise: Promise<Channel>,
    },
    Timer {
        fd: OwnedFd,
        promise: Promise<()>,
    },
    Interest {
        channel: Arc<ChannelInner>,
        interest: Interest,
    },
    Deregister(Arc<ChannelInner>),
    CloseServer(Arc<ServerInner>),
}

impl Op {
    /// Dispose of an operation the reactor will never get to.
    fn abort(self) {
        match self {
            Op::Listen { promise, .. } => {
                promise.fail(Error::Closed);
            }
            Op::Connect { promise, .. } => {
                promise.fail(Error::Closed);
            }
            Op::Timer { promise, .. } => {
                promise.cancel();
            }
            Op::Deregister(channel) => channel.release_fd(),
            Op::Interest { .. } | Op::CloseServer(_) => {}
        }
    }
}

fn abort_all(ops: &Mutex<Vec<Op>>) {
    let ops = std::mem::take(&mut *ops.lock().unwrap_or_else(PoisonError::into_inner));

    for op in ops {
        op.abort();
    }
}

/// State shared between a reactor thread and everything registered with it.
pub(crate) struct Shared {
    ops: SegQueue<Op>,
    waker: Waker,
    running: AtomicBool,
    executor: Arc<dyn Executor>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue `op` for the reactor thread. If the reactor has stopped the
    /// operation is aborted instead.
    pub(crate) fn submit(&self, op: Op) {
        if !self.is_running() {
            op.abort();
            return;
        }

        self.ops.push(op);

        if let Err(e) = self.waker.wake() {
            error!("could not wake reactor: {e}");
        }

        // The reactor may have drained its queue for the last time after
        // the check above.
        if !self.is_running() {
            self.abort_queued();
        }
    }

    /// Abort everything still queued. The aborts run on the executor so the
    /// continuations of the failed promises stay off the reactor thread.
    fn abort_queued(&self) {
        let mut ops = Vec::new();
        while let Some(op) = self.ops.pop() {
            ops.push(op);
        }

        if ops.is_empty() {
            return;
        }

        // Kept here as well: a rejected job is dropped along with whatever it
        // owns.
        let ops = Arc::new(Mutex::new(ops));
        let queued = ops.clone();

        if let Err(e) = self.executor.execute(Box::new(move || abort_all(&queued))) {
            warn!("could not hand aborted operations to executor: {e}");
            abort_all(&ops);
        }
    }

    /// Close `channel` on the executor. Its pending requests fail there, not
    /// on the reactor thread.
    fn close_channel(&self, channel: Arc<ChannelInner>) {
        let inner = channel.clone();

        if let Err(e) = self.executor.execute(Box::new(move || inner.close())) {
            warn!("could not hand channel close to executor: {e}");
            channel.close();
        }
    }

    /// Settle `promise` on the worker executor. If the executor refuses the
    /// job the promise fails with its error and the result is dropped.
    fn settle<T>(&self, promise: Promise<T>, result: Result<T>)
    where
        T: Send + Sync + 'static,
    {
        let p = promise.clone();

        if let Err(e) = self.executor.execute(Box::new(move || {
            p.settle(result);
        })) {
            warn!("could not hand completion to executor: {e}");
            promise.fail(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use anyhow::Result;

    use super::{BindOptions, ConnectOptions, Reactor};
    use crate::{
        error::Error,
        futures::{Future, Promise},
        task::Inline,
    };

    fn reactor() -> Result<Reactor> {
        let _ = env_logger::builder().is_test(true).try_init();
        Ok(Reactor::builder().worker_threads(2).name("test-reactor").build()?)
    }

    #[test]
    fn delay_completes_after_duration() -> Result<()> {
        let reactor = reactor()?;
        let start = Instant::now();

        reactor.delay(Duration::from_millis(50)).get()?;

        assert!(start.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn zero_delay_still_fires() -> Result<()> {
        let reactor = reactor()?;
        reactor.delay(Duration::ZERO).get_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    #[test]
    fn cancel_after_cancels_pending_future() -> Result<()> {
        let reactor = reactor()?;
        let promise = Promise::<u32>::new();

        let fut = reactor.cancel_after(&promise.future(), Duration::from_millis(20));

        assert!(matches!(fut.get(), Err(Error::Cancelled)));
        assert!(!promise.complete(1));
        Ok(())
    }

    #[test]
    fn cancel_after_leaves_completed_future_alone() -> Result<()> {
        let reactor = reactor()?;
        let fut = reactor.cancel_after(&Future::completed(7u32), Duration::from_millis(10));

        reactor.delay(Duration::from_millis(30)).get()?;
        assert_eq!(fut.get()?, 7);
        Ok(())
    }

    #[test]
    fn blocking_on_reactor_thread_is_refused() -> Result<()> {
        let reactor = Reactor::builder().executor(Arc::new(Inline)).build()?;
        let refused = Arc::new(AtomicBool::new(false));
        let pending = Promise::<()>::new().future();

        let r = refused.clone();
        let done = reactor.delay(Duration::from_millis(1)).map(move |_| {
            // With the inline executor this runs on the reactor thread.
            r.store(matches!(pending.get(), Err(Error::ReactorThread)), Ordering::SeqCst);
        });

        done.get()?;
        assert!(refused.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn bind_reports_address_in_use() -> Result<()> {
        let reactor = reactor()?;
        let server = reactor
            .bind(BindOptions::new("127.0.0.1:0".parse()?, |_| Ok(())))
            .get()?;

        let taken = std::net::SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));
        let again = reactor.bind(BindOptions::new(taken, |_| Ok(())).option(
            super::SocketOption::ReuseAddr(false),
        ));

        assert!(matches!(again.get(), Err(Error::Io(_))));
        Ok(())
    }

    #[test]
    fn connect_refused_fails() -> Result<()> {
        let reactor = reactor()?;

        // Grab a free port and release it again.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
        let fut = reactor.connect(ConnectOptions::new(addr));

        assert!(matches!(fut.get(), Err(Error::Io(_))));
        Ok(())
    }

    #[test]
    fn closed_reactor_fails_new_work() -> Result<()> {
        let reactor = reactor()?;
        let pending = reactor.delay(Duration::from_secs(60));

        reactor.close();

        assert!(!reactor.is_running());
        assert!(matches!(pending.get(), Err(Error::Cancelled)));
        assert!(matches!(
            reactor.delay(Duration::from_millis(1)).get(),
            Err(Error::Cancelled)
        ));

        let server = reactor.bind(BindOptions::new("127.0.0.1:0".parse()?, |_| Ok(())));
        assert!(matches!(server.get(), Err(Error::Closed)));
        Ok(())
    }
}
