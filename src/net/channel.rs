use std::{
    fmt, io,
    net::SocketAddr,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use crossbeam::queue::SegQueue;
use log::{debug, trace};

use super::{
    buffer::{BufferSupplier, Lease},
    socket,
};
use crate::{
    error::Error,
    futures::{Future, Promise},
    reactor::{Interest, Op, Shared},
};

/// An open connection registered with a reactor.
///
/// A channel has at most one outstanding read and any number of queued writes,
/// which are sent strictly in the order they were issued. Handles are cheap to
/// clone. Dropping them does not close the connection: that happens when
/// [Channel::close] is called, when a read or write hits an I/O error, or when
/// the reactor shuts down.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct Request<T> {
    promise: Promise<T>,
    lease: Arc<Lease>,
}

enum Drained {
    Done,
    Blocked,
    Failed(Error),
}

pub(crate) struct ChannelInner {
    fd: RwLock<Option<OwnedFd>>,
    pub(crate) key: usize,
    pub(crate) gen: u32,
    shared: Arc<Shared>,
    closed: AtomicBool,
    reading: AtomicBool,
    read: Slot<Request<Vec<u8>>>,
    writes: SegQueue<Arc<Request<()>>>,
    /// Writes issued but not yet finished, including the one at the head.
    write_pending: AtomicUsize,
    /// A partially sent write waiting for the socket to drain.
    write_head: Slot<Request<()>>,
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// Read whatever is available into the buffer obtained from `supplier`.
    ///
    /// Completes with the bytes read, or with an empty vector once the peer
    /// has closed its side. Fails with [Error::ReadPending] if another read is
    /// still outstanding; that read is left untouched.
    pub fn read(&self, supplier: impl BufferSupplier) -> Future<Vec<u8>> {
        let inner = &self.inner;
        let lease = Arc::new(Lease::new(supplier));

        if inner.is_closed() {
            lease.release();
            return Future::failed(Error::Closed);
        }

        if inner
            .reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            lease.release();
            return Future::failed(Error::ReadPending);
        }

        let req = Arc::new(Request {
            promise: Promise::new(),
            lease: lease.clone(),
        });
        let fut = req.promise.future();

        let channel = Arc::downgrade(inner);
        let this = Arc::downgrade(&req);
        fut.listen(move |_| {
            lease.release();

            if let Some(channel) = channel.upgrade() {
                channel.read.take_if(this.as_ptr());
                channel.reading.store(false, Ordering::Release);
            }
        });

        // Anything still parked here has already finished.
        drop(inner.read.put(req));
        inner.want(Interest::READ);

        if inner.is_closed() {
            inner.fail_pending();
        }

        fut
    }

    /// Queue the contents of `supplier` to be sent.
    ///
    /// Completes once every byte has been handed to the kernel.
    pub fn write(&self, supplier: impl BufferSupplier) -> Future<()> {
        let inner = &self.inner;
        let lease = Arc::new(Lease::new(supplier));

        if inner.is_closed() {
            lease.release();
            return Future::failed(Error::Closed);
        }

        let req = Arc::new(Request {
            promise: Promise::new(),
            lease: lease.clone(),
        });
        let fut = req.promise.future();
        fut.listen(move |_| lease.release());

        inner.writes.push(req);

        if inner.write_pending.fetch_add(1, Ordering::AcqRel) == 0 {
            inner.want(Interest::WRITE);
        }

        if inner.is_closed() {
            inner.fail_pending();
        }

        fut
    }

    pub fn is_open(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Close the connection, failing every outstanding read and write with
    /// [Error::Closed]. Closing an already closed channel does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.with_fd(socket::peer_addr)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.with_fd(socket::local_addr)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.inner.key)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ChannelInner {
    pub(crate) fn new(fd: OwnedFd, key: usize, gen: u32, shared: Arc<Shared>) -> Self {
        Self {
            fd: RwLock::new(Some(fd)),
            key,
            gen,
            shared,
            closed: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            read: Slot::new(),
            writes: SegQueue::new(),
            write_pending: AtomicUsize::new(0),
            write_head: Slot::new(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.fd
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|fd| fd.as_raw_fd())
    }

    fn with_fd<R>(&self, f: impl FnOnce(BorrowedFd) -> io::Result<R>) -> io::Result<R> {
        let fd = self.fd.read().unwrap_or_else(PoisonError::into_inner);

        match fd.as_ref() {
            Some(fd) => f(fd.as_fd()),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Drop the descriptor. Called once the reactor has forgotten about it.
    pub(crate) fn release_fd(&self) {
        let fd = self.fd.write().unwrap_or_else(PoisonError::into_inner).take();
        drop(fd);
    }

    fn want(self: &Arc<Self>, interest: Interest) {
        self.shared.submit(Op::Interest {
            channel: self.clone(),
            interest,
        });
    }

    fn fault(&self, err: io::Error) -> Error {
        if self.is_closed() {
            Error::Closed
        } else {
            err.into()
        }
    }

    pub(crate) fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("closing channel {}", self.key);

        // Wakes up the peer and any syscall racing with us. The socket may
        // already be disconnected.
        let _ = self.with_fd(socket::shutdown);

        self.fail_pending();
        self.shared.submit(Op::Deregister(self.clone()));
    }

    fn fail_pending(&self) {
        if let Some(req) = self.read.take() {
            req.promise.fail(Error::Closed);
        }

        if let Some(req) = self.write_head.take() {
            req.promise.fail(Error::Closed);
        }

        while let Some(req) = self.writes.pop() {
            req.promise.fail(Error::Closed);
        }
    }

    /// Runs on a worker once the socket has reported readable.
    pub(crate) fn perform_read(self: &Arc<Self>) {
        let Some(req) = self.read.take() else {
            return;
        };

        if req.promise.is_done() {
            return;
        }

        let Some(mut buf) = req.lease.checkout() else {
            return;
        };

        if buf.is_empty() {
            req.promise.fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read buffer has no room",
            ));
            return;
        }

        let res = loop {
            match self.with_fd(|fd| socket::recv(fd, &mut buf)) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => break res,
            }
        };

        match res {
            Ok(0) if self.is_closed() => {
                req.promise.fail(Error::Closed);
            }
            Ok(n) => {
                trace!("channel {}: read {n} bytes", self.key);
                buf.truncate(n);
                req.promise.complete(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                req.lease.checkin(buf);
                self.park_read(req);
            }
            Err(e) => {
                debug!("channel {}: read failed: {e}", self.key);
                req.promise.fail(self.fault(e));
                self.close();
            }
        }
    }

    fn park_read(self: &Arc<Self>, req: Arc<Request<Vec<u8>>>) {
        let ptr = Arc::as_ptr(&req);

        if !self.read.restore(req.clone()) {
            return;
        }

        if req.promise.is_done() {
            self.read.take_if(ptr);
            return;
        }

        if self.is_closed() {
            if self.read.take_if(ptr) {
                req.promise.fail(Error::Closed);
            }
            return;
        }

        self.want(Interest::READ);
    }

    /// Runs on a worker once the socket has reported writable. Only one
    /// invocation is active at a time: a new one is only requested when the
    /// queue goes from empty to non-empty, or by this one when it parks.
    pub(crate) fn perform_write(self: &Arc<Self>) {
        loop {
            if self.is_closed() {
                return;
            }

            let Some(req) = self.write_head.take().or_else(|| self.writes.pop()) else {
                return;
            };

            match self.drain(&req) {
                Drained::Done => {
                    if self.write_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        return;
                    }
                }
                Drained::Blocked => {
                    self.park_write(req);
                    return;
                }
                Drained::Failed(e) => {
                    debug!("channel {}: write failed: {e}", self.key);
                    req.promise.fail(e);
                    self.close();
                    return;
                }
            }
        }
    }

    fn drain(&self, req: &Request<()>) -> Drained {
        if req.promise.is_done() {
            return Drained::Done;
        }

        let Some(mut buf) = req.lease.checkout() else {
            return Drained::Done;
        };

        let mut sent = 0;

        while sent < buf.len() {
            match self.with_fd(|fd| socket::send(fd, &buf[sent..])) {
                Ok(0) => return Drained::Failed(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!("channel {}: send buffer full after {sent} bytes", self.key);
                    buf.drain(..sent);
                    req.lease.checkin(buf);
                    return Drained::Blocked;
                }
                Err(e) => return Drained::Failed(self.fault(e)),
            }
        }

        req.promise.complete(());
        Drained::Done
    }

    fn park_write(self: &Arc<Self>, req: Arc<Request<()>>) {
        drop(self.write_head.put(req));

        if self.is_closed() {
            if let Some(req) = self.write_head.take() {
                req.promise.fail(Error::Closed);
            }
            return;
        }

        self.want(Interest::WRITE);
    }
}

/// A slot holding at most one shared request, which whoever takes it out
/// owns exclusively.
struct Slot<T>(AtomicPtr<T>);

impl<T> Slot<T> {
    fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    fn own(ptr: *mut T) -> Option<Arc<T>> {
        (!ptr.is_null()).then(|| unsafe { Arc::from_raw(ptr) })
    }

    /// Store `item`, returning what was there before.
    fn put(&self, item: Arc<T>) -> Option<Arc<T>> {
        Self::own(self.0.swap(Arc::into_raw(item) as *mut T, Ordering::AcqRel))
    }

    /// Store `item` only if the slot is empty.
    fn restore(&self, item: Arc<T>) -> bool {
        let ptr = Arc::into_raw(item) as *mut T;

        match self
            .0
            .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                drop(unsafe { Arc::from_raw(ptr) });
                false
            }
        }
    }

    fn take(&self) -> Option<Arc<T>> {
        Self::own(self.0.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Empty the slot if it holds `item`. The caller must keep `item`'s
    /// allocation alive (through a strong or weak reference) so the address
    /// cannot have been reused.
    fn take_if(&self, item: *const T) -> bool {
        match self.0.compare_exchange(
            item as *mut T,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(ptr) => {
                drop(unsafe { Arc::from_raw(ptr) });
                true
            }
            Err(_) => false,
        }
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::Slot;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn slot_ownership() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slot = Slot::new();

        let a = Arc::new(Tracked(drops.clone()));
        let b = Arc::new(Tracked(drops.clone()));

        assert!(slot.put(a.clone()).is_none());
        assert!(!slot.restore(b.clone()));
        assert!(!slot.take_if(Arc::as_ptr(&b)));
        assert!(slot.take_if(Arc::as_ptr(&a)));
        assert!(slot.take().is_none());

        assert!(slot.restore(b.clone()));
        drop(slot);
        drop((a, b));

        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
