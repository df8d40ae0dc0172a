use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::reactor::{Op, Shared};

/// A listening socket registered with a reactor.
///
/// The server keeps accepting connections until [Server::close] is called or
/// the reactor shuts down; dropping the handle does not stop it.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) key: usize,
    pub(crate) gen: u32,
    local_addr: SocketAddr,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl Server {
    pub(crate) fn new(inner: Arc<ServerInner>) -> Self {
        Self { inner }
    }

    /// The address the server is listening on. Useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_open(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Stop accepting connections. Connections already accepted are not
    /// affected.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.shared.submit(Op::CloseServer(self.inner.clone()));
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ServerInner {
    pub(crate) fn new(key: usize, gen: u32, local_addr: SocketAddr, shared: Arc<Shared>) -> Self {
        Self {
            key,
            gen,
            local_addr,
            closed: AtomicBool::new(false),
            shared,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
