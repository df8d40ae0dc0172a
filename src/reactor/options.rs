use std::{fmt, io, net::SocketAddr, os::fd::BorrowedFd, sync::Arc};

use crate::{
    error::Result,
    net::{socket::set_option, Channel},
};

/// Called on a worker thread for every accepted connection.
///
/// Returning an error (or panicking) closes the connection.
pub type ConnectionHandler = Arc<dyn Fn(Channel) -> Result<()> + Send + Sync>;

/// A socket option applied before the socket is bound or connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    ReuseAddr(bool),
    ReusePort(bool),
    NoDelay(bool),
    KeepAlive(bool),
    SendBuffer(usize),
    RecvBuffer(usize),
}

impl SocketOption {
    pub(crate) fn apply(&self, fd: BorrowedFd) -> io::Result<()> {
        let flag = |on: bool| on as libc::c_int;
        let clamp = |n: usize| n.min(libc::c_int::MAX as usize) as libc::c_int;

        let (level, name, value) = match *self {
            SocketOption::ReuseAddr(on) => (libc::SOL_SOCKET, libc::SO_REUSEADDR, flag(on)),
            SocketOption::ReusePort(on) => (libc::SOL_SOCKET, libc::SO_REUSEPORT, flag(on)),
            SocketOption::NoDelay(on) => (libc::IPPROTO_TCP, libc::TCP_NODELAY, flag(on)),
            SocketOption::KeepAlive(on) => (libc::SOL_SOCKET, libc::SO_KEEPALIVE, flag(on)),
            SocketOption::SendBuffer(n) => (libc::SOL_SOCKET, libc::SO_SNDBUF, clamp(n)),
            SocketOption::RecvBuffer(n) => (libc::SOL_SOCKET, libc::SO_RCVBUF, clamp(n)),
        };

        set_option(fd, level, name, value)
    }
}

/// Parameters for [super::Reactor::bind].
#[derive(Clone)]
pub struct BindOptions {
    pub(crate) addr: SocketAddr,
    pub(crate) handler: ConnectionHandler,
    pub(crate) backlog: u32,
    pub(crate) options: Vec<SocketOption>,
}

impl BindOptions {
    /// Listen on `addr`, handing every accepted connection to `handler`.
    /// `SO_REUSEADDR` is set by default.
    pub fn new<F>(addr: SocketAddr, handler: F) -> Self
    where
        F: Fn(Channel) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            addr,
            handler: Arc::new(handler),
            backlog: 1024,
            options: vec![SocketOption::ReuseAddr(true)],
        }
    }

    /// Length of the queue of connections not yet accepted. Defaults to 1024.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn option(mut self, option: SocketOption) -> Self {
        self.options.push(option);
        self
    }
}

impl fmt::Debug for BindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindOptions")
            .field("addr", &self.addr)
            .field("backlog", &self.backlog)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Parameters for [super::Reactor::connect].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub(crate) addr: SocketAddr,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) options: Vec<SocketOption>,
}

impl ConnectOptions {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            local: None,
            options: Vec::new(),
        }
    }

    /// Bind the socket to `addr` before connecting.
    pub fn local(mut self, addr: SocketAddr) -> Self {
        self.local = Some(addr);
        self
    }

    pub fn option(mut self, option: SocketOption) -> Self {
        self.options.push(option);
        self
    }
}
