//! Thin `io::Result` wrappers around the socket syscalls the reactor and
//! channels need. Every descriptor is created non-blocking and close-on-exec.
use std::{
    io,
    mem::size_of,
    net::SocketAddr,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};

use libc::{AF_INET, AF_INET6, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM};

use super::sock_addr::CSockAddr;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub(crate) fn stream_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = if addr.is_ipv4() { AF_INET } else { AF_INET6 };
    let sock = cvt(unsafe { libc::socket(family, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, 0) })?;

    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

pub(crate) fn bind(fd: BorrowedFd, addr: SocketAddr) -> io::Result<()> {
    let caddr: CSockAddr = addr.into();
    cvt(unsafe { libc::bind(fd.as_raw_fd(), caddr.as_ptr(), caddr.len) })?;
    Ok(())
}

pub(crate) fn listen(fd: BorrowedFd, backlog: u32) -> io::Result<()> {
    let backlog = backlog.min(libc::c_int::MAX as u32) as libc::c_int;
    cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(())
}

/// Start a non-blocking connect. Returns `true` if the connection was
/// established immediately and `false` if it is in progress.
pub(crate) fn connect(fd: BorrowedFd, addr: SocketAddr) -> io::Result<bool> {
    let caddr: CSockAddr = addr.into();

    match cvt(unsafe { libc::connect(fd.as_raw_fd(), caddr.as_ptr(), caddr.len) }) {
        Ok(_) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn accept(fd: BorrowedFd) -> io::Result<OwnedFd> {
    let sock = cvt(unsafe {
        libc::accept4(
            fd.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            SOCK_NONBLOCK | SOCK_CLOEXEC,
        )
    })?;

    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

pub(crate) fn local_addr(fd: BorrowedFd) -> io::Result<SocketAddr> {
    let mut addr = CSockAddr::empty();
    cvt(unsafe { libc::getsockname(fd.as_raw_fd(), addr.as_mut_ptr(), &mut addr.len) })?;
    SocketAddr::try_from(&addr)
}

pub(crate) fn peer_addr(fd: BorrowedFd) -> io::Result<SocketAddr> {
    let mut addr = CSockAddr::empty();
    cvt(unsafe { libc::getpeername(fd.as_raw_fd(), addr.as_mut_ptr(), &mut addr.len) })?;
    SocketAddr::try_from(&addr)
}

pub(crate) fn set_option(
    fd: BorrowedFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const _,
            size_of::<libc::c_int>() as _,
        )
    })?;

    Ok(())
}

/// The pending error of a socket (`SO_ERROR`), which is how the outcome of a
/// non-blocking connect is reported.
pub(crate) fn take_error(fd: BorrowedFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;

    cvt(unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut libc::c_int as *mut _,
            &mut len,
        )
    })?;

    Ok((value != 0).then(|| io::Error::from_raw_os_error(value)))
}

pub(crate) fn recv(fd: BorrowedFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len(), 0) })
}

/// Send without raising `SIGPIPE` when the peer has gone away.
pub(crate) fn send(fd: BorrowedFd, buf: &[u8]) -> io::Result<usize> {
    cvt_size(unsafe {
        libc::send(
            fd.as_raw_fd(),
            buf.as_ptr() as *const _,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    })
}

pub(crate) fn shutdown(fd: BorrowedFd) -> io::Result<()> {
    cvt(unsafe { libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR) })?;
    Ok(())
}
