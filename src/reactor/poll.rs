use std::{
    io,
    mem::MaybeUninit,
    ops::BitOr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

/// The set of readiness events a descriptor is registered for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITE: Interest = Interest(libc::EPOLLOUT as u32);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interest) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self::Output {
        Interest(self.0 | rhs.0)
    }
}

/// What a descriptor reported as ready.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness(u32);

impl Readiness {
    /// The interest bits this readiness satisfies. Errors and hang-ups satisfy
    /// every interest, so that whichever operation is waiting gets to observe
    /// them.
    pub fn satisfies(self, registered: Interest) -> Interest {
        if self.0 & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            return registered;
        }

        registered.intersect(Interest(self.0))
    }
}

/// A thin wrapper around an epoll instance.
pub(crate) struct Poll {
    epoll: OwnedFd,
    events: Vec<MaybeUninit<libc::epoll_event>>,
}

impl Poll {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![MaybeUninit::uninit(); max_events.max(1)],
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Interest, data: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.0,
            u64: data,
        };

        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };

        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn add(&self, fd: RawFd, interest: Interest, data: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, data)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::NONE, 0)
    }

    /// Move a descriptor from `old` to `new` interest. Descriptors without any
    /// interest are not kept in the epoll set at all, so a hung-up socket
    /// nobody is waiting on cannot make the wait spin.
    pub fn update(&self, fd: RawFd, data: u64, old: Interest, new: Interest) -> io::Result<()> {
        match (old.is_empty(), new.is_empty()) {
            (true, true) => Ok(()),
            (true, false) => self.add(fd, new, data),
            (false, true) => self.delete(fd),
            (false, false) if old == new => Ok(()),
            (false, false) => self.ctl(libc::EPOLL_CTL_MOD, fd, new, data),
        }
    }

    /// Block until at least one descriptor is ready or `timeout` elapses.
    /// Returns the registration data and readiness of each ready descriptor.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
    ) -> io::Result<impl Iterator<Item = (u64, Readiness)> + '_> {
        let timeout = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr() as *mut _,
                self.events.len() as i32,
                timeout,
            )
        };

        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(self.events.iter().take(n as usize).map(|x| {
            let event = unsafe { x.assume_init() };
            let data = event.u64;
            let events = event.events;
            (data, Readiness(events))
        }))
    }
}

/// A non-blocking eventfd used to interrupt [Poll::wait] from other threads.
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const _,
                std::mem::size_of::<u64>(),
            )
        };

        if ret == -1 {
            let err = io::Error::last_os_error();
            // A saturated counter still wakes the poller.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Reset the counter after a wake-up.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut _,
                std::mem::size_of::<u64>(),
            )
        };
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
