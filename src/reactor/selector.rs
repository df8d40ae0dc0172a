use std::{
    io,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
};

use log::{debug, error, trace, warn};
use slab::Slab;

use super::{
    poll::{Interest, Poll, Readiness},
    ConnectionHandler, Op, Shared,
};
use crate::{
    error::Error,
    futures::Promise,
    net::{socket, Channel, ChannelInner, Server, ServerInner},
};

/// Slab key of the waker, which is registered first.
const WAKER: usize = 0;

/// What a registered descriptor is for.
enum Entry {
    Waker,
    Listener {
        fd: OwnedFd,
        server: Arc<ServerInner>,
        handler: ConnectionHandler,
    },
    Connecting {
        fd: OwnedFd,
        promise: Promise<Channel>,
    },
    Channel {
        channel: Arc<ChannelInner>,
        /// The interest currently in the `epoll` set.
        registered: Interest,
    },
    Timer {
        fd: OwnedFd,
        promise: Promise<()>,
    },
}

struct Registration {
    /// Distinguishes this registration from earlier ones that used the same
    /// slab key, so that events queued for those are ignored.
    gen: u32,
    entry: Entry,
}

fn token(key: usize, gen: u32) -> u64 {
    ((gen as u64) << 32) | key as u64
}

fn split(token: u64) -> (usize, u32) {
    ((token & 0xffff_ffff) as usize, (token >> 32) as u32)
}

/// The reactor thread's state. Only ever touched from that thread.
pub(super) struct Selector {
    poll: Poll,
    registrations: Slab<Registration>,
    ready: Vec<(u64, Readiness)>,
    next_gen: u32,
    shared: Arc<Shared>,
}

impl Selector {
    pub fn new(max_events: usize, shared: Arc<Shared>) -> io::Result<Self> {
        let poll = Poll::new(max_events)?;
        let mut registrations = Slab::new();

        let key = registrations.insert(Registration {
            gen: 0,
            entry: Entry::Waker,
        });
        debug_assert_eq!(key, WAKER);

        poll.add(shared.waker.as_raw_fd(), Interest::READ, token(WAKER, 0))?;

        Ok(Self {
            poll,
            registrations,
            ready: Vec::with_capacity(max_events),
            next_gen: 1,
            shared,
        })
    }

    pub fn run(mut self) {
        super::enter();
        debug!("reactor started");

        while self.shared.is_running() {
            if let Err(e) = self.turn() {
                error!("reactor wait failed: {e}");
                break;
            }
        }

        self.shutdown();
        debug!("reactor stopped");
    }

    fn turn(&mut self) -> io::Result<()> {
        self.drain_ops();

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();

        match self.poll.wait(None) {
            Ok(events) => ready.extend(events),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        // Reset the waker before looking at the queue; a wake that arrives
        // after this point makes the next wait return immediately.
        self.shared.waker.drain();
        self.drain_ops();

        for &(token, readiness) in &ready {
            self.dispatch(token, readiness);
        }

        self.ready = ready;

        Ok(())
    }

    fn vacant(&mut self) -> (usize, u32) {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1).max(1);

        (self.registrations.vacant_key(), gen)
    }

    fn register_channel(&mut self, fd: OwnedFd) -> Arc<ChannelInner> {
        let (key, gen) = self.vacant();
        let channel = Arc::new(ChannelInner::new(fd, key, gen, self.shared.clone()));

        self.registrations.insert(Registration {
            gen,
            entry: Entry::Channel {
                channel: channel.clone(),
                registered: Interest::NONE,
            },
        });

        channel
    }

    /// Forget a registration, taking its descriptor out of the `epoll` set.
    fn remove(&mut self, key: usize) -> Option<Entry> {
        let reg = self.registrations.try_remove(key)?;

        let fd = match &reg.entry {
            Entry::Waker => None,
            Entry::Listener { fd, .. } | Entry::Connecting { fd, .. } | Entry::Timer { fd, .. } => {
                Some(fd.as_raw_fd())
            }
            Entry::Channel {
                channel,
                registered,
            } => (!registered.is_empty()).then(|| channel.raw_fd()).flatten(),
        };

        if let Some(fd) = fd {
            if let Err(e) = self.poll.delete(fd) {
                warn!("could not remove descriptor {fd} from epoll: {e}");
            }
        }

        Some(reg.entry)
    }

    fn matches(&self, key: usize, gen: u32) -> Option<&Entry> {
        self.registrations
            .get(key)
            .filter(|reg| reg.gen == gen)
            .map(|reg| &reg.entry)
    }

    fn drain_ops(&mut self) {
        while let Some(op) = self.shared.ops.pop() {
            self.apply(op);
        }
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Listen {
                fd,
                handler,
                local_addr,
                promise,
            } => {
                if promise.is_done() {
                    debug!("bind to {local_addr} abandoned before registration");
                    return;
                }

                let (key, gen) = self.vacant();

                if let Err(e) = self.poll.add(fd.as_raw_fd(), Interest::READ, token(key, gen)) {
                    self.shared.settle(promise, Err(e.into()));
                    return;
                }

                let server = Arc::new(ServerInner::new(key, gen, local_addr, self.shared.clone()));

                self.registrations.insert(Registration {
                    gen,
                    entry: Entry::Listener {
                        fd,
                        server: server.clone(),
                        handler,
                    },
                });

                debug!("listening on {local_addr}");

                let handle = Server::new(server);
                let p = promise.clone();
                let job = Box::new(move || {
                    if !p.complete(handle.clone()) {
                        handle.close();
                    }
                });

                if let Err(e) = self.shared.executor.execute(job) {
                    warn!("could not hand bind completion to executor: {e}");
                    self.remove(key);
                    promise.fail(e);
                }
            }
            Op::Connect { fd, promise } => {
                let (key, gen) = self.vacant();

                if let Err(e) = self.poll.add(fd.as_raw_fd(), Interest::WRITE, token(key, gen)) {
                    self.shared.settle(promise, Err(e.into()));
                    return;
                }

                self.registrations.insert(Registration {
                    gen,
                    entry: Entry::Connecting { fd, promise },
                });
            }
            Op::Timer { fd, promise } => {
                let (key, gen) = self.vacant();

                if let Err(e) = self.poll.add(fd.as_raw_fd(), Interest::READ, token(key, gen)) {
                    self.shared.settle(promise, Err(e.into()));
                    return;
                }

                self.registrations.insert(Registration {
                    gen,
                    entry: Entry::Timer { fd, promise },
                });
            }
            Op::Interest { channel, interest } => self.want(&channel, interest),
            Op::Deregister(channel) => {
                if let Some(Entry::Channel { .. }) = self.matches(channel.key, channel.gen) {
                    self.remove(channel.key);
                }

                channel.release_fd();
                debug!("channel {} deregistered", channel.key);
            }
            Op::CloseServer(server) => {
                if let Some(Entry::Listener { .. }) = self.matches(server.key, server.gen) {
                    self.remove(server.key);
                    debug!("server {} closed", server.key);
                }
            }
        }
    }

    fn want(&mut self, channel: &Arc<ChannelInner>, interest: Interest) {
        if channel.is_closed() {
            return;
        }

        let Some(reg) = self.registrations.get_mut(channel.key) else {
            return;
        };

        if reg.gen != channel.gen {
            return;
        }

        let Entry::Channel { registered, .. } = &mut reg.entry else {
            return;
        };

        let Some(fd) = channel.raw_fd() else {
            return;
        };

        let wanted = *registered | interest;

        match self
            .poll
            .update(fd, token(channel.key, channel.gen), *registered, wanted)
        {
            Ok(()) => *registered = wanted,
            Err(e) => {
                warn!("could not update interest of channel {}: {e}", channel.key);
                self.shared.close_channel(channel.clone());
            }
        }
    }

    fn dispatch(&mut self, token: u64, readiness: Readiness) {
        let (key, gen) = split(token);

        let Some(entry) = self.matches(key, gen) else {
            trace!("stale event for {key}");
            return;
        };

        match entry {
            Entry::Waker => {}
            Entry::Listener { .. } => self.accept(key),
            Entry::Connecting { .. } => self.connected(key),
            Entry::Channel { .. } => self.ready(key, token, readiness),
            Entry::Timer { .. } => self.expired(key),
        }
    }

    /// Accept a single connection; the listener stays readable while more
    /// are queued.
    fn accept(&mut self, key: usize) {
        let Some(Registration {
            entry: Entry::Listener {
                fd,
                server,
                handler,
            },
            ..
        }) = self.registrations.get(key)
        else {
            return;
        };

        if server.is_closed() {
            self.remove(key);
            return;
        }

        let accepted = socket::accept(fd.as_fd());
        let handler = handler.clone();

        match accepted {
            Ok(fd) => {
                let channel = self.register_channel(fd);
                debug!("accepted channel {} on server {key}", channel.key);
                self.hand_off(channel, handler);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept on server {key} failed: {e}"),
        }
    }

    /// Run the connection handler for a freshly accepted channel on the
    /// executor. A handler that fails or panics gets its connection closed.
    fn hand_off(&self, channel: Arc<ChannelInner>, handler: ConnectionHandler) {
        let inner = channel.clone();

        let job = Box::new(move || {
            let key = inner.key;
            let handle = Channel::new(inner.clone());

            match catch_unwind(AssertUnwindSafe(|| handler(handle))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("connection handler for channel {key} failed: {e}");
                    inner.close();
                }
                Err(_) => {
                    error!("connection handler for channel {key} panicked");
                    inner.close();
                }
            }
        });

        if let Err(e) = self.shared.executor.execute(job) {
            error!("could not dispatch connection handler: {e}");
            channel.close();
        }
    }

    fn connected(&mut self, key: usize) {
        let Some(Entry::Connecting { fd, promise }) = self.remove(key) else {
            return;
        };

        let status = socket::take_error(fd.as_fd());

        match status {
            Ok(None) => {
                let channel = self.register_channel(fd);
                debug!("connected channel {}", channel.key);

                let p = promise.clone();
                let inner = channel.clone();
                let job = Box::new(move || {
                    if !p.complete(Channel::new(inner.clone())) {
                        debug!("connect abandoned, closing channel {}", inner.key);
                        inner.close();
                    }
                });

                if let Err(e) = self.shared.executor.execute(job) {
                    warn!("could not hand connect completion to executor: {e}");
                    channel.close();
                    promise.fail(e);
                }
            }
            Ok(Some(e)) | Err(e) => {
                debug!("connect failed: {e}");
                self.shared.settle(promise, Err(e.into()));
            }
        }
    }

    fn ready(&mut self, key: usize, token: u64, readiness: Readiness) {
        let Some(Registration {
            entry: Entry::Channel {
                channel,
                registered,
            },
            ..
        }) = self.registrations.get_mut(key)
        else {
            return;
        };

        let fired = readiness.satisfies(*registered);
        let remaining = registered.remove(fired);

        if let Some(fd) = channel.raw_fd() {
            if let Err(e) = self.poll.update(fd, token, *registered, remaining) {
                warn!("could not update interest of channel {key}: {e}");
            }
        }

        *registered = remaining;
        let channel = channel.clone();

        if fired.contains(Interest::READ) {
            self.perform(&channel, ChannelInner::perform_read);
        }

        if fired.contains(Interest::WRITE) {
            self.perform(&channel, ChannelInner::perform_write);
        }
    }

    fn perform(&self, channel: &Arc<ChannelInner>, io: fn(&Arc<ChannelInner>)) {
        let c = channel.clone();

        if let Err(e) = self.shared.executor.execute(Box::new(move || io(&c))) {
            error!("could not dispatch I/O for channel {}: {e}", channel.key);
            channel.close();
        }
    }

    fn expired(&mut self, key: usize) {
        if let Some(Entry::Timer { promise, .. }) = self.remove(key) {
            self.shared.settle(promise, Ok(()));
        }
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.abort_queued();

        for reg in self.registrations.drain() {
            match reg.entry {
                Entry::Waker => {}
                Entry::Listener { server, .. } => server.mark_closed(),
                Entry::Connecting { promise, .. } => {
                    self.shared.settle(promise, Err(Error::Closed));
                }
                Entry::Channel { channel, .. } => self.shared.close_channel(channel),
                Entry::Timer { promise, .. } => {
                    self.shared.settle(promise, Err(Error::Cancelled));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{split, token};

    #[test]
    fn tokens_carry_key_and_generation() {
        assert_eq!(split(token(0, 0)), (0, 0));
        assert_eq!(split(token(17, 3)), (17, 3));
        assert_eq!(split(token(u32::MAX as usize, u32::MAX)), (u32::MAX as usize, u32::MAX));
    }
}
