//! Connections and listeners driven by a [crate::reactor::Reactor].
//!
//! A [Server] is obtained from [crate::reactor::Reactor::bind] and a
//! [Channel] either from the connection handler of a server or from
//! [crate::reactor::Reactor::connect]. All channel operations return a
//! [crate::futures::Future] and never block: the reactor thread watches the
//! socket, and the actual `recv`/`send` calls happen on the reactor's worker
//! executor once the socket is ready.
//!
//! Buffers are lent to a channel through a [BufferSupplier]; a `Vec<u8>` is
//! the simplest supplier.
mod buffer;
mod channel;
mod server;
pub(crate) mod sock_addr;
pub(crate) mod socket;

pub use buffer::BufferSupplier;
pub use channel::Channel;
pub(crate) use channel::ChannelInner;
pub use server::Server;
pub(crate) use server::ServerInner;
