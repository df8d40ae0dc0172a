//! Errors surfaced through a future's failure channel.
//!
//! Every terminal outcome is shared between all listeners of a future, so
//! [Error] is cheap to clone: OS errors are reference counted and the
//! frequently raised kinds, such as [Error::Closed], are unit variants that
//! never allocate.
use std::{io, sync::Arc};

use thiserror::Error;

/// Result alias used by the blocking accessors of [crate::futures::Future].
pub type Result<T> = std::result::Result<T, Error>;

/// The error type of this crate.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The future was voluntarily abandoned.
    #[error("operation was cancelled")]
    Cancelled,

    /// The channel was closed while the operation was outstanding, or the
    /// operation was issued on an already closed channel.
    #[error("channel closed")]
    Closed,

    /// A blocking wait gave up before the future reached a terminal state.
    #[error("timed out waiting for completion")]
    Timeout,

    /// A read was issued while another read is still outstanding on the same
    /// channel.
    #[error("a read is already outstanding on this channel")]
    ReadPending,

    /// A blocking wait was attempted on the reactor thread.
    #[error("blocking wait attempted on the reactor thread")]
    ReactorThread,

    /// The executor refused to accept a job, typically because it has been
    /// shut down.
    #[error("executor rejected the job")]
    Rejected,

    /// An application level failure.
    #[error("{0}")]
    Failed(Arc<str>),

    /// A syscall failed.
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl Error {
    /// Build an application level failure from a message.
    pub fn failed(msg: impl Into<Arc<str>>) -> Self {
        Self::Failed(msg.into())
    }

    /// Returns true if this is the cancellation marker rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<io::ErrorKind> for Error {
    fn from(value: io::ErrorKind) -> Self {
        Self::Io(Arc::new(value.into()))
    }
}
