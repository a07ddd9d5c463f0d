//! Error types shared by all EFC crates
//!
//! Categories:
//! - precondition failures (bad argument, bad index, wrong state)
//! - resource failures (I/O, closed channels, unreachable peers)
//! - timing and cancellation (timeouts, cancelled futures, interrupts)
//! - format violations (BSON framing, numeric conversions)
//!
//! `Error` is `Clone` so a completed future can hand the same outcome to
//! every caller of `get()`.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for EFC operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    // ── Precondition failures ──
    #[error("null pointer: {0}")]
    NullPointer(String),

    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal thread state: {0}")]
    IllegalThreadState(String),

    /// Unlock or condition wait by a thread that does not own the lock
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(String),

    // ── Resource failures ──
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("channel is closed")]
    ClosedChannel,

    #[error("channel is not open for reading")]
    NonReadableChannel,

    #[error("channel is not open for writing")]
    NonWritableChannel,

    /// Another thread closed the channel while this one was blocked on it
    #[error("channel closed asynchronously")]
    AsynchronousClose,

    /// The blocked thread was interrupted; the channel is now closed
    #[error("channel closed by interrupt")]
    ClosedByInterrupt,

    /// ICMP port unreachable on a connected datagram socket
    #[error("port unreachable")]
    PortUnreachable,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("selector is closed")]
    ClosedSelector,

    #[error("illegal blocking mode")]
    IllegalBlockingMode,

    #[error("channel is registered with another selector")]
    IllegalSelector,

    #[error("selection key is cancelled")]
    CancelledKey,

    #[error("overlapping file lock")]
    OverlappingFileLock,

    #[error("socket is not connected")]
    NotYetConnected,

    #[error("socket is already connected")]
    AlreadyConnected,

    #[error("connection is pending")]
    ConnectionPending,

    #[error("no connection is pending")]
    NoConnectionPending,

    // ── Buffer failures ──
    #[error("buffer overflow")]
    BufferOverflow,

    #[error("buffer underflow")]
    BufferUnderflow,

    #[error("buffer is read-only")]
    ReadOnlyBuffer,

    #[error("mark is not set")]
    InvalidMark,

    // ── Timing and cancellation ──
    #[error("operation timed out")]
    Timeout,

    #[error("task was cancelled")]
    Cancellation,

    #[error("thread interrupted")]
    Interrupted,

    /// A task body failed; the cause is what the body returned or the panic it raised
    #[error("execution failed: {0}")]
    Execution(Box<Error>),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("task rejected: {0}")]
    RejectedExecution(String),

    // ── Format violations ──
    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("number format error: {0}")]
    NumberFormat(String),

    #[error("no such element: {0}")]
    NoSuchElement(String),
}

impl Error {
    pub fn null_pointer(what: impl Into<String>) -> Self {
        Error::NullPointer(what.into())
    }

    pub fn index_out_of_bounds(what: impl Into<String>) -> Self {
        Error::IndexOutOfBounds(what.into())
    }

    pub fn illegal_state(what: impl Into<String>) -> Self {
        Error::IllegalState(what.into())
    }

    pub fn illegal_argument(what: impl Into<String>) -> Self {
        Error::IllegalArgument(what.into())
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Error::Unsupported(what.into())
    }

    pub fn data_format(what: impl Into<String>) -> Self {
        Error::DataFormat(what.into())
    }

    pub fn number_format(what: impl Into<String>) -> Self {
        Error::NumberFormat(what.into())
    }

    /// Wrap a task failure the way `Future::get` reports it.
    pub fn execution(cause: Error) -> Self {
        Error::Execution(Box::new(cause))
    }

    /// Build an `Io` error from an errno value.
    pub fn from_errno(errno: i32) -> Self {
        Error::Io(Arc::new(io::Error::from_raw_os_error(errno)))
    }

    /// Capture the calling thread's current errno.
    #[cfg(unix)]
    pub fn last_os_error() -> Self {
        Self::from_errno(nix::errno::Errno::last_raw())
    }

    /// The raw OS error, when this is an `Io` error that carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// True for `Interrupted` and `ClosedByInterrupt`.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted | Error::ClosedByInterrupt)
    }

    /// The innermost cause of an `Execution` chain.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Execution(cause) => cause.root_cause(),
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => match Arc::try_unwrap(inner) {
                Ok(owned) => owned,
                Err(shared) => io::Error::new(shared.kind(), shared.to_string()),
            },
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            Error::Interrupted => io::Error::new(io::ErrorKind::Interrupted, e.to_string()),
            Error::ClosedChannel | Error::AsynchronousClose | Error::ClosedByInterrupt => {
                io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
            }
            Error::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, e.to_string()),
            Error::DataFormat(_) | Error::NumberFormat(_) => {
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            }
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
