use std::fmt;
use std::io;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Normalized error taxonomy for socket and readiness operations.
///
/// OS errors are classified at the call site, immediately after the failing
/// syscall; callers never re-read `errno` once control has left the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A non-blocking operation made no progress. Wait for the next
    /// readiness event and retry.
    WouldBlock,
    /// The system call was interrupted by a signal. Retry locally.
    Interrupted,
    /// A configured timeout expired.
    TimedOut,
    /// The remote side shut down in an orderly fashion (read returned 0).
    PeerClosed,
    /// A write hit a connection the remote already closed.
    BrokenPipe,
    /// File table full or memory pressure. Back off or reject.
    ResourceExhausted,
    /// Bad address, bad descriptor, or an otherwise invalid request.
    InvalidArgument,
    /// Any other OS error, carrying the native errno.
    Os(i32),
}

impl Error {
    /// Classify a raw errno value into the taxonomy.
    pub fn from_errno(errno: i32) -> Self {
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return Error::WouldBlock;
        }
        match errno {
            libc::EINTR => Error::Interrupted,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::EPIPE | libc::ECONNRESET => Error::BrokenPipe,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                Error::ResourceExhausted
            }
            libc::EINVAL | libc::EBADF | libc::EFAULT | libc::EAFNOSUPPORT => {
                Error::InvalidArgument
            }
            other => Error::Os(other),
        }
    }

    /// Capture and classify the calling thread's current OS error.
    pub fn last_os() -> Self {
        Self::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Whether retrying locally may succeed without any state change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::WouldBlock | Error::Interrupted | Error::TimedOut
        )
    }

    /// The native errno behind this error, when one is known.
    pub fn raw_os(&self) -> Option<i32> {
        match self {
            Error::Os(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Interrupted => write!(f, "interrupted system call"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::PeerClosed => write!(f, "peer closed the connection"),
            Error::BrokenPipe => write!(f, "broken pipe"),
            Error::ResourceExhausted => write!(f, "resource exhausted"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Os(code) => {
                write!(f, "os error: {}", io::Error::from_raw_os_error(*code))
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if let Some(errno) = e.raw_os_error() {
            return Error::from_errno(errno);
        }
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            io::ErrorKind::UnexpectedEof => Error::PeerClosed,
            io::ErrorKind::InvalidInput => Error::InvalidArgument,
            _ => Error::Os(0),
        }
    }
}
