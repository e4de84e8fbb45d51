//! The error surface of the library.
//!
//! Every operating system error is translated into the portable [Error](enum.Error.html) set at
//! the syscall boundary, before it ever reaches a callback or a return value. A few additional
//! variants describe loop-level conditions that have no OS counterpart (like using a handle token
//! that no longer points anywhere).

use std::fmt;
use std::io;

use nix::errno::Errno;

/// A portable error code.
///
/// The first group mirrors the classic errno family, the second group describes conditions of the
/// loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// End of stream. Reading after this one requires arming the read side again.
    Eof,
    /// Resource temporarily unavailable; retry once the loop reports readiness.
    Again,
    /// Permission denied.
    Acces,
    /// Address already in use.
    AddrInUse,
    /// Address not available on this machine.
    AddrNotAvail,
    /// Bad file descriptor.
    Badf,
    /// Resource busy (also: trying to cancel work that already runs).
    Busy,
    /// The operation was canceled before it ran.
    Canceled,
    /// Connection aborted by the network stack.
    ConnAborted,
    /// Connection refused by the peer.
    ConnRefused,
    /// Connection reset by the peer.
    ConnReset,
    /// The entity already exists.
    Exist,
    /// Invalid argument or handle state for this operation.
    Inval,
    /// Out of memory.
    Nomem,
    /// The socket is not connected.
    NotConn,
    /// The function is not implemented.
    Nosys,
    /// The operation is not supported here.
    Notsup,
    /// Broken pipe.
    Pipe,
    /// No such process.
    Srch,
    /// The operation timed out.
    TimedOut,
    /// The stream was already shut down.
    Shutdown,
    /// The handle token does not point to a live handle (it was closed, or never existed).
    Missing,
    /// A background task panicked instead of producing a result.
    BackgroundPanicked,
    /// The loop this sender belonged to is gone.
    LoopGone,
    /// An OS error with no portable translation; the raw errno value is kept.
    Unknown(i32),
}

impl Error {
    /// Translate a raw errno value.
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN => Error::Again,
            Errno::EACCES | Errno::EPERM => Error::Acces,
            Errno::EADDRINUSE => Error::AddrInUse,
            Errno::EADDRNOTAVAIL => Error::AddrNotAvail,
            Errno::EBADF => Error::Badf,
            Errno::EBUSY => Error::Busy,
            Errno::ECANCELED => Error::Canceled,
            Errno::ECONNABORTED => Error::ConnAborted,
            Errno::ECONNREFUSED => Error::ConnRefused,
            Errno::ECONNRESET => Error::ConnReset,
            Errno::EEXIST => Error::Exist,
            Errno::EINVAL => Error::Inval,
            Errno::ENOMEM => Error::Nomem,
            Errno::ENOTCONN => Error::NotConn,
            Errno::ENOSYS => Error::Nosys,
            Errno::ENOTSUP => Error::Notsup,
            Errno::EPIPE => Error::Pipe,
            Errno::ESRCH => Error::Srch,
            Errno::ETIMEDOUT => Error::TimedOut,
            Errno::ESHUTDOWN => Error::Shutdown,
            other => Error::Unknown(other as i32),
        }
    }

    /// Translate the current value of `errno`.
    pub(crate) fn last_os() -> Self {
        Error::from_errno(Errno::last())
    }

    /// A short symbolic name, errno style.
    pub fn name(&self) -> &'static str {
        match *self {
            Error::Eof => "EOF",
            Error::Again => "EAGAIN",
            Error::Acces => "EACCES",
            Error::AddrInUse => "EADDRINUSE",
            Error::AddrNotAvail => "EADDRNOTAVAIL",
            Error::Badf => "EBADF",
            Error::Busy => "EBUSY",
            Error::Canceled => "ECANCELED",
            Error::ConnAborted => "ECONNABORTED",
            Error::ConnRefused => "ECONNREFUSED",
            Error::ConnReset => "ECONNRESET",
            Error::Exist => "EEXIST",
            Error::Inval => "EINVAL",
            Error::Nomem => "ENOMEM",
            Error::NotConn => "ENOTCONN",
            Error::Nosys => "ENOSYS",
            Error::Notsup => "ENOTSUP",
            Error::Pipe => "EPIPE",
            Error::Srch => "ESRCH",
            Error::TimedOut => "ETIMEDOUT",
            Error::Shutdown => "ESHUTDOWN",
            Error::Missing => "MISSING",
            Error::BackgroundPanicked => "BACKGROUND_PANICKED",
            Error::LoopGone => "LOOP_GONE",
            Error::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(raw) => Error::from_errno(Errno::from_raw(raw)),
            None => match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::Eof,
                io::ErrorKind::WouldBlock => Error::Again,
                io::ErrorKind::TimedOut => Error::TimedOut,
                _ => Error::Unknown(0),
            },
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::from_errno(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Eof => write!(f, "end of stream"),
            Error::Missing => write!(f, "no such handle"),
            Error::BackgroundPanicked => write!(f, "background task panicked"),
            Error::LoopGone => write!(f, "the event loop is gone"),
            Error::Unknown(raw) => write!(f, "unknown OS error {}", raw),
            other => write!(f, "{}", other.name()),
        }
    }
}

impl std::error::Error for Error {}

/// A result of library operations that may fail.
pub type Result<T> = std::result::Result<T, Error>;

/// Abort after an unrecoverable kernel inconsistency.
///
/// This is reserved for situations where the poller itself misbehaves and no sensible recovery
/// exists; expected runtime errors always travel as [Error](enum.Error.html) values instead.
pub(crate) fn fatal_error(err: io::Error, symbol: &str) -> ! {
    eprintln!("zmij: fatal error in {}: {}", symbol, err);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_translation() {
        assert_eq!(Error::Again, Error::from_errno(Errno::EAGAIN));
        assert_eq!(Error::ConnReset, Error::from_errno(Errno::ECONNRESET));
        assert_eq!(Error::Unknown(Errno::EXDEV as i32), Error::from_errno(Errno::EXDEV));
    }

    #[test]
    fn io_translation() {
        let e = io::Error::from_raw_os_error(libc::EPIPE);
        assert_eq!(Error::Pipe, Error::from(e));
    }
}
