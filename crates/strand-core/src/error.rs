//! Error taxonomy for the I/O core.
//!
//! A single enum covers every failure the core can deliver through a
//! callback or a failure chunk:
//!
//! - `Closed` — the endpoint is gone (locally or by peer). Fatal.
//! - `Timeout` — an idle deadline fired. The only *transient* kind:
//!   the owner may re-arm and keep going.
//! - `Io` — an OS-level read/write error. Fatal, preserves the kind.
//! - `Protocol` — the peer sent bytes a connection could not accept.
//!   Signalled by connections, never by the core itself.
//! - `Usage` — a contract violation (overlapping reads/writes, a second
//!   pending demand). Programmer error, fails the offending call.
//!
//! Errors are `Clone` so a terminal failure can be replayed by every
//! subsequent `read()` on a failed source.

use std::fmt;
use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrandError {
    /// Endpoint closed; all pending and future operations fail with this.
    Closed,
    /// Idle deadline reached. Transient: the owner decides what happens.
    Timeout,
    /// OS-level I/O error.
    Io(io::ErrorKind),
    /// Invalid bytes from the peer, as judged by a connection.
    Protocol(&'static str),
    /// Contract violation by the caller.
    Usage(&'static str),
}

impl StrandError {
    /// Whether the owner may recover and continue using the endpoint or
    /// source. Only `Timeout` qualifies.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Timeout => write!(f, "idle timeout"),
            Self::Io(kind) => write!(f, "i/o error: {}", kind),
            Self::Protocol(what) => write!(f, "protocol error: {}", what),
            Self::Usage(what) => write!(f, "usage error: {}", what),
        }
    }
}

impl std::error::Error for StrandError {}

impl From<io::Error> for StrandError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::Closed,
            kind => Self::Io(kind),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient() {
        assert!(StrandError::Timeout.is_transient());
        assert!(!StrandError::Closed.is_transient());
        assert!(!StrandError::Io(io::ErrorKind::Other).is_transient());
        assert!(!StrandError::Usage("x").is_transient());
    }

    #[test]
    fn test_from_io() {
        let e = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(StrandError::from(e), StrandError::Closed);

        let e = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            StrandError::from(e),
            StrandError::Io(io::ErrorKind::PermissionDenied)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(StrandError::Closed.to_string(), "closed");
        assert_eq!(
            StrandError::Usage("write pending").to_string(),
            "usage error: write pending"
        );
    }
}
