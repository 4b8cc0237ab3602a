//! Error types for ringsock operations
//!
//! Every suspension point reports failures through [`SockError`].
//! Kernel results arrive as negative errno values; [`SockError::from_errno`]
//! maps the ones with a defined meaning and keeps the rest as `Os`.

use core::fmt;

/// Result type for socket operations
pub type SockResult<T> = Result<T, SockError>;

/// Errors that can occur on a socket or ring operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockError {
    /// Name lookup failed
    UnknownHost,

    /// Kernel reported ECONNREFUSED on connect
    ConnectionRefused,

    /// Deadline expired before the operation completed
    TimedOut,

    /// Peer closed gracefully, explicit local close, or use after close
    Closed,

    /// Peer reset the connection (ECONNRESET / EPIPE)
    Reset,

    /// Submission queue was full past the configured retries
    QueueFull,

    /// The suspended operation was cancelled
    Cancelled,

    /// The ring was torn down while the operation was pending
    Shutdown,

    /// TLS engine error during the handshake phase
    TlsHandshakeFailed(String),

    /// Structural TLS error on an established stream
    TlsRecord(String),

    /// Invalid configuration (unreadable CA bundle, bad port, ...)
    Configuration(String),

    /// Unmapped OS error (raw errno)
    Os(i32),
}

impl SockError {
    /// Map a (positive) errno value to the taxonomy.
    ///
    /// Callers submit the absolute value of a negative kernel result.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECONNREFUSED => SockError::ConnectionRefused,
            libc::ECONNRESET | libc::EPIPE => SockError::Reset,
            libc::ETIMEDOUT => SockError::TimedOut,
            libc::ECANCELED => SockError::Cancelled,
            libc::EBADF | libc::ENOTCONN => SockError::Closed,
            other => SockError::Os(other),
        }
    }

    /// Map a raw kernel completion result (`< 0` means `-errno`).
    ///
    /// Non-negative results are not errors and panic in debug builds.
    pub fn from_raw_result(res: i32) -> Self {
        debug_assert!(res < 0, "from_raw_result on non-error result {res}");
        Self::from_errno(-res)
    }

    /// True for errors that leave the socket unusable.
    ///
    /// A full submission queue is the one transient failure: the socket
    /// itself is untouched and the caller may retry.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SockError::QueueFull)
    }
}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockError::UnknownHost => write!(f, "unknown host"),
            SockError::ConnectionRefused => write!(f, "connection refused"),
            SockError::TimedOut => write!(f, "operation timed out"),
            SockError::Closed => write!(f, "socket closed"),
            SockError::Reset => write!(f, "connection reset by peer"),
            SockError::QueueFull => write!(f, "submission queue full"),
            SockError::Cancelled => write!(f, "operation cancelled"),
            SockError::Shutdown => write!(f, "ring shut down"),
            SockError::TlsHandshakeFailed(detail) => {
                write!(f, "tls handshake failed: {}", detail)
            }
            SockError::TlsRecord(detail) => write!(f, "tls record error: {}", detail),
            SockError::Configuration(detail) => write!(f, "configuration error: {}", detail),
            SockError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for SockError {}

impl From<std::io::Error> for SockError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => SockError::from_errno(errno),
            None => SockError::Os(-1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", SockError::Closed), "socket closed");
        assert_eq!(
            format!("{}", SockError::TlsRecord("bad record mac".into())),
            "tls record error: bad record mac"
        );
        assert_eq!(format!("{}", SockError::Os(95)), "os error: errno 95");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            SockError::from_errno(libc::ECONNREFUSED),
            SockError::ConnectionRefused
        );
        assert_eq!(SockError::from_errno(libc::ECONNRESET), SockError::Reset);
        assert_eq!(SockError::from_errno(libc::EPIPE), SockError::Reset);
        assert_eq!(SockError::from_errno(libc::ETIMEDOUT), SockError::TimedOut);
        assert_eq!(SockError::from_errno(libc::ECANCELED), SockError::Cancelled);
        assert_eq!(SockError::from_errno(libc::EBADF), SockError::Closed);
        assert_eq!(SockError::from_errno(libc::ENOENT), SockError::Os(libc::ENOENT));
    }

    #[test]
    fn test_raw_result_mapping() {
        assert_eq!(
            SockError::from_raw_result(-libc::ECONNRESET),
            SockError::Reset
        );
    }

    #[test]
    fn test_fatality() {
        assert!(SockError::Closed.is_fatal());
        assert!(SockError::Shutdown.is_fatal());
        assert!(SockError::TimedOut.is_fatal());
        assert!(!SockError::QueueFull.is_fatal());
    }
}
