use std::fmt;
use std::io;

/// Outcome of one transport-level operation.
///
/// Flow-control states (`Retry`, `Closed`…) are ordinary values here, not
/// `Err`s: the engine branches on them in its hot paths and nothing at this
/// layer ever panics or raises. Genuine faults carry the classified variant
/// so callers can decide between retrying, closing and reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NetResult {
    /// The operation completed.
    Ok,
    /// The non-blocking call would have blocked. Try again after the next
    /// readiness notification.
    Retry,
    /// The slot no longer holds a socket.
    NoSocket,
    /// Lookup by tag or handle found nothing.
    NotFound,
    NotImplemented,
    /// Peer closed the stream gracefully.
    Closed,
    Fatal,
    Unknown,
    /// Process or system descriptor table is exhausted.
    TooManyConnections,
    Refused,
    ConnectTimeout,
}

impl NetResult {
    /// Classify an OS error from a send/recv/accept call.
    pub fn from_error(err: &io::Error) -> NetResult {
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => NetResult::Retry,
            #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on Linux
            Some(libc::EWOULDBLOCK) => NetResult::Retry,
            Some(libc::ECONNRESET) | Some(libc::EPIPE) => NetResult::Closed,
            Some(libc::EMFILE) | Some(libc::ENFILE) => NetResult::TooManyConnections,
            Some(libc::ECONNREFUSED) => NetResult::Refused,
            Some(libc::ETIMEDOUT) => NetResult::ConnectTimeout,
            Some(_) => NetResult::Fatal,
            None => NetResult::Unknown,
        }
    }

    pub fn is_ok(self) -> bool {
        self == NetResult::Ok
    }

    /// True for outcomes that leave the connection usable.
    pub fn is_recoverable(self) -> bool {
        matches!(self, NetResult::Ok | NetResult::Retry)
    }
}

impl fmt::Display for NetResult {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

#[cfg(test)]
mod tests {
    use super::NetResult;
    use std::io::Error;

    #[test]
    fn errno_classification() {
        let cases = [
            (libc::EAGAIN, NetResult::Retry),
            (libc::EINTR, NetResult::Retry),
            (libc::ECONNRESET, NetResult::Closed),
            (libc::EPIPE, NetResult::Closed),
            (libc::EMFILE, NetResult::TooManyConnections),
            (libc::ENFILE, NetResult::TooManyConnections),
            (libc::ECONNREFUSED, NetResult::Refused),
            (libc::EFAULT, NetResult::Fatal),
        ];

        for (errno, expected) in cases {
            let got = NetResult::from_error(&Error::from_raw_os_error(errno));
            assert_eq!(got, expected, "errno {}", errno);
        }
    }

    #[test]
    fn recoverable() {
        assert!(NetResult::Ok.is_recoverable());
        assert!(NetResult::Retry.is_recoverable());
        assert!(!NetResult::Closed.is_recoverable());
        assert!(!NetResult::Fatal.is_recoverable());
    }
}
