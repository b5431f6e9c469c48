//! Error types for the transport

use core::fmt;
use std::os::unix::io::RawFd;

/// Result type for transport operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors surfaced by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Write backlog at its limit; the write was not enqueued
    Busy,

    /// fd already registered with this event loop
    AlreadyRegistered(RawFd),

    /// fd not registered with this event loop
    NotRegistered(RawFd),

    /// Syscall failed with the given errno
    Io(i32),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Busy => write!(f, "write backlog full"),
            NetError::AlreadyRegistered(fd) => write!(f, "fd {} already registered", fd),
            NetError::NotRegistered(fd) => write!(f, "fd {} not registered", fd),
            NetError::Io(code) => write!(f, "io error: errno {}", code),
        }
    }
}

impl std::error::Error for NetError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", NetError::Busy), "write backlog full");
        assert_eq!(format!("{}", NetError::Io(104)), "io error: errno 104");
    }
}
