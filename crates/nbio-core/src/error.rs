//! Error types for the core primitives

use core::fmt;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the core primitives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A bounded queue or backlog is at capacity
    Busy,

    /// Operation attempted on a component that was shut down
    ShutDown,

    /// Platform call failed with the given errno
    Platform(i32),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Busy => write!(f, "resource busy"),
            CoreError::ShutDown => write!(f, "component shut down"),
            CoreError::Platform(code) => write!(f, "platform error: errno {}", code),
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CoreError::Busy), "resource busy");
        assert_eq!(
            format!("{}", CoreError::Platform(11)),
            "platform error: errno 11"
        );
    }
}
