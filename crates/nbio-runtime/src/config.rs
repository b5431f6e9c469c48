//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables
//! 3. Library defaults

use nbio_core::env::env_get;
use nbio_core::queue::DEFAULT_SPIN_ITERS;

/// Library defaults
pub mod defaults {
    /// Worker threads when unspecified
    pub const NUM_WORKERS: usize = 4;

    /// Queue pop spin budget before blocking
    pub const SPIN_ITERS: u32 = super::DEFAULT_SPIN_ITERS;
}

/// Runtime configuration with builder pattern.
///
/// Use `from_env()` to start from defaults with environment overrides
/// applied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Queue pop spin budget before blocking on the condvar
    pub spin_iters: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `NBIO_NUM_WORKERS` - worker thread count
    /// - `NBIO_SPIN_ITERS` - pop spin budget
    ///
    /// The net layer reads its own knobs (`NBIO_EPOLL_EVENTS`,
    /// `NBIO_WRITE_BACKLOG`) at construction time.
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("NBIO_NUM_WORKERS", defaults::NUM_WORKERS),
            spin_iters: env_get("NBIO_SPIN_ITERS", defaults::SPIN_ITERS as usize) as u32,
        }
    }

    /// Pure library defaults, no environment override. Useful in tests.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            spin_iters: defaults::SPIN_ITERS,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn spin_iters(mut self, n: u32) -> Self {
        self.spin_iters = n;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > crate::num_cores() {
            return Err(ConfigError::InvalidValue(
                "num_workers must not exceed online CPU count",
            ));
        }
        Ok(())
    }

    /// Print the configuration (for debugging).
    pub fn print(&self) {
        eprintln!("nbio configuration:");
        eprintln!("  num_workers:  {}", self.num_workers);
        eprintln!("  spin_iters:   {}", self.spin_iters);
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = RuntimeConfig::new().num_workers(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new().num_workers(2).spin_iters(16);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.spin_iters, 16);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = RuntimeConfig::new().num_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_oversubscription() {
        let config = RuntimeConfig::new().num_workers(crate::num_cores() + 1);
        assert!(config.validate().is_err());
    }
}
