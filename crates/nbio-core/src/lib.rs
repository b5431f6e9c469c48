//! # nbio-core
//!
//! Core types for the nbio non-blocking runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The OS-facing pieces (worker threads, timerfd, epoll, sockets) live
//! in `nbio-runtime` and `nbio-net`.
//!
//! ## Modules
//!
//! - `routine` - One-shot work items, the unit of dispatch
//! - `queue` - FIFO work queue with spin-then-block pop
//! - `buffer` - Contiguous byte buffer with cut-from-front
//! - `perf` - Counters and stopwatch for benchmark reporting
//! - `error` - Error types
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod routine;
pub mod queue;
pub mod buffer;
pub mod perf;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use routine::Routine;
pub use queue::WorkQueue;
pub use buffer::IoBuffer;
pub use perf::{PerfCounter, Stopwatch};
pub use error::{CoreError, CoreResult};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
