//! Leveled stderr logging
//!
//! The runtime's log front-end: five macros (`nb_error!` .. `nb_trace!`)
//! over one emit path. Configuration lives in a single packed atomic,
//! filled from the environment the first time anything logs.
//!
//! # Environment Variables
//!
//! - `NBIO_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace
//!   (or 0..5); default info
//! - `NBIO_FLUSH_EPRINT=1` - flush stderr after every line (useful when
//!   chasing crashes)
//!
//! # Usage
//!
//! ```ignore
//! use nbio_core::{nb_info, nb_debug, nb_error};
//!
//! nb_info!("worker {} started", id);
//! nb_debug!("epoll: fd={} events={:#x}", fd, events);
//! nb_error!("bind failed: errno {}", errno);
//! ```

use crate::env::{env_get_bool, env_get_opt};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};

/// Log levels, lowest to most verbose
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

const LEVELS: [LogLevel; 6] = [
    LogLevel::Off,
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

impl LogLevel {
    /// Numeric level, clamped to the most verbose.
    pub fn from_u8(v: u8) -> Self {
        LEVELS[(v as usize).min(LEVELS.len() - 1)]
    }

    /// Accepts a level name or its digit.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Some(Self::from_u8(n));
        }
        match s.to_ascii_lowercase().as_str() {
            "off" => Some(LogLevel::Off),
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

// Packed config: level in the low bits, then the flush flag, then an
// init marker so the environment is consulted at most until the first
// explicit setting.
const LEVEL_MASK: u32 = 0b0111;
const FLUSH_BIT: u32 = 1 << 3;
const INIT_BIT: u32 = 1 << 4;

static STATE: AtomicU32 = AtomicU32::new(0);

#[inline]
fn state() -> u32 {
    let s = STATE.load(Ordering::Acquire);
    if s & INIT_BIT != 0 {
        s
    } else {
        init_state()
    }
}

/// Fill the config from the environment. Runs implicitly on first use;
/// call it early for deterministic startup. Settings applied through
/// `set_log_level`/`set_flush_enabled` beforehand win over the
/// environment.
pub fn init() {
    let _ = init_state();
}

fn init_state() -> u32 {
    let mut s = INIT_BIT | LogLevel::Info as u32;
    if let Some(level) = env_get_opt::<String>("NBIO_LOG_LEVEL").and_then(|v| LogLevel::parse(&v))
    {
        s = (s & !LEVEL_MASK) | level as u32;
    }
    if env_get_bool("NBIO_FLUSH_EPRINT", false) {
        s |= FLUSH_BIT;
    }

    // Only claim the slot if nothing configured it first.
    match STATE.compare_exchange(0, s, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => s,
        Err(current) => current | INIT_BIT,
    }
}

pub fn set_log_level(level: LogLevel) {
    let _ = STATE.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
        Some((s & !LEVEL_MASK) | INIT_BIT | level as u32)
    });
}

pub fn set_flush_enabled(enabled: bool) {
    let _ = STATE.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
        let s = s | INIT_BIT;
        Some(if enabled { s | FLUSH_BIT } else { s & !FLUSH_BIT })
    });
}

#[inline]
pub fn log_level() -> LogLevel {
    LogLevel::from_u8((state() & LEVEL_MASK) as u8)
}

#[inline]
pub fn flush_enabled() -> bool {
    state() & FLUSH_BIT != 0
}

/// Whether a line at `level` would be emitted.
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u32 <= state() & LEVEL_MASK
}

/// Internal: the single emit path behind the macros.
///
/// The whole line is rendered first and written with one call, so
/// concurrent loggers cannot interleave inside a line.
#[doc(hidden)]
pub fn emit(level: LogLevel, args: std::fmt::Arguments<'_>) {
    let s = state();
    if level as u32 > s & LEVEL_MASK {
        return;
    }

    let line = format!("[{:<5}] {}\n", level.label(), args);
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(line.as_bytes());
    if s & FLUSH_BIT != 0 {
        let _ = err.flush();
    }
}

/// Error level log (shown unless logging is off)
#[macro_export]
macro_rules! nb_error {
    ($($arg:tt)*) => {{
        $crate::kprint::emit($crate::kprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! nb_warn {
    ($($arg:tt)*) => {{
        $crate::kprint::emit($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! nb_info {
    ($($arg:tt)*) => {{
        $crate::kprint::emit($crate::kprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! nb_debug {
    ($($arg:tt)*) => {{
        $crate::kprint::emit($crate::kprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! nb_trace {
    ($($arg:tt)*) => {{
        $crate::kprint::emit($crate::kprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Off < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Trace);
    }

    #[test]
    fn test_from_u8_clamps() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(5), LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_parse_names_and_digits() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" WARN "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("2"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_set_level_gates_emission() {
        let prev = log_level();
        set_log_level(LogLevel::Warn);
        assert!(level_enabled(LogLevel::Error));
        assert!(level_enabled(LogLevel::Warn));
        assert!(!level_enabled(LogLevel::Info));
        set_log_level(prev);
    }

    #[test]
    fn test_flush_toggle() {
        let prev = flush_enabled();
        set_flush_enabled(true);
        assert!(flush_enabled());
        set_flush_enabled(prev);
    }
}
