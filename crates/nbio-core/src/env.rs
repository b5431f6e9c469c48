//! Environment variable helpers
//!
//! Every runtime knob (`NBIO_NUM_WORKERS`, `NBIO_WRITE_BACKLOG`,
//! `NBIO_LOG_LEVEL`, ...) is read through one trim-then-parse path:
//! unset or malformed values fall back to the caller's default rather
//! than erroring, so a stray `NBIO_SPIN_ITERS=banana` can't take the
//! process down.
//!
//! ```ignore
//! use nbio_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("NBIO_NUM_WORKERS", 4);
//! let debug: bool = env_get_bool("NBIO_DEBUG", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T` if it is set and well formed. Surrounding
/// whitespace is ignored.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = std::env::var(key).ok()?;
    raw.trim().parse().ok()
}

/// Parse `key` as `T`, falling back to `default` when the variable is
/// unset or does not parse.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean knob. "1"/"true"/"yes"/"on" switch on, "0"/"false"/"no"/
/// "off" switch off (any case); anything else keeps the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    let raw = match std::env::var(key) {
        Ok(raw) => raw,
        Err(_) => return default,
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// String knob. An empty value counts as unset.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

/// Whether the variable is present at all, whatever its contents.
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_yields_default() {
        let val: usize = env_get("__NBIO_ENV_UNSET__", 42);
        assert_eq!(val, 42);
        let opt: Option<u16> = env_get_opt("__NBIO_ENV_UNSET__");
        assert!(opt.is_none());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        std::env::set_var("__NBIO_ENV_NUM__", "  123 ");
        let val: usize = env_get("__NBIO_ENV_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__NBIO_ENV_NUM__");
    }

    #[test]
    fn test_malformed_yields_default() {
        std::env::set_var("__NBIO_ENV_BAD__", "banana");
        let val: usize = env_get("__NBIO_ENV_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__NBIO_ENV_BAD__");
    }

    #[test]
    fn test_bool_vocabulary() {
        std::env::set_var("__NBIO_ENV_BOOL__", "Yes");
        assert!(env_get_bool("__NBIO_ENV_BOOL__", false));

        std::env::set_var("__NBIO_ENV_BOOL__", "off");
        assert!(!env_get_bool("__NBIO_ENV_BOOL__", true));

        // Unrecognized text keeps the default instead of guessing.
        std::env::set_var("__NBIO_ENV_BOOL__", "maybe");
        assert!(env_get_bool("__NBIO_ENV_BOOL__", true));
        assert!(!env_get_bool("__NBIO_ENV_BOOL__", false));

        std::env::remove_var("__NBIO_ENV_BOOL__");
        assert!(env_get_bool("__NBIO_ENV_BOOL__", true));
    }

    #[test]
    fn test_str_empty_counts_as_unset() {
        std::env::set_var("__NBIO_ENV_STR__", "");
        assert_eq!(env_get_str("__NBIO_ENV_STR__", "fallback"), "fallback");

        std::env::set_var("__NBIO_ENV_STR__", "value");
        assert_eq!(env_get_str("__NBIO_ENV_STR__", "fallback"), "value");
        std::env::remove_var("__NBIO_ENV_STR__");
    }

    #[test]
    fn test_is_set_ignores_contents() {
        assert!(!env_is_set("__NBIO_ENV_UNSET__"));
        std::env::set_var("__NBIO_ENV_PRESENT__", "");
        assert!(env_is_set("__NBIO_ENV_PRESENT__"));
        std::env::remove_var("__NBIO_ENV_PRESENT__");
    }
}
