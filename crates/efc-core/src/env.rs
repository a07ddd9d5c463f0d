//! Environment variable utilities
//!
//! Every tunable in EFC is read from an `EFC_*` variable through these
//! helpers, falling back to a compiled default when the variable is unset
//! or does not parse.
//!
//! ```ignore
//! use efc_core::env::{env_get, env_get_bool};
//!
//! let max_events: usize = env_get("EFC_SELECTOR_MAX_EVENTS", 1024);
//! let verbose = env_get_bool("EFC_VERBOSE", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Read `key` as a boolean.
///
/// "1", "true", "yes" and "on" (any case) are true; "0", "false", "no"
/// and "off" are false. Anything else, including unset, yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// `Some(T)` when `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// True when `key` is present, whatever its value.
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNSET: &str = "__EFC_TEST_UNSET_VAR__";

    #[test]
    fn test_defaults_when_unset() {
        let n: usize = env_get(UNSET, 42);
        assert_eq!(n, 42);
        assert!(env_get_bool(UNSET, true));
        assert!(env_get_opt::<u64>(UNSET).is_none());
        assert_eq!(env_get_str(UNSET, "fallback"), "fallback");
        assert!(!env_is_set(UNSET));
    }

    #[test]
    fn test_parse_set_value() {
        std::env::set_var("__EFC_TEST_NUM__", " 8192 ");
        let n: usize = env_get("__EFC_TEST_NUM__", 0);
        assert_eq!(n, 8192);
        std::env::remove_var("__EFC_TEST_NUM__");
    }

    #[test]
    fn test_unparsable_falls_back() {
        std::env::set_var("__EFC_TEST_BAD__", "many");
        let n: u32 = env_get("__EFC_TEST_BAD__", 7);
        assert_eq!(n, 7);
        std::env::remove_var("__EFC_TEST_BAD__");
    }

    #[test]
    fn test_bool_spellings() {
        for (raw, want) in [("YES", true), ("on", true), ("0", false), ("Off", false)] {
            std::env::set_var("__EFC_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__EFC_TEST_BOOL__", !want), want, "{}", raw);
        }
        std::env::set_var("__EFC_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__EFC_TEST_BOOL__", true));
        std::env::remove_var("__EFC_TEST_BOOL__");
    }
}
