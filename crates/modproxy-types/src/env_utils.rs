//! Environment variable parsing utilities.
//!
//! Configuration values can be overridden through `MODPROXY_*` variables.
//! These helpers remove the repeated
//!
//! ```ignore
//! std::env::var("VAR_NAME")
//!     .ok()
//!     .and_then(|v| v.parse::<u64>().ok())
//!     .unwrap_or(default_value)
//! ```
//!
//! # Example
//!
//! ```
//! use modproxy_types::env_utils::{env_var, env_var_or};
//!
//! let timeout: u64 = env_var_or("MODPROXY_TIMEOUT_SECS", 300);
//! let custom: Option<u64> = env_var("MODPROXY_CUSTOM_VALUE");
//! ```

use std::str::FromStr;

/// Parse an environment variable into a type that implements `FromStr`.
///
/// Returns `None` if the variable is not set or cannot be parsed.
pub fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Parse an environment variable with a default value.
pub fn env_var_or<T: FromStr>(key: &str, default: T) -> T {
    env_var(key).unwrap_or(default)
}

/// Whether a flag value is truthy: "1", "true", "yes" or "on",
/// case-insensitive and ignoring surrounding whitespace.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Non-empty string value of an environment variable.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
