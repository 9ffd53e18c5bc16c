//! Environment variable overrides
//!
//! Typed lookups with defaults, used by `EngineConfig::from_env()`.
//! A variable that is unset or fails to parse yields the default.
//!
//! # Usage
//!
//! ```ignore
//! use dio_core::env::{env_get, env_get_ms};
//!
//! let depth: u32 = env_get("DIO_MAX_CONCURRENT", 128);
//! let grace = env_get_ms("DIO_SHUTDOWN_GRACE_MS", Duration::from_millis(500));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if set and valid.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Millisecond count as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
