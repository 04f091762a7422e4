//! Environment variable parsing utilities
//!
//! Lenient helpers fall back to the default on a missing or unparsable value;
//! strict helpers only fall back when the variable is missing.

use std::str::FromStr;

/// Parse an environment variable with a default fallback
///
/// # Example
/// ```ignore
/// let max: u32 = parse_env_with_default("DB_MAX_CONNECTIONS", 20);
/// ```
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse an environment variable, using `default` only when it is unset or empty.
///
/// A present but unparsable value is an error.
pub fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| format!("Failed to parse environment variable {}={:?}", key, raw)),
        _ => Ok(default),
    }
}

/// Parse a required environment variable
///
/// # Example
/// ```ignore
/// let database_url = parse_env_required::<String>("DATABASE_URL")?;
/// ```
pub fn parse_env_required<T: FromStr>(key: &str) -> Result<T, String> {
    std::env::var(key)
        .map_err(|_| format!("Environment variable {} not found", key))?
        .parse()
        .map_err(|_| format!("Failed to parse environment variable {}", key))
}
