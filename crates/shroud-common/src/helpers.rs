//! Environment helpers shared by the binaries.

use std::str::FromStr;

/// Read a boolean flag from the environment.
///
/// Accepts `1/true/yes/on` and `0/false/no/off` (case-insensitive). Anything
/// else, including an unset variable, yields `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value).unwrap_or(default),
        Err(_) => default,
    }
}

/// Read and parse a value from the environment, falling back to `default`.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
