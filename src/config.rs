//! Runtime configuration for raw discovery capture.

use std::time::Duration;

/// Environment variable that turns raw capture off entirely.
pub const DISABLE_ENV: &str = "RAWDISCO_DEBUG_DISABLE";

/// How long the self-test waits for its probe to come back.
pub const SELF_TEST_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Refuse to open raw sockets at all.
    pub disabled: bool,
    /// Deadline for observing the self-test probe, shared across retries.
    pub self_test_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disabled: false,
            self_test_timeout: SELF_TEST_TIMEOUT,
        }
    }
}

impl Config {
    /// Defaults, with `disabled` taken from [`DISABLE_ENV`].
    pub fn from_env() -> Self {
        let disabled = match std::env::var(DISABLE_ENV) {
            Ok(v) => parse_bool(&v).unwrap_or_else(|| {
                log::warn!("ignoring {DISABLE_ENV}={v:?}: not a boolean");
                false
            }),
            Err(_) => false,
        };
        Self {
            disabled,
            ..Self::default()
        }
    }
}

/// Parse a boolean knob value; `None` if it is not recognizable.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert!(!c.disabled);
        assert_eq!(c.self_test_timeout, Duration::from_millis(100));
    }

    #[test]
    fn parse_bool_truthy() {
        for s in ["1", "true", "TRUE", " yes ", "On", "t"] {
            assert_eq!(parse_bool(s), Some(true), "{s:?}");
        }
    }

    #[test]
    fn parse_bool_falsy() {
        for s in ["0", "false", "No", "off", "", "F"] {
            assert_eq!(parse_bool(s), Some(false), "{s:?}");
        }
    }

    #[test]
    fn parse_bool_garbage() {
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool("2"), None);
    }
}
