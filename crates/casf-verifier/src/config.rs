//! Environment configuration.
//!
//! Everything is read once at startup. `PG_DSN` is the only required
//! variable; the rest default to the values baked into the deployment
//! manifests.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("{0} env var is required")]
    Missing(&'static str),

    /// A variable is present but unparseable.
    #[error("{name} has invalid value {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres DSN for the audit trail.
    pub pg_dsn: String,
    /// Redis URL for anti-replay records and rate-limit counters.
    pub redis_url: String,
    /// Base URL of the external policy engine.
    pub opa_url: String,
    /// Whether the anti-replay gate is active.
    pub anti_replay_enabled: bool,
    /// TTL of anti-replay records.
    pub anti_replay_ttl: Duration,
    /// SMS-per-patient limit within one window.
    pub sms_rate_limit: u64,
    /// SMS rate-limit window.
    pub sms_rate_window: Duration,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `PG_DSN` is absent or a value fails to
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pg_dsn: env::var("PG_DSN").map_err(|_| ConfigError::Missing("PG_DSN"))?,
            redis_url: var_or("REDIS_URL", "redis://redis:6379/0"),
            opa_url: var_or("OPA_URL", "http://opa:8181"),
            anti_replay_enabled: parse_bool(&var_or("ANTI_REPLAY_ENABLED", "true")),
            anti_replay_ttl: Duration::from_secs(parse_u64(
                "ANTI_REPLAY_TTL_SECONDS",
                &var_or("ANTI_REPLAY_TTL_SECONDS", "86400"),
            )?),
            sms_rate_limit: parse_u64("SMS_RATE_LIMIT", &var_or("SMS_RATE_LIMIT", "1"))?,
            sms_rate_window: Duration::from_secs(parse_u64(
                "SMS_RATE_WINDOW_S",
                &var_or("SMS_RATE_WINDOW_S", "3600"),
            )?),
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_u64(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_truthy_forms() {
        for v in ["1", "true", "TRUE", "yes", "Yes"] {
            assert!(parse_bool(v), "{v} should be truthy");
        }
        for v in ["0", "false", "no", "off", ""] {
            assert!(!parse_bool(v), "{v} should be falsy");
        }
    }

    #[test]
    fn u64_parsing_rejects_garbage() {
        assert_eq!(parse_u64("X", "3600").unwrap(), 3600);
        assert!(parse_u64("X", "an hour").is_err());
    }
}
