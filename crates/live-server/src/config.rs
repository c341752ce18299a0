//! Live server configuration.
//!
//! Configuration is loaded from environment variables. Store URLs may carry
//! credentials and are redacted in Debug output.

use common::config::{ObservabilityConfig, StoreConfig};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8375";

/// Default deployment commit when none is configured.
pub const DEFAULT_COMMIT: &str = "unknown";

/// Default environment name.
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Default prefix for all channel layer keys.
pub const DEFAULT_CHANNEL_PREFIX: &str = "live:";

/// Default lifetime of a channel group membership (24 hours).
pub const DEFAULT_GROUP_EXPIRY_SECONDS: u64 = 86_400;

/// Default timeout for calls to media servers.
pub const DEFAULT_EXTERNAL_TIMEOUT_SECONDS: u64 = 10;

/// Default interval between BBB cost refreshes.
pub const DEFAULT_BBB_COST_INTERVAL_SECONDS: u64 = 60;

/// Default interval between stale room view sweeps.
pub const DEFAULT_ROOM_VIEW_CLEANUP_INTERVAL_SECONDS: u64 = 600;

/// Default log filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "live_server=debug,common=info";

/// Live server configuration.
#[derive(Clone)]
pub struct Config {
    /// Shared store shards (`REDIS_URL`, comma separated, `memory://` allowed).
    pub store: StoreConfig,

    /// HTTP/WebSocket bind address (default: "0.0.0.0:8375").
    pub bind_address: String,

    /// Deployed commit, first half of the connection label.
    pub commit: String,

    /// Environment name, second half of the connection label.
    pub environment: String,

    /// Prefix applied to every channel layer key.
    pub channel_prefix: String,

    /// Group membership expiry in seconds.
    pub group_expiry_seconds: u64,

    /// Timeout for media server API calls in seconds.
    pub external_timeout_seconds: u64,

    /// BBB cost refresh interval in seconds.
    pub bbb_cost_interval_seconds: u64,

    /// Room view cleanup interval in seconds.
    pub room_view_cleanup_interval_seconds: u64,

    /// Optional JSON file used to seed the in-memory repository.
    pub seed_file: Option<String>,

    /// Logging configuration.
    pub observability: ObservabilityConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("store", &"[REDACTED]")
            .field("store_shards", &self.store.shard_count())
            .field("bind_address", &self.bind_address)
            .field("commit", &self.commit)
            .field("environment", &self.environment)
            .field("channel_prefix", &self.channel_prefix)
            .field("group_expiry_seconds", &self.group_expiry_seconds)
            .field("external_timeout_seconds", &self.external_timeout_seconds)
            .field("bbb_cost_interval_seconds", &self.bbb_cost_interval_seconds)
            .field(
                "room_view_cleanup_interval_seconds",
                &self.room_view_cleanup_interval_seconds,
            )
            .field("seed_file", &self.seed_file)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let raw_store = vars
            .get("REDIS_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;
        let store = StoreConfig::parse(raw_store)
            .map_err(|e| ConfigError::InvalidValue(format!("REDIS_URL: {e}")))?;

        let bind_address = vars
            .get("LIVE_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let commit = vars
            .get("LIVE_COMMIT")
            .cloned()
            .unwrap_or_else(|| DEFAULT_COMMIT.to_string());

        let environment = vars
            .get("LIVE_ENVIRONMENT")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let channel_prefix = vars
            .get("LIVE_CHANNEL_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string());

        let group_expiry_seconds = parse_seconds(
            vars,
            "LIVE_GROUP_EXPIRY_SECONDS",
            DEFAULT_GROUP_EXPIRY_SECONDS,
        )?;
        let external_timeout_seconds = parse_seconds(
            vars,
            "LIVE_EXTERNAL_TIMEOUT_SECONDS",
            DEFAULT_EXTERNAL_TIMEOUT_SECONDS,
        )?;
        let bbb_cost_interval_seconds = parse_seconds(
            vars,
            "LIVE_BBB_COST_INTERVAL_SECONDS",
            DEFAULT_BBB_COST_INTERVAL_SECONDS,
        )?;
        let room_view_cleanup_interval_seconds = parse_seconds(
            vars,
            "LIVE_ROOM_VIEW_CLEANUP_INTERVAL_SECONDS",
            DEFAULT_ROOM_VIEW_CLEANUP_INTERVAL_SECONDS,
        )?;

        let seed_file = vars.get("LIVE_SEED_FILE").filter(|s| !s.is_empty()).cloned();

        let log_filter = vars
            .get("RUST_LOG")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let json_logs = vars
            .get("LIVE_LOG_JSON")
            .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));

        Ok(Config {
            store,
            bind_address,
            commit,
            environment,
            channel_prefix,
            group_expiry_seconds,
            external_timeout_seconds,
            bbb_cost_interval_seconds,
            room_view_cleanup_interval_seconds,
            seed_file,
            observability: ObservabilityConfig {
                log_filter,
                json_logs,
            },
        })
    }

    /// Label identifying this deployment in the connection registry
    /// (`{commit}.{environment}`).
    #[must_use]
    pub fn connection_label(&self) -> String {
        format!("{}.{}", self.commit, self.environment)
    }

    /// Group membership expiry.
    #[must_use]
    pub fn group_expiry(&self) -> Duration {
        Duration::from_secs(self.group_expiry_seconds)
    }

    /// Media server API timeout.
    #[must_use]
    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_seconds)
    }
}

/// Parse a positive number of seconds, falling back to a default when unset.
fn parse_seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidValue(format!(
                "{name} must be a positive integer, got '{raw}'"
            ))),
            Ok(v) => Ok(v),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "REDIS_URL".to_string(),
            "redis://:hunter2@localhost:6379".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.store.shard_count(), 1);
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.commit, DEFAULT_COMMIT);
        assert_eq!(config.environment, DEFAULT_ENVIRONMENT);
        assert_eq!(config.channel_prefix, DEFAULT_CHANNEL_PREFIX);
        assert_eq!(config.group_expiry_seconds, DEFAULT_GROUP_EXPIRY_SECONDS);
        assert_eq!(
            config.external_timeout_seconds,
            DEFAULT_EXTERNAL_TIMEOUT_SECONDS
        );
        assert_eq!(
            config.bbb_cost_interval_seconds,
            DEFAULT_BBB_COST_INTERVAL_SECONDS
        );
        assert!(config.seed_file.is_none());
        assert!(!config.observability.json_logs);
        assert_eq!(config.connection_label(), "unknown.production");
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "REDIS_URL".to_string(),
            "redis://a:6379,redis://b:6379".to_string(),
        );
        vars.insert("LIVE_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert("LIVE_COMMIT".to_string(), "abc123".to_string());
        vars.insert("LIVE_ENVIRONMENT".to_string(), "staging".to_string());
        vars.insert("LIVE_CHANNEL_PREFIX".to_string(), "test:".to_string());
        vars.insert("LIVE_GROUP_EXPIRY_SECONDS".to_string(), "3600".to_string());
        vars.insert("LIVE_EXTERNAL_TIMEOUT_SECONDS".to_string(), "3".to_string());
        vars.insert("LIVE_SEED_FILE".to_string(), "/etc/live/seed.json".to_string());
        vars.insert("LIVE_LOG_JSON".to_string(), "true".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.store.shard_count(), 2);
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.connection_label(), "abc123.staging");
        assert_eq!(config.channel_prefix, "test:");
        assert_eq!(config.group_expiry(), Duration::from_secs(3600));
        assert_eq!(config.external_timeout(), Duration::from_secs(3));
        assert_eq!(config.seed_file.as_deref(), Some("/etc/live/seed.json"));
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_from_vars_missing_redis_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_from_vars_rejects_zero_interval() {
        let mut vars = base_vars();
        vars.insert("LIVE_BBB_COST_INTERVAL_SECONDS".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_from_vars_rejects_garbage_number() {
        let mut vars = base_vars();
        vars.insert("LIVE_GROUP_EXPIRY_SECONDS".to_string(), "a day".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("redis://"));
    }
}
