//! Common configuration types for venueless live components.

use crate::error::CommonError;
use crate::secret::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Scheme used to select the in-process store instead of Redis.
pub const MEMORY_STORE_URL: &str = "memory://";

/// Shared store configuration.
///
/// `REDIS_URL` may list several comma-separated URLs; each one is a shard of
/// the channel layer and the first one also holds the connection registry.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Shard URLs, in shard-index order. Redacted in Debug output.
    pub shard_urls: Vec<SecretString>,
}

impl StoreConfig {
    /// Parse a comma-separated list of shard URLs.
    ///
    /// # Errors
    ///
    /// Returns `CommonError::Configuration` if the list is empty.
    pub fn parse(raw: &str) -> Result<Self, CommonError> {
        let shard_urls: Vec<SecretString> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SecretString::from)
            .collect();

        if shard_urls.is_empty() {
            return Err(CommonError::Configuration(
                "at least one store URL is required".to_string(),
            ));
        }

        Ok(Self { shard_urls })
    }

    /// True when every shard points at the in-process store.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.shard_urls
            .iter()
            .all(|u| u.expose_secret().starts_with(MEMORY_STORE_URL))
    }

    /// Number of channel layer shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_urls.len()
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive (e.g. `live_server=debug`)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_url() {
        let config = StoreConfig::parse("redis://localhost:6379").unwrap();
        assert_eq!(config.shard_count(), 1);
        assert!(!config.is_memory());
    }

    #[test]
    fn test_parse_multiple_shards() {
        let config = StoreConfig::parse("redis://a:6379, redis://b:6379,,").unwrap();
        assert_eq!(config.shard_count(), 2);
        assert_eq!(
            config.shard_urls.get(1).unwrap().expose_secret(),
            "redis://b:6379"
        );
    }

    #[test]
    fn test_parse_memory() {
        let config = StoreConfig::parse("memory://").unwrap();
        assert!(config.is_memory());
    }

    #[test]
    fn test_parse_empty_rejected() {
        assert!(matches!(
            StoreConfig::parse(" , "),
            Err(CommonError::Configuration(_))
        ));
    }

    #[test]
    fn test_debug_redacts_urls() {
        let config = StoreConfig::parse("redis://:hunter2@localhost:6379").unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
