//! Common error types for venueless live components.

use thiserror::Error;

/// Errors shared by the live server and its tooling.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Shared store (Redis) operation failed
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        CommonError::Serialization(err.to_string())
    }
}

/// Result type alias using `CommonError`
pub type Result<T> = std::result::Result<T, CommonError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            CommonError::Store("timeout".to_string()).to_string(),
            "Store error: timeout"
        );
        assert_eq!(
            CommonError::NotFound("world".to_string()).to_string(),
            "Not found: world"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let common: CommonError = err.into();
        assert!(matches!(common, CommonError::Serialization(_)));
    }
}
