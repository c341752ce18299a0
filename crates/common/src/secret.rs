//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate with venueless-specific
//! guidance. Use these types for all sensitive values like signing secrets,
//! media-server shared secrets, and store URLs with embedded credentials.
//!
//! # Compile-Time Safety
//!
//! The key insight is that `SecretBox<T>` and `SecretString` implement `Debug`
//! with redaction, so any code that derives `Debug` on a struct containing secrets
//! will automatically get safe logging behavior. This makes it **impossible** to
//! accidentally log secrets via `{:?}` or tracing.
//!
//! # Memory Safety
//!
//! Secrets are automatically zeroized when dropped, preventing sensitive
//! data from lingering in memory after use.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct SigningSecret {
//!     issuer: String,
//!     secret: SecretString,  // Safe: Debug shows "[REDACTED]"
//! }
//!
//! let s = SigningSecret {
//!     issuer: "tickets".to_string(),
//!     secret: SecretString::from("hunter2"),
//! };
//!
//! // This is safe - the secret is redacted
//! println!("{:?}", s);
//!
//! // To access the actual value, you must explicitly call expose_secret()
//! let key: &str = s.secret.expose_secret();
//! ```
//!
//! # Usage Guidelines
//!
//! Use `SecretString` for:
//! - World JWT signing secrets
//! - BBB / Janus / Turn shared secrets
//! - Store URLs (they may embed credentials)
//!
//! Use `SecretBox<T>` for:
//! - Custom secret types (e.g., `SecretBox<[u8]>` for binary keys)
//!
//! # Serde Integration
//!
//! With the `serde` feature enabled, secrets can be deserialized from JSON:
//!
//! ```rust
//! use serde::Deserialize;
//! use common::secret::SecretString;
//!
//! #[derive(Debug, Deserialize)]
//! struct TurnServer {
//!     hostname: String,
//!     secret: SecretString,
//! }
//!
//! let json = r#"{"hostname": "turn.example.org", "secret": "shared-key"}"#;
//! let server: TurnServer = serde_json::from_str(json).unwrap();
//!
//! // Debug output is safe
//! println!("{:?}", server);
//! // hostname is visible, secret is redacted
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("password123");
        assert_eq!(secret.expose_secret(), "password123");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct BbbServer {
            url: String,
            secret: SecretString,
        }

        let creds = BbbServer {
            url: "https://bbb.example.org/bigbluebutton/".to_string(),
            secret: SecretString::from("super-secret"),
        };

        let debug_str = format!("{creds:?}");

        // URL should be visible
        assert!(debug_str.contains("bbb.example.org"));
        // Secret should be redacted
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }

    #[test]
    fn test_deserialize() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct JanusServer {
            url: String,
            secret: SecretString,
        }

        let json = r#"{"url": "wss://janus.example.org", "secret": "my-secret-value"}"#;
        let creds: JanusServer = serde_json::from_str(json).expect("deserialize");

        // Verify we can access the secret
        assert_eq!(creds.secret.expose_secret(), "my-secret-value");

        // Verify debug doesn't expose the value
        let debug = format!("{creds:?}");
        assert!(!debug.contains("my-secret-value"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_clone_works() {
        let secret = SecretString::from("cloneable");
        let cloned = secret.clone();
        assert_eq!(cloned.expose_secret(), "cloneable");
    }
}
