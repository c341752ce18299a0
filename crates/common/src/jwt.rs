//! JWT utilities shared across venueless live services.
//!
//! World tokens are HS256 JWTs signed with one of the secrets configured on
//! a world. Worlds can carry several secrets at once (rotation, or multiple
//! ticketing systems issuing tokens), so validation tries each configured
//! secret in turn and accepts the first one whose issuer, audience and
//! signature all match.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only HS256 is accepted; the algorithm is never taken from the header
//! - Expiration is mandatory, `iat` is checked against a bounded clock skew
//! - Error messages are generic to prevent information leakage
//! - The `uid` field in claims is redacted in Debug output
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{decode_world_token, DEFAULT_CLOCK_SKEW};
//!
//! let claims = decode_world_token(token, &world.config.jwt_secrets, DEFAULT_CLOCK_SKEW)?;
//! if claims.has_trait("admin") {
//!     // ...
//! }
//! ```

use crate::secret::{ExposeSecret, SecretString};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Tokens larger than this are rejected before any base64 decoding or
/// signature work. World tokens carry a trait list and an optional profile,
/// which stays well below this limit in practice.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default JWT clock skew tolerance (5 minutes).
///
/// Tokens with `iat` more than this amount in the future are rejected.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during JWT validation.
///
/// All variants render the same message; the variant is only used for
/// server-side logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// No configured secret validated the token (signature, issuer,
    /// audience or expiry mismatch).
    #[error("The access token is invalid or expired")]
    NoMatchingSecret,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,

    /// Token could not be signed (only raised by [`encode_world_token`]).
    #[error("Token signing failed")]
    SigningFailed,
}

// =============================================================================
// Secrets & Claims
// =============================================================================

/// One signing secret configured on a world.
///
/// The `secret` is held in a [`SecretString`] so that world configs can be
/// logged with `{:?}` safely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSecret {
    /// Expected `iss` claim.
    pub issuer: String,
    /// Expected `aud` claim.
    pub audience: String,
    /// HMAC key.
    #[serde(serialize_with = "serialize_exposed")]
    pub secret: SecretString,
}

fn serialize_exposed<S: serde::Serializer>(
    secret: &SecretString,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Claims carried by a world token.
///
/// `traits` are capabilities granted by the issuing system; they are
/// additive to anything the world's role grants resolve to.
#[derive(Clone, Serialize, Deserialize)]
pub struct WorldClaims {
    /// Issuer.
    pub iss: String,
    /// Audience; a single string or a list.
    pub aud: Audience,
    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,
    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
    /// Stable user identifier within the issuer. Redacted in Debug output.
    #[serde(alias = "sub")]
    pub uid: String,
    /// Traits granted by the issuer.
    #[serde(default)]
    pub traits: Vec<String>,
    /// Optional profile data to seed the user record with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
}

/// The `aud` claim. RFC 7519 allows both a single string and a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    /// Whether `audience` is among the token's audiences.
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(aud) => aud == audience,
            Audience::Many(auds) => auds.iter().any(|a| a == audience),
        }
    }
}

impl From<&str> for Audience {
    fn from(aud: &str) -> Self {
        Audience::One(aud.to_string())
    }
}

impl From<String> for Audience {
    fn from(aud: String) -> Self {
        Audience::One(aud)
    }
}

impl fmt::Debug for WorldClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldClaims")
            .field("iss", &self.iss)
            .field("aud", &self.aud)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("uid", &"[REDACTED]")
            .field("traits", &self.traits)
            .finish_non_exhaustive()
    }
}

impl WorldClaims {
    /// Check whether the token carries a trait.
    #[must_use]
    pub fn has_trait(&self, name: &str) -> bool {
        self.traits.iter().any(|t| t == name)
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Validate a world token against every configured secret.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` if it does not have three dot-separated segments
/// - `NoMatchingSecret` if no secret validates signature, issuer, audience
///   and expiry
/// - `IatTooFarInFuture` if the issued-at claim is beyond `clock_skew`
pub fn decode_world_token(
    token: &str,
    secrets: &[JwtSecret],
    clock_skew: Duration,
) -> Result<WorldClaims, JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    if token.split('.').count() != 3 {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    }

    for candidate in secrets {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[candidate.issuer.as_str()]);
        validation.set_audience(&[candidate.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_exp = true;

        let key = DecodingKey::from_secret(candidate.secret.expose_secret().as_bytes());
        match decode::<WorldClaims>(token, &key, &validation) {
            Ok(data) => {
                validate_iat(data.claims.iat, clock_skew)?;
                return Ok(data.claims);
            }
            Err(e) => {
                tracing::debug!(
                    target: "common.jwt",
                    issuer = %candidate.issuer,
                    error = %e,
                    "Secret did not validate token"
                );
            }
        }
    }

    Err(JwtValidationError::NoMatchingSecret)
}

/// Sign world claims with a secret.
///
/// Used by tooling and tests that need to mint tokens the way an external
/// ticketing system would.
///
/// # Errors
///
/// Returns `SigningFailed` if `jsonwebtoken` rejects the claims.
pub fn encode_world_token(
    claims: &WorldClaims,
    secret: &JwtSecret,
) -> Result<String, JwtValidationError> {
    let key = EncodingKey::from_secret(secret.secret.expose_secret().as_bytes());
    encode(&Header::new(Algorithm::HS256), claims, &key).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to sign world token");
        JwtValidationError::SigningFailed
    })
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if the iat timestamp is
/// more than `clock_skew` in the future.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // clock_skew is bounded by MAX_CLOCK_SKEW in every caller
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
