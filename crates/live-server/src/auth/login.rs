//! `authenticate` payload handling.

use super::permissions::Principal;
use crate::errors::{AuthError, LiveError};
use crate::models::{User, World};
use crate::repositories::Repository;
use common::jwt::{decode_world_token, DEFAULT_CLOCK_SKEW};
use serde_json::Value;
use tracing::debug;

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: User,
    pub principal: Principal,
}

/// Resolve the identity behind an `authenticate` payload.
///
/// `{"token": ...}` takes precedence over `{"client_id": ...}`.
///
/// # Errors
///
/// - `AuthError::InvalidToken` if the token fails validation against every
///   configured secret
/// - `AuthError::Denied` for anonymous logins when the world disallows them
/// - `AuthError::MissingIdOrToken` if neither field is present
pub async fn authenticate(
    repository: &dyn Repository,
    world: &World,
    payload: &Value,
) -> Result<Identity, LiveError> {
    if let Some(token) = non_empty_str(payload, "token") {
        let claims = decode_world_token(token, &world.config.jwt_secrets, DEFAULT_CLOCK_SKEW)
            .map_err(|e| {
                debug!(
                    target: "live.auth",
                    world_id = %world.id,
                    error = %e,
                    "Token rejected"
                );
                AuthError::InvalidToken
            })?;
        let user = repository.login_token(&world.id, &claims).await?;
        let principal = Principal::new(&user, &claims.traits);
        return Ok(Identity { user, principal });
    }

    if let Some(client_id) = non_empty_str(payload, "client_id") {
        if !world.config.allow_anonymous {
            return Err(AuthError::Denied.into());
        }
        let user = repository.login_anonymous(&world.id, client_id).await?;
        let principal = Principal::new(&user, &[]);
        return Ok(Identity { user, principal });
    }

    Err(AuthError::MissingIdOrToken.into())
}

fn non_empty_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
