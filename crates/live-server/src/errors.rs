//! Live server error types.
//!
//! Every error maps to a dotted protocol error code that is sent to the
//! client in an `["error", requestId, {code, message}]` frame. Internal
//! details are logged server-side but never exposed to clients.

use thiserror::Error;

use crate::store::StoreError;

/// Live server error type.
///
/// Code mapping:
/// - `Protocol`: `protocol.*` (malformed frame, unknown verb, unauthenticated)
/// - `PermissionDenied`: `protocol.denied`
/// - `Auth`: `auth.*`
/// - `NotFound`: the carried code (e.g. `room.unknown`)
/// - `ModuleDisabled`: `room.unknown_module`
/// - `Module`: the carried module-specific code (e.g. `poll.inactive`)
/// - `ExternalService`: `{service}.failed`
/// - `NoCapacity`: `{service}.no_server`
/// - Store, Repository, Config, Internal: `server.error`
#[derive(Debug, Error)]
pub enum LiveError {
    /// Malformed frame, unknown verb or command before authentication.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The principal lacks the capability guarding a command.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A referenced entity does not exist in this world.
    #[error("Not found: {0}")]
    NotFound(&'static str),

    /// The room does not have the module a command requires.
    #[error("Module not enabled in room: {0}")]
    ModuleDisabled(&'static str),

    /// Module-specific rejection (e.g. voting on a closed poll).
    #[error("{code}")]
    Module {
        code: String,
        message: Option<String>,
    },

    /// A media server (BBB/Janus/Turn) was unreachable or returned an error.
    #[error("External service {service} failed: {detail}")]
    ExternalService {
        service: &'static str,
        detail: String,
    },

    /// No eligible media server exists for this world.
    #[error("No {0} server available")]
    NoCapacity(&'static str),

    /// Shared store (Redis) operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Repository (domain persistence) operation failed.
    #[error("Repository error: {0}")]
    Repository(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire-level protocol errors. The connection always stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not a JSON array of the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// No module registered the verb.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A command other than `authenticate`/`ping` arrived before authentication.
    #[error("not authenticated")]
    Unauthenticated,

    /// `authenticate` arrived on an already authenticated connection.
    #[error("already authenticated")]
    AlreadyAuthenticated,
}

/// Authentication errors. The client must retry `authenticate`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Payload carried neither `client_id` nor `token`.
    #[error("missing client_id or token")]
    MissingIdOrToken,

    /// Token signature, issuer, audience or expiry did not validate.
    #[error("invalid token")]
    InvalidToken,

    /// Anonymous login is disabled for this world.
    #[error("authentication denied")]
    Denied,
}

impl ProtocolError {
    /// Protocol error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "protocol.malformed",
            ProtocolError::UnknownCommand(_) => "protocol.unknown_command",
            ProtocolError::Unauthenticated => "protocol.unauthenticated",
            ProtocolError::AlreadyAuthenticated => "protocol.already_authenticated",
        }
    }
}

impl AuthError {
    /// Protocol error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingIdOrToken => "auth.missing_id_or_token",
            AuthError::InvalidToken => "auth.invalid_token",
            AuthError::Denied => "auth.denied",
        }
    }
}

impl LiveError {
    /// Returns the protocol error code for this error.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            LiveError::Protocol(e) => e.code().to_string(),
            LiveError::PermissionDenied(_) => "protocol.denied".to_string(),
            LiveError::Auth(e) => e.code().to_string(),
            LiveError::NotFound(code) => (*code).to_string(),
            LiveError::ModuleDisabled(_) => "room.unknown_module".to_string(),
            LiveError::Module { code, .. } => code.clone(),
            LiveError::ExternalService { service, .. } => format!("{service}.failed"),
            LiveError::NoCapacity(service) => format!("{service}.no_server"),
            LiveError::Store(_)
            | LiveError::Repository(_)
            | LiveError::Config(_)
            | LiveError::Internal(_) => "server.error".to_string(),
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> Option<String> {
        match self {
            LiveError::Module { message, .. } => message.clone(),
            LiveError::ExternalService { .. } => {
                Some("The media server could not be reached".to_string())
            }
            LiveError::NoCapacity(_) => Some("No media server is available".to_string()),
            LiveError::Store(_)
            | LiveError::Repository(_)
            | LiveError::Config(_)
            | LiveError::Internal(_) => Some("An internal error occurred".to_string()),
            _ => None,
        }
    }

    /// Whether this error indicates a server-side fault (logged at error level).
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            LiveError::Store(_)
                | LiveError::Repository(_)
                | LiveError::Config(_)
                | LiveError::Internal(_)
        )
    }

    /// Convenience constructor for module-specific errors.
    #[must_use]
    pub fn module(code: impl Into<String>) -> Self {
        LiveError::Module {
            code: code.into(),
            message: None,
        }
    }

    /// Convenience constructor for module-specific errors with a message.
    #[must_use]
    pub fn module_with_message(code: impl Into<String>, message: impl Into<String>) -> Self {
        LiveError::Module {
            code: code.into(),
            message: Some(message.into()),
        }
    }
}
