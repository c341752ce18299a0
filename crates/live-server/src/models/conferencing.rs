//! Media servers and calls.

use chrono::{DateTime, Utc};
use common::secret::SecretString;
use common::types::{RoomId, UserId, WorldId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of pooled media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Bbb,
    Janus,
    Turn,
}

impl ServerKind {
    /// Service name used in error codes and metrics (`bbb.no_server`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServerKind::Bbb => "bbb",
            ServerKind::Janus => "janus",
            ServerKind::Turn => "turn",
        }
    }
}

fn default_true() -> bool {
    true
}

/// A pooled media server.
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub kind: ServerKind,
    /// API base URL (BBB, Janus) or hostname (Turn).
    pub url: String,
    /// Shared secret. Redacted in Debug output.
    pub secret: SecretString,
    #[serde(default = "default_true")]
    pub active: bool,
    /// World this server is reserved for, if any.
    #[serde(default)]
    pub world_exclusive: Option<WorldId>,
    /// Current load estimate (BBB only).
    #[serde(default)]
    pub cost: i64,
    /// Only usable for room calls, never for private calls.
    #[serde(default)]
    pub rooms_only: bool,
}

/// Credentials of a call on its server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CallCredentials {
    Bbb {
        meeting_id: String,
        attendee_pw: String,
        moderator_pw: String,
    },
    Janus {
        room_id: u64,
        token: String,
    },
}

/// A call bound to one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,
    pub world_id: WorldId,
    /// Room the call belongs to; `None` for private calls.
    #[serde(default)]
    pub room_id: Option<RoomId>,
    pub server_id: Uuid,
    pub server_url: String,
    pub credentials: CallCredentials,
    /// Users allowed to join a private call.
    #[serde(default)]
    pub invited: Vec<UserId>,
    pub created: DateTime<Utc>,
}

impl Call {
    /// Kind of server the call lives on.
    #[must_use]
    pub fn kind(&self) -> ServerKind {
        match self.credentials {
            CallCredentials::Bbb { .. } => ServerKind::Bbb,
            CallCredentials::Janus { .. } => ServerKind::Janus,
        }
    }
}
