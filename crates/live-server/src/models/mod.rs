//! Domain model consumed by the live server.
//!
//! Worlds, rooms and users are owned by the surrounding platform; the live
//! server only reads them through the repository traits in
//! [`crate::repositories`]. Conferencing and content records are mutated by
//! the modules.

mod conferencing;
mod content;
mod exhibition;

pub use conferencing::{Call, CallCredentials, Server, ServerKind};
pub use content::{
    ChatChannel, ChatEvent, Poll, PollOption, PollState, PollType, Question, QuestionState,
    RoomView, MEMBER_EVENT,
};
pub use exhibition::{ContactRequest, ContactState, Exhibitor, ExhibitorLink, ExhibitorSize};

use chrono::{DateTime, Utc};
use common::jwt::JwtSecret;
use common::types::{RoomId, UserId, WorldId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Room module kinds.
pub mod module_kind {
    pub const CHAT_NATIVE: &str = "chat.native";
    pub const POLL: &str = "poll";
    pub const QUESTION: &str = "question";
    pub const BIGBLUEBUTTON: &str = "call.bigbluebutton";
    pub const JANUS: &str = "call.janus";
    pub const EXHIBITION: &str = "exhibition.native";
}

/// Role name -> requirements. Every requirement must be satisfied for the
/// role to apply.
pub type TraitGrants = BTreeMap<String, Vec<TraitRequirement>>;

/// One requirement of a trait grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitRequirement {
    /// The principal must carry this trait.
    One(String),
    /// The principal must carry at least one of these traits.
    AnyOf(Vec<String>),
}

impl TraitRequirement {
    /// Whether a trait set satisfies this requirement.
    #[must_use]
    pub fn satisfied_by(&self, traits: &BTreeSet<String>) -> bool {
        match self {
            TraitRequirement::One(t) => traits.contains(t),
            TraitRequirement::AnyOf(options) => options.iter().any(|t| traits.contains(t)),
        }
    }
}

fn default_true() -> bool {
    true
}

/// World configuration.
///
/// Unknown keys (feature flags, theming) are preserved in `extra` and passed
/// through to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Maximum concurrent connections per user; 0 means unlimited.
    #[serde(default)]
    pub connection_limit: usize,

    /// Secrets accepted for token logins.
    #[serde(default)]
    pub jwt_secrets: Vec<JwtSecret>,

    /// Whether `{client_id}` logins are accepted.
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    /// Capabilities every authenticated principal holds.
    #[serde(default)]
    pub default_capabilities: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            connection_limit: 0,
            jwt_secrets: Vec::new(),
            allow_anonymous: true,
            default_capabilities: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl WorldConfig {
    /// Config as sent to clients. Secret values are stripped unless
    /// `include_secrets` is set.
    #[must_use]
    pub fn to_client_json(&self, include_secrets: bool) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if !include_secrets {
            if let Some(secrets) = value.get_mut("jwt_secrets").and_then(Value::as_array_mut) {
                for entry in secrets {
                    if let Some(obj) = entry.as_object_mut() {
                        obj.remove("secret");
                    }
                }
            }
        }
        value
    }
}

/// A world (tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    pub id: WorldId,
    pub title: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub config: WorldConfig,
    /// Role -> capabilities.
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub trait_grants: TraitGrants,
}

/// A module enabled in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomModule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub config: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A room inside a world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub world_id: WorldId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sorting_priority: i32,
    #[serde(default)]
    pub modules: Vec<RoomModule>,
    /// Per-role overrides of the world's trait grants.
    #[serde(default)]
    pub trait_grants: TraitGrants,
    #[serde(default)]
    pub deleted: bool,
}

impl Room {
    /// The enabled module of a kind, if any.
    #[must_use]
    pub fn module(&self, kind: &str) -> Option<&RoomModule> {
        self.modules.iter().find(|m| m.kind == kind)
    }

    /// Room as listed to clients.
    #[must_use]
    pub fn to_client_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "sorting_priority": self.sorting_priority,
            "modules": self.modules,
        })
    }
}

/// Kind of user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    Person,
    Anonymous,
}

/// A user of one world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub world_id: WorldId,
    pub kind: UserKind,
    /// Browser-generated id for anonymous logins.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Issuer-scoped id for token logins.
    #[serde(default)]
    pub token_id: Option<String>,
    /// Traits stored on the user record.
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default = "empty_object")]
    pub profile: Value,
    pub created: DateTime<Utc>,
}

impl User {
    /// Display name from the profile, or a generic fallback.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.profile
            .get("display_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map_or_else(|| "Guest".to_string(), ToString::to_string)
    }

    /// User as sent to clients.
    #[must_use]
    pub fn to_public_json(&self) -> Value {
        json!({
            "id": self.id,
            "profile": self.profile,
            "kind": self.kind,
        })
    }
}
