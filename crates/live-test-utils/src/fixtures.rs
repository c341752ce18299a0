//! Builder patterns for test worlds, rooms and tokens
//!
//! Provides fluent APIs for the records the live server reads from its
//! repository, plus token minting the way an external ticketing system
//! would sign them.

use chrono::{Duration, Utc};
use common::jwt::{encode_world_token, JwtSecret, WorldClaims};
use common::secret::SecretString;
use common::types::{RoomId, WorldId};
use live_server::models::{Room, World};
use serde_json::{json, Map, Value};

/// Slug of the world every builder defaults to.
pub const TEST_WORLD: &str = "democon";

pub const TEST_ISSUER: &str = "https://tickets.example.com";
pub const TEST_AUDIENCE: &str = "venueless";

/// The signing secret configured on worlds built by [`TestWorldBuilder`].
pub fn test_secret() -> JwtSecret {
    JwtSecret {
        issuer: TEST_ISSUER.to_string(),
        audience: TEST_AUDIENCE.to_string(),
        secret: SecretString::from("test-world-secret"),
    }
}

/// Builder for test worlds
///
/// # Example
/// ```rust,ignore
/// let world = TestWorldBuilder::new()
///     .connection_limit(1)
///     .role("attendee", &["room:view", "room:chat.join"])
///     .grant("attendee", &[])
///     .build();
/// ```
pub struct TestWorldBuilder {
    id: String,
    config: Map<String, Value>,
    roles: Map<String, Value>,
    trait_grants: Map<String, Value>,
}

impl TestWorldBuilder {
    /// A world accepting anonymous logins and tokens signed with
    /// [`test_secret`].
    pub fn new() -> Self {
        let mut config = Map::new();
        config.insert(
            "jwt_secrets".to_string(),
            serde_json::to_value(vec![test_secret()]).unwrap(),
        );
        Self {
            id: TEST_WORLD.to_string(),
            config,
            roles: Map::new(),
            trait_grants: Map::new(),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Maximum concurrent sessions per user (0 is unlimited)
    pub fn connection_limit(mut self, limit: usize) -> Self {
        self.config
            .insert("connection_limit".to_string(), json!(limit));
        self
    }

    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.config.insert("allow_anonymous".to_string(), json!(allow));
        self
    }

    /// Capabilities every authenticated principal holds
    pub fn default_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config
            .insert("default_capabilities".to_string(), json!(capabilities));
        self
    }

    /// Extra config key passed through to clients
    pub fn config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    /// Define a role and its capabilities
    pub fn role(mut self, role: &str, capabilities: &[&str]) -> Self {
        self.roles.insert(role.to_string(), json!(capabilities));
        self
    }

    /// Grant `role` to principals carrying every one of `traits`
    pub fn grant(mut self, role: &str, traits: &[&str]) -> Self {
        self.trait_grants.insert(role.to_string(), json!(traits));
        self
    }

    pub fn build(self) -> World {
        serde_json::from_value(json!({
            "id": self.id,
            "title": "Test World",
            "config": self.config,
            "roles": self.roles,
            "trait_grants": self.trait_grants,
        }))
        .expect("test world should deserialize")
    }
}

impl Default for TestWorldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test rooms
///
/// # Example
/// ```rust,ignore
/// let room = TestRoomBuilder::new("Stage")
///     .module("poll", json!({"active": true}))
///     .build();
/// ```
pub struct TestRoomBuilder {
    id: RoomId,
    world_id: String,
    name: String,
    modules: Vec<Value>,
    trait_grants: Map<String, Value>,
    deleted: bool,
}

impl TestRoomBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            id: RoomId::new(),
            world_id: TEST_WORLD.to_string(),
            name: name.to_string(),
            modules: Vec::new(),
            trait_grants: Map::new(),
            deleted: false,
        }
    }

    pub fn in_world(mut self, world: &WorldId) -> Self {
        self.world_id = world.as_str().to_string();
        self
    }

    /// Enable a module with its config
    pub fn module(mut self, kind: &str, config: Value) -> Self {
        self.modules.push(json!({"type": kind, "config": config}));
        self
    }

    /// Override a world trait grant for this room
    pub fn grant(mut self, role: &str, traits: &[&str]) -> Self {
        self.trait_grants.insert(role.to_string(), json!(traits));
        self
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn build(self) -> Room {
        serde_json::from_value(json!({
            "id": self.id,
            "world_id": self.world_id,
            "name": self.name,
            "modules": self.modules,
            "trait_grants": self.trait_grants,
            "deleted": self.deleted,
        }))
        .expect("test room should deserialize")
    }
}

/// Builder for signed world tokens
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new("alice")
///     .with_traits(&["speaker"])
///     .sign();
/// ```
pub struct TestTokenBuilder {
    uid: String,
    traits: Vec<String>,
    profile: Option<Value>,
    exp: i64,
    iat: i64,
}

impl TestTokenBuilder {
    pub fn new(uid: &str) -> Self {
        let now = Utc::now();
        Self {
            uid: uid.to_string(),
            traits: Vec::new(),
            profile: None,
            exp: (now + Duration::seconds(3600)).timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn with_traits(mut self, traits: &[&str]) -> Self {
        self.traits = traits.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.profile = Some(json!({"display_name": name}));
        self
    }

    /// Set expiration in seconds from now (negative for expired tokens)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    pub fn claims(self) -> WorldClaims {
        WorldClaims {
            iss: TEST_ISSUER.to_string(),
            aud: TEST_AUDIENCE.into(),
            exp: self.exp,
            iat: self.iat,
            uid: self.uid,
            traits: self.traits,
            profile: self.profile,
        }
    }

    /// Sign with [`test_secret`]
    pub fn sign(self) -> String {
        self.sign_with(&test_secret())
    }

    pub fn sign_with(self, secret: &JwtSecret) -> String {
        encode_world_token(&self.claims(), secret).expect("token signing should succeed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::jwt::{decode_world_token, DEFAULT_CLOCK_SKEW};

    #[test]
    fn test_world_builder_defaults() {
        let world = TestWorldBuilder::new().build();
        assert_eq!(world.id.as_str(), TEST_WORLD);
        assert!(world.config.allow_anonymous);
        assert_eq!(world.config.connection_limit, 0);
        assert_eq!(world.config.jwt_secrets.len(), 1);
    }

    #[test]
    fn test_room_builder_modules() {
        let room = TestRoomBuilder::new("Stage")
            .module("poll", json!({"active": true}))
            .build();
        assert!(room.module("poll").is_some());
        assert!(room.module("question").is_none());
    }

    #[test]
    fn test_signed_token_validates_against_world() {
        let world = TestWorldBuilder::new().build();
        let token = TestTokenBuilder::new("alice")
            .with_traits(&["speaker"])
            .sign();
        let claims =
            decode_world_token(&token, &world.config.jwt_secrets, DEFAULT_CLOCK_SKEW).unwrap();
        assert_eq!(claims.uid, "alice");
        assert!(claims.has_trait("speaker"));
    }
}
