//! Capability resolution.
//!
//! A principal holds a capability in a world (optionally narrowed to a room)
//! when any of the following is true:
//!
//! 1. it carries the `admin` trait;
//! 2. it carries a trait equal to the capability;
//! 3. it satisfies the requirements of a role (world grants, overridden per
//!    role by room grants) whose capability list contains it;
//! 4. the capability is in the base set or the world's default capabilities.
//!
//! Token traits only ever add to what the user record carries.

use crate::models::{Room, TraitGrants, User, UserKind, World};
use common::types::UserId;
use std::collections::BTreeSet;

/// Trait that grants every capability.
pub const ADMIN_TRAIT: &str = "admin";

/// Implicit trait of anonymous principals, usable in trait grants.
pub const ANONYMOUS_TRAIT: &str = "anonymous";

/// Capability strings.
pub mod capability {
    pub const WORLD_VIEW: &str = "world:view";
    pub const WORLD_SECRETS: &str = "world:secrets";
    pub const WORLD_UPDATE: &str = "world:update";
    pub const WORLD_CHAT_DIRECT: &str = "world:chat.direct";
    pub const WORLD_EXHIBITION_CONTACT: &str = "world:exhibition.contact";
    pub const WORLD_ROOMS_CREATE_EXHIBITION: &str = "world:rooms.create.exhibition";
    pub const ROOM_VIEW: &str = "room:view";
    pub const ROOM_CHAT_READ: &str = "room:chat.read";
    pub const ROOM_CHAT_JOIN: &str = "room:chat.join";
    pub const ROOM_CHAT_SEND: &str = "room:chat.send";
    pub const ROOM_CHAT_MODERATE: &str = "room:chat.moderate";
    pub const ROOM_POLL_READ: &str = "room:poll.read";
    pub const ROOM_POLL_VOTE: &str = "room:poll.vote";
    pub const ROOM_POLL_MANAGE: &str = "room:poll.manage";
    pub const ROOM_QUESTION_READ: &str = "room:question.read";
    pub const ROOM_QUESTION_ASK: &str = "room:question.ask";
    pub const ROOM_QUESTION_VOTE: &str = "room:question.vote";
    pub const ROOM_QUESTION_MODERATE: &str = "room:question.moderate";
    pub const ROOM_BBB_JOIN: &str = "room:bbb.join";
    pub const ROOM_BBB_MODERATE: &str = "room:bbb.moderate";
    pub const ROOM_JANUSCALL_JOIN: &str = "room:januscall.join";
}

/// Capabilities every authenticated principal holds.
pub const BASE_CAPABILITIES: &[&str] = &[capability::WORLD_VIEW];

/// An authenticated identity with its effective trait set.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: UserId,
    pub kind: UserKind,
    traits: BTreeSet<String>,
}

impl Principal {
    /// Build a principal from the user record plus any token traits.
    #[must_use]
    pub fn new(user: &User, token_traits: &[String]) -> Self {
        let mut traits: BTreeSet<String> = user.traits.iter().cloned().collect();
        traits.extend(token_traits.iter().cloned());
        if user.kind == UserKind::Anonymous {
            traits.insert(ANONYMOUS_TRAIT.to_string());
        }
        Self {
            user_id: user.id,
            kind: user.kind,
            traits,
        }
    }

    /// Effective traits.
    #[must_use]
    pub fn traits(&self) -> &BTreeSet<String> {
        &self.traits
    }

    #[must_use]
    pub fn has_trait(&self, name: &str) -> bool {
        self.traits.contains(name)
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.has_trait(ADMIN_TRAIT)
    }
}

/// Roles whose requirements the principal satisfies.
///
/// Room grants replace world grants role by role.
#[must_use]
pub fn roles_for(principal: &Principal, world: &World, room: Option<&Room>) -> BTreeSet<String> {
    let mut grants: TraitGrants = world.trait_grants.clone();
    if let Some(room) = room {
        for (role, requirements) in &room.trait_grants {
            grants.insert(role.clone(), requirements.clone());
        }
    }

    grants
        .into_iter()
        .filter(|(_, requirements)| {
            requirements
                .iter()
                .all(|req| req.satisfied_by(principal.traits()))
        })
        .map(|(role, _)| role)
        .collect()
}

/// Whether the principal holds `capability` in the world (and room).
#[must_use]
pub fn has_permission(
    principal: &Principal,
    capability: &str,
    world: &World,
    room: Option<&Room>,
) -> bool {
    if principal.is_admin() || principal.has_trait(capability) {
        return true;
    }
    if BASE_CAPABILITIES.contains(&capability)
        || world
            .config
            .default_capabilities
            .iter()
            .any(|c| c == capability)
    {
        return true;
    }
    roles_for(principal, world, room).iter().any(|role| {
        world
            .roles
            .get(role)
            .is_some_and(|caps| caps.iter().any(|c| c == capability))
    })
}

/// Whether the principal may see secret world configuration.
#[must_use]
pub fn can_see_secrets(principal: &Principal, world: &World) -> bool {
    principal.is_admin() || has_permission(principal, capability::WORLD_SECRETS, world, None)
}
