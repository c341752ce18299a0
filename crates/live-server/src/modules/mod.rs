//! Room modules and the command/event registry.
//!
//! Each module owns a verb prefix (`poll` for `poll.vote`) and registers its
//! command and event handlers through [`RegistryBuilder`]. The built
//! [`ModuleRegistry`] is immutable; dispatch is a map lookup.
//!
//! Every command carries a [`Guard`]: the capability it needs and whether it
//! acts on a room. Room commands name the room in `body.room`; the guard
//! loads it, checks the capability against the room's grants and, if
//! required, that the room has the module enabled. Handlers only run once
//! the guard passed, so a denied command never mutates anything.

pub mod bbb;
pub mod chat;
pub mod exhibition;
pub mod januscall;
pub mod poll;
pub mod question;
pub mod room;
pub mod user;
pub mod world;

use crate::auth::{has_permission, Principal};
use crate::channels::Event;
use crate::errors::{LiveError, ProtocolError};
use crate::models::{Room, User, World};
use crate::repositories::Repository;
use crate::state::AppState;
use common::types::{RoomId, UserId};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Boxed future returned by command handlers.
pub type CommandFuture = BoxFuture<'static, Result<Outcome, LiveError>>;

type CommandFn = Box<dyn Fn(CommandContext, Value) -> CommandFuture + Send + Sync>;

/// Event handler: render a group event for this connection, or drop it.
pub type EventFn = fn(&EventContext, &Event) -> Option<Value>;

/// What a command acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    World,
    /// A room named by `body.room`, optionally requiring a module kind.
    Room { module: Option<&'static str> },
}

/// Precondition checked before a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    pub permission: &'static str,
    pub scope: Scope,
}

impl Guard {
    #[must_use]
    pub const fn world(permission: &'static str) -> Self {
        Self {
            permission,
            scope: Scope::World,
        }
    }

    #[must_use]
    pub const fn room(permission: &'static str) -> Self {
        Self {
            permission,
            scope: Scope::Room { module: None },
        }
    }

    #[must_use]
    pub const fn room_module(permission: &'static str, module: &'static str) -> Self {
        Self {
            permission,
            scope: Scope::Room {
                module: Some(module),
            },
        }
    }
}

/// Side effects of a command, applied by the connection in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    JoinGroup(String),
    LeaveGroup(String),
    /// Sent after the reply.
    Broadcast { group: String, event: Event },
    RoomViewStarted { room: RoomId, view: Uuid },
    RoomViewEnded { room: RoomId },
}

/// Result of a command: the success body plus side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub reply: Value,
    pub effects: Vec<Effect>,
}

impl Default for Outcome {
    fn default() -> Self {
        Self::reply(json!({}))
    }
}

impl Outcome {
    #[must_use]
    pub fn reply(reply: Value) -> Self {
        Self {
            reply,
            effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn join(mut self, group: String) -> Self {
        self.effects.push(Effect::JoinGroup(group));
        self
    }

    #[must_use]
    pub fn leave(mut self, group: String) -> Self {
        self.effects.push(Effect::LeaveGroup(group));
        self
    }

    #[must_use]
    pub fn broadcast(mut self, group: String, event: Event) -> Self {
        self.effects.push(Effect::Broadcast { group, event });
        self
    }

    #[must_use]
    pub fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Per-command view of the connection.
#[derive(Clone)]
pub struct CommandContext {
    pub state: Arc<AppState>,
    pub world: Arc<World>,
    pub user: Arc<User>,
    pub principal: Arc<Principal>,
    /// Set by the guard for room commands.
    pub room: Option<Room>,
    pub channel: String,
    pub socket_id: String,
}

impl CommandContext {
    /// The guarded room.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::Internal` when called from a world-scoped handler.
    pub fn room(&self) -> Result<&Room, LiveError> {
        self.room
            .as_ref()
            .ok_or_else(|| LiveError::Internal("room handler without room guard".to_string()))
    }

    /// Whether the principal holds `capability` here (room-aware).
    #[must_use]
    pub fn can(&self, capability: &str) -> bool {
        has_permission(&self.principal, capability, &self.world, self.room.as_ref())
    }
}

/// Per-event view of the connection.
///
/// Capabilities are evaluated again at delivery time, so a grant revoked
/// after subscribing stops the flow of events.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub world: Arc<World>,
    pub user_id: UserId,
    pub principal: Arc<Principal>,
    pub socket_id: String,
    /// Current state of the room named by the event's `room` field; `None`
    /// when the event names no room or the room is gone.
    pub room: Option<Room>,
}

impl EventContext {
    /// Whether the receiving principal holds `capability` here.
    #[must_use]
    pub fn can(&self, capability: &str) -> bool {
        has_permission(&self.principal, capability, &self.world, self.room.as_ref())
    }
}

/// Registry construction failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Module prefix registered twice: {0}")]
    DuplicateModule(String),

    #[error("Command registered twice: {0}")]
    DuplicateCommand(String),

    #[error("Event registered twice: {0}")]
    DuplicateEvent(String),
}

/// A registered command.
pub struct CommandHandler {
    pub guard: Guard,
    handler: CommandFn,
}

impl CommandHandler {
    /// Run the handler.
    pub fn call(&self, ctx: CommandContext, body: Value) -> CommandFuture {
        (self.handler)(ctx, body)
    }
}

/// Collects handlers; see [`ModuleRegistry::builder`].
#[derive(Default)]
pub struct RegistryBuilder {
    prefixes: Vec<&'static str>,
    commands: Vec<(String, CommandHandler)>,
    events: Vec<(String, EventFn)>,
}

impl RegistryBuilder {
    /// Start registering handlers under `prefix`.
    #[must_use]
    pub fn module(mut self, prefix: &'static str) -> ModuleBuilder {
        self.prefixes.push(prefix);
        ModuleBuilder {
            parent: self,
            prefix,
        }
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns a `RegistryError` if a prefix, verb or event type was
    /// registered more than once.
    pub fn build(self) -> Result<ModuleRegistry, RegistryError> {
        let mut prefixes = Vec::with_capacity(self.prefixes.len());
        for prefix in self.prefixes {
            if prefixes.contains(&prefix) {
                return Err(RegistryError::DuplicateModule(prefix.to_string()));
            }
            prefixes.push(prefix);
        }

        let mut commands = HashMap::with_capacity(self.commands.len());
        for (verb, handler) in self.commands {
            if commands.contains_key(&verb) {
                return Err(RegistryError::DuplicateCommand(verb));
            }
            commands.insert(verb, handler);
        }

        let mut events = HashMap::with_capacity(self.events.len());
        for (kind, handler) in self.events {
            if events.contains_key(&kind) {
                return Err(RegistryError::DuplicateEvent(kind));
            }
            events.insert(kind, handler);
        }

        Ok(ModuleRegistry {
            prefixes,
            commands,
            events,
        })
    }
}

/// Registers handlers for one module prefix.
pub struct ModuleBuilder {
    parent: RegistryBuilder,
    prefix: &'static str,
}

impl ModuleBuilder {
    /// Register `{prefix}.{action}`.
    #[must_use]
    pub fn command<F, Fut>(mut self, action: &str, guard: Guard, handler: F) -> Self
    where
        F: Fn(CommandContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, LiveError>> + Send + 'static,
    {
        self.parent.commands.push((
            format!("{}.{action}", self.prefix),
            CommandHandler {
                guard,
                handler: Box::new(move |ctx, body| handler(ctx, body).boxed()),
            },
        ));
        self
    }

    /// Register a handler for group events of type `{prefix}.{action}`.
    #[must_use]
    pub fn event(mut self, action: &str, handler: EventFn) -> Self {
        self.parent
            .events
            .push((format!("{}.{action}", self.prefix), handler));
        self
    }

    /// Finish this module.
    #[must_use]
    pub fn done(self) -> RegistryBuilder {
        self.parent
    }
}

/// Immutable verb and event type tables.
pub struct ModuleRegistry {
    prefixes: Vec<&'static str>,
    commands: HashMap<String, CommandHandler>,
    events: HashMap<String, EventFn>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with every shipped module.
    ///
    /// # Errors
    ///
    /// Returns a `RegistryError` on conflicting registrations.
    pub fn standard() -> Result<Self, RegistryError> {
        let builder = Self::builder();
        let builder = room::register(builder);
        let builder = chat::register(builder);
        let builder = poll::register(builder);
        let builder = question::register(builder);
        let builder = bbb::register(builder);
        let builder = januscall::register(builder);
        let builder = world::register(builder);
        let builder = user::register(builder);
        let builder = exhibition::register(builder);
        builder.build()
    }

    #[must_use]
    pub fn command(&self, verb: &str) -> Option<&CommandHandler> {
        self.commands.get(verb)
    }

    #[must_use]
    pub fn event(&self, kind: &str) -> Option<EventFn> {
        self.events.get(kind).copied()
    }

    /// Registered module prefixes in registration order.
    #[must_use]
    pub fn prefixes(&self) -> &[&'static str] {
        &self.prefixes
    }

    /// Registered verbs, sorted.
    #[must_use]
    pub fn verbs(&self) -> Vec<&str> {
        let mut verbs: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        verbs.sort_unstable();
        verbs
    }
}

/// Check a guard and load the room it names.
///
/// # Errors
///
/// - `ProtocolError::Malformed` if a room command lacks a valid `room`
/// - `LiveError::NotFound("room.unknown")` for unknown or deleted rooms
/// - `LiveError::PermissionDenied` if the capability is missing
/// - `LiveError::ModuleDisabled` if the room lacks the required module
pub async fn authorize(
    guard: &Guard,
    repository: &dyn Repository,
    world: &World,
    principal: &Principal,
    body: &Value,
) -> Result<Option<Room>, LiveError> {
    let Scope::Room { module } = guard.scope else {
        if !has_permission(principal, guard.permission, world, None) {
            return Err(LiveError::PermissionDenied(guard.permission.to_string()));
        }
        return Ok(None);
    };

    let room_id: RoomId = body
        .get("room")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or_else(|| ProtocolError::Malformed("missing or invalid room".to_string()))?;

    let room = repository
        .get_room(&world.id, room_id)
        .await?
        .filter(|r| !r.deleted)
        .ok_or(LiveError::NotFound("room.unknown"))?;

    if !has_permission(principal, guard.permission, world, Some(&room)) {
        return Err(LiveError::PermissionDenied(guard.permission.to_string()));
    }
    if let Some(module) = module {
        if room.module(module).is_none() {
            return Err(LiveError::ModuleDisabled(module));
        }
    }
    Ok(Some(room))
}

/// Deserialize a command body.
///
/// # Errors
///
/// Returns `ProtocolError::Malformed` if the body does not match `T`.
pub fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, LiveError> {
    serde_json::from_value(body)
        .map_err(|e| ProtocolError::Malformed(format!("invalid body: {e}")).into())
}

/// Whether a module is switched on in its config (`"active": true`).
#[must_use]
pub fn module_active(room: &Room, module: &str) -> bool {
    room.module(module)
        .and_then(|m| m.config.get("active"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
