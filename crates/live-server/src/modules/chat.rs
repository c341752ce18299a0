//! `chat.*`: room chat and direct conversations.
//!
//! Every command names its channel with `channel`; room channels may also
//! be named with `room` and share the room's id. Room channels check the
//! room's capabilities and require the `chat.native` module, direct
//! channels only admit their members. Membership is stored, subscriptions
//! are the connection's chat groups.

use super::{parse_body, CommandContext, EventContext, Guard, Outcome, RegistryBuilder};
use crate::auth::{capability, has_permission};
use crate::channels::groups::{chat_group, user_group};
use crate::channels::Event;
use crate::consumer::user_broadcast;
use crate::errors::{LiveError, ProtocolError};
use crate::models::{module_kind, ChatChannel, ChatEvent, Room, User, MEMBER_EVENT};
use crate::repositories::Repository;
use common::types::{RoomId, UserId, WorldId};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// Only event type clients may send.
const MESSAGE_EVENT: &str = "channel.message";

/// Push listing the user's channels.
const CHANNELS_PUSH: &str = "chat.channels";

const DEFAULT_FETCH_COUNT: usize = 25;
const MAX_FETCH_COUNT: usize = 100;

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .module("chat")
        .command(
            "join",
            Guard::room_module(capability::ROOM_CHAT_JOIN, module_kind::CHAT_NATIVE),
            join,
        )
        .command(
            "leave",
            Guard::room_module(capability::WORLD_VIEW, module_kind::CHAT_NATIVE),
            leave,
        )
        .command("subscribe", Guard::world(capability::WORLD_VIEW), subscribe)
        .command("unsubscribe", Guard::world(capability::WORLD_VIEW), unsubscribe)
        .command("send", Guard::world(capability::WORLD_VIEW), send)
        .command("fetch", Guard::world(capability::WORLD_VIEW), fetch)
        .command("mark_read", Guard::world(capability::WORLD_VIEW), mark_read)
        .command(
            "direct.create",
            Guard::world(capability::WORLD_CHAT_DIRECT),
            direct_create,
        )
        .event("event", push_event)
        .event("read_pointers", push_read_pointers)
        .event("notification_pointers", push_notification_pointers)
        .done()
}

/// Which connections may act on a channel without being a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Required,
    /// Room channels are open to everyone holding the room capability.
    DirectOnly,
    NotRequired,
}

#[derive(Debug, Deserialize)]
struct ChannelRef {
    #[serde(default)]
    channel: Option<Uuid>,
    #[serde(default)]
    room: Option<RoomId>,
}

#[derive(Debug, Deserialize)]
struct SendBody {
    event_type: String,
    content: Value,
    #[serde(default)]
    replaces: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FetchBody {
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    before_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MarkReadBody {
    #[serde(default)]
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DirectBody {
    #[serde(default)]
    users: Vec<UserId>,
}

fn denied() -> LiveError {
    LiveError::module("chat.denied")
}

/// A channel resolved for one command.
struct Target {
    channel: ChatChannel,
    room: Option<Room>,
}

/// Load the channel named by the body and check access to it.
async fn resolve(
    ctx: &CommandContext,
    body: &Value,
    permission: Option<&str>,
    membership: Membership,
) -> Result<Target, LiveError> {
    let reference: ChannelRef = parse_body(body.clone())?;
    let id = match (reference.channel, reference.room) {
        (Some(channel), _) => channel,
        (None, Some(room)) => room.0,
        (None, None) => return Err(LiveError::module("chat.unknown")),
    };
    let repository = &ctx.state.repository;
    let channel = repository
        .get_chat_channel(&ctx.world.id, id)
        .await?
        .ok_or(LiveError::NotFound("room.unknown"))?;

    let room = match channel.room_id {
        Some(room_id) => Some(
            repository
                .get_room(&ctx.world.id, room_id)
                .await?
                .filter(|r| !r.deleted)
                .ok_or(LiveError::NotFound("room.unknown"))?,
        ),
        None => None,
    };
    if let Some(room) = &room {
        if room.module(module_kind::CHAT_NATIVE).is_none() {
            return Err(LiveError::ModuleDisabled(module_kind::CHAT_NATIVE));
        }
        if let Some(permission) = permission {
            if !has_permission(&ctx.principal, permission, &ctx.world, Some(room)) {
                return Err(LiveError::PermissionDenied(permission.to_string()));
            }
        }
    }

    let must_be_member = match membership {
        Membership::Required => true,
        Membership::DirectOnly => channel.is_direct(),
        Membership::NotRequired => false,
    };
    if must_be_member && !repository.is_channel_member(channel.id, ctx.user.id).await? {
        return Err(denied());
    }
    Ok(Target { channel, room })
}

fn as_event(kind: &str, payload: Value) -> Event {
    match payload {
        Value::Object(data) => Event {
            kind: kind.to_string(),
            data,
        },
        _ => Event::new(kind),
    }
}

/// `chat.event` for a stored chat event. Room channels carry the room so
/// receivers can check their read capability on delivery.
fn chat_event(event: &ChatEvent, room: Option<RoomId>) -> Event {
    let broadcast = as_event("chat.event", json!(event));
    match room {
        Some(room) => broadcast.with("room", json!(room)),
        None => broadcast,
    }
}

async fn public_users(ctx: &CommandContext, ids: &[UserId]) -> Result<Vec<Value>, LiveError> {
    Ok(ctx
        .state
        .repository
        .get_users(&ctx.world.id, ids)
        .await?
        .iter()
        .map(User::to_public_json)
        .collect())
}

/// Reply to a subscription: where live events start and who is in the
/// channel.
async fn subscription(ctx: &CommandContext, channel: &ChatChannel) -> Result<Value, LiveError> {
    let repository = &ctx.state.repository;
    let latest = repository.fetch_chat_events(channel.id, None, 1).await?;
    let next_event_id = latest.last().map_or(0, |e| e.event_id + 1);
    let members = repository.channel_members(channel.id).await?;
    Ok(json!({
        "state": null,
        "next_event_id": next_event_id,
        "notification_pointer": repository.notification_pointer(channel.id).await?,
        "members": public_users(ctx, &members).await?,
    }))
}

/// The user's channels with their notification pointers; direct channels
/// also list their members.
pub(crate) async fn channels_json(
    repository: &dyn Repository,
    world: &WorldId,
    user: UserId,
) -> Result<Value, LiveError> {
    let mut channels = Vec::new();
    for channel in repository.channels_for_user(world, user).await? {
        let mut entry = Map::new();
        entry.insert("id".to_string(), json!(channel.id));
        entry.insert(
            "notification_pointer".to_string(),
            json!(repository.notification_pointer(channel.id).await?),
        );
        if channel.is_direct() {
            let members = repository.channel_members(channel.id).await?;
            let users: Vec<Value> = repository
                .get_users(world, &members)
                .await?
                .iter()
                .map(User::to_public_json)
                .collect();
            entry.insert("members".to_string(), json!(users));
        }
        channels.push(Value::Object(entry));
    }
    Ok(Value::Array(channels))
}

/// Read pointers of `user` keyed by channel id.
pub(crate) async fn read_pointers_json(
    repository: &dyn Repository,
    user: UserId,
) -> Result<Value, LiveError> {
    let pointers: Map<String, Value> = repository
        .read_pointers(user)
        .await?
        .into_iter()
        .map(|(channel, event_id)| (channel.to_string(), json!(event_id)))
        .collect();
    Ok(Value::Object(pointers))
}

/// `chat.channels` push for every session of `user`.
async fn channel_list(ctx: &CommandContext, user: UserId) -> Result<Event, LiveError> {
    let channels = channels_json(ctx.state.repository.as_ref(), &ctx.world.id, user).await?;
    Ok(user_broadcast(None, CHANNELS_PUSH, json!({"channels": channels})))
}

/// Store a membership change and announce it to the channel.
async fn member_event(
    ctx: &CommandContext,
    channel: &ChatChannel,
    user: &User,
    membership: &str,
) -> Result<Event, LiveError> {
    let event = ctx
        .state
        .repository
        .append_chat_event(
            channel.id,
            user.id,
            MEMBER_EVENT,
            json!({"membership": membership, "user": user.to_public_json()}),
            None,
        )
        .await?;
    Ok(chat_event(&event, channel.room_id))
}

async fn join(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    let channel = ChatChannel::for_room(ctx.world.id.clone(), room.id);
    let group = chat_group(channel.id);
    let reply = subscription(&ctx, &channel).await?;

    let repository = &ctx.state.repository;
    let mut outcome = Outcome::reply(reply).join(group.clone());
    if repository.add_channel_member(channel.id, ctx.user.id).await? {
        let joined = member_event(&ctx, &channel, &ctx.user, "join").await?;
        repository.watch_unread(channel.id, ctx.user.id).await?;
        outcome = outcome
            .broadcast(group, joined)
            .broadcast(user_group(ctx.user.id), channel_list(&ctx, ctx.user.id).await?);
    }
    Ok(outcome)
}

async fn leave(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    let channel = ChatChannel::for_room(ctx.world.id.clone(), room.id);
    let group = chat_group(channel.id);

    let repository = &ctx.state.repository;
    let mut outcome = Outcome::default().leave(group.clone());
    if repository.remove_channel_member(channel.id, ctx.user.id).await? {
        let left = member_event(&ctx, &channel, &ctx.user, "leave").await?;
        repository.unwatch_unread(channel.id, ctx.user.id).await?;
        outcome = outcome
            .broadcast(group, left)
            .broadcast(user_group(ctx.user.id), channel_list(&ctx, ctx.user.id).await?);
    }
    Ok(outcome)
}

async fn subscribe(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let Target { channel, .. } = resolve(
        &ctx,
        &body,
        Some(capability::ROOM_CHAT_READ),
        Membership::DirectOnly,
    )
    .await?;
    let reply = subscription(&ctx, &channel).await?;
    Ok(Outcome::reply(reply).join(chat_group(channel.id)))
}

async fn unsubscribe(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let Target { channel, .. } = resolve(&ctx, &body, None, Membership::NotRequired).await?;
    Ok(Outcome::default().leave(chat_group(channel.id)))
}

/// Check the content type and apply an edit of an earlier event.
async fn apply_replacement(
    ctx: &CommandContext,
    target: &Target,
    body: &SendBody,
) -> Result<(), LiveError> {
    let kind = body.content.get("type").and_then(Value::as_str);
    let allowed = match kind {
        Some("text") => true,
        Some("deleted") => body.replaces.is_some(),
        Some("call") => target.channel.is_direct(),
        _ => false,
    };
    if !allowed {
        return Err(LiveError::module("chat.unsupported_content_type"));
    }

    let Some(replaces) = body.replaces else {
        return Ok(());
    };
    let repository = &ctx.state.repository;
    let previous = repository
        .get_chat_event(target.channel.id, replaces)
        .await?
        .ok_or(LiveError::NotFound("chat.unknown_event"))?;
    if previous.sender != ctx.user.id {
        // Moderators may delete messages of others, never edit them.
        let moderator = target.room.as_ref().is_some_and(|room| {
            has_permission(
                &ctx.principal,
                capability::ROOM_CHAT_MODERATE,
                &ctx.world,
                Some(room),
            )
        });
        if kind != Some("deleted") || !moderator {
            return Err(denied());
        }
    }
    repository
        .update_chat_event(target.channel.id, replaces, body.content.clone())
        .await?;
    Ok(())
}

async fn send(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let target = resolve(
        &ctx,
        &body,
        Some(capability::ROOM_CHAT_SEND),
        Membership::Required,
    )
    .await?;
    let mut body: SendBody = parse_body(body)?;
    if body.event_type != MESSAGE_EVENT {
        return Err(LiveError::module("chat.unsupported_event_type"));
    }
    apply_replacement(&ctx, &target, &body).await?;

    match body.content.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = body.content.get("body").and_then(Value::as_str).unwrap_or_default();
            if text.trim().is_empty() {
                return Err(LiveError::module("chat.empty"));
            }
        }
        Some("call") => {
            let members = ctx.state.repository.channel_members(target.channel.id).await?;
            let call = ctx
                .state
                .conferencing
                .create_private_call(&ctx.world.id, members)
                .await?;
            let content = body
                .content
                .as_object_mut()
                .ok_or_else(|| ProtocolError::Malformed("content must be an object".to_string()))?;
            let mut call_body = match content.remove("body") {
                Some(Value::Object(fields)) => fields,
                _ => Map::new(),
            };
            call_body.insert("id".to_string(), json!(call.id));
            content.insert("body".to_string(), Value::Object(call_body));
        }
        _ => {}
    }

    let repository = &ctx.state.repository;
    let channel = &target.channel;
    let event = repository
        .append_chat_event(
            channel.id,
            ctx.user.id,
            &body.event_type,
            body.content,
            body.replaces,
        )
        .await?;

    let mut outcome = Outcome::reply(json!({"event": event}))
        .broadcast(chat_group(channel.id), chat_event(&event, channel.room_id));

    // Watchers are notified once, until their next read pointer.
    let watchers = repository.take_unread_watchers(channel.id).await?;
    debug!(
        target: "live.chat",
        channel_id = %channel.id,
        event_id = event.event_id,
        notified = watchers.len(),
        "Chat message stored"
    );
    let mut pointers = Map::new();
    pointers.insert(channel.id.to_string(), json!(event.event_id));
    for user in watchers {
        outcome = outcome.broadcast(
            user_group(user),
            Event::new("chat.notification_pointers").with("data", Value::Object(pointers.clone())),
        );
    }
    Ok(outcome)
}

async fn fetch(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let Target { channel, .. } = resolve(
        &ctx,
        &body,
        Some(capability::ROOM_CHAT_READ),
        Membership::DirectOnly,
    )
    .await?;

    let body: FetchBody = parse_body(body)?;
    let count = body
        .count
        .unwrap_or(DEFAULT_FETCH_COUNT)
        .clamp(1, MAX_FETCH_COUNT);
    let events = ctx
        .state
        .repository
        .fetch_chat_events(channel.id, body.before_id, count)
        .await?;
    Ok(Outcome::reply(json!({"results": events})))
}

async fn mark_read(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let Target { channel, .. } = resolve(&ctx, &body, None, Membership::Required).await?;
    let MarkReadBody { id } = parse_body(body)?;
    let id = id
        .filter(|id| *id > 0)
        .ok_or_else(|| LiveError::module("chat.invalid_body"))?;

    let repository = &ctx.state.repository;
    repository.set_read_pointer(ctx.user.id, channel.id, id).await?;
    repository.watch_unread(channel.id, ctx.user.id).await?;

    let update = Event::new("chat.read_pointers")
        .with("socket", json!(ctx.socket_id))
        .with("pointers", read_pointers_json(repository.as_ref(), ctx.user.id).await?);
    Ok(Outcome::default().broadcast(user_group(ctx.user.id), update))
}

async fn direct_create(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let DirectBody { users } = parse_body(body)?;
    let mut members: BTreeSet<UserId> = users.into_iter().collect();
    members.insert(ctx.user.id);

    let repository = &ctx.state.repository;
    let (channel, created) = repository
        .get_or_create_direct_channel(&ctx.world.id, &members)
        .await?
        .ok_or_else(denied)?;

    let group = chat_group(channel.id);
    let mut reply = subscription(&ctx, &channel).await?;
    if let Some(fields) = reply.as_object_mut() {
        fields.insert("id".to_string(), json!(channel.id));
    }
    let mut outcome = Outcome::reply(reply).join(group.clone());

    if created {
        let ids: Vec<UserId> = members.into_iter().collect();
        for user in repository.get_users(&ctx.world.id, &ids).await? {
            let joined = member_event(&ctx, &channel, &user, "join").await?;
            repository.watch_unread(channel.id, user.id).await?;
            outcome = outcome
                .broadcast(group.clone(), joined)
                .broadcast(user_group(user.id), channel_list(&ctx, user.id).await?);
        }
    }
    Ok(outcome)
}

/// Room events only reach connections that may still read the room.
fn push_event(ctx: &EventContext, event: &Event) -> Option<Value> {
    let mut payload = event.payload();
    if event.get("room").is_some() {
        ctx.room.as_ref()?;
        if !ctx.can(capability::ROOM_CHAT_READ) {
            return None;
        }
        payload.as_object_mut()?.remove("room");
    }
    Some(payload)
}

/// Read pointers changed in another session of the same user.
fn push_read_pointers(ctx: &EventContext, event: &Event) -> Option<Value> {
    if event.get("socket").and_then(Value::as_str) == Some(ctx.socket_id.as_str()) {
        return None;
    }
    event.get("pointers").cloned()
}

fn push_notification_pointers(_ctx: &EventContext, event: &Event) -> Option<Value> {
    event.get("data").cloned()
}
