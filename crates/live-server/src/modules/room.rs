//! `room.*`: presence in a room.
//!
//! Entering starts a room view and subscribes the connection to the room
//! group plus the poll and question groups its capabilities allow.

use super::{CommandContext, Effect, Guard, Outcome, RegistryBuilder};
use crate::auth::capability;
use crate::channels::groups::room_group;
use crate::errors::LiveError;
use crate::models::Room;
use serde_json::Value;

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .module("room")
        .command("enter", Guard::room(capability::ROOM_VIEW), enter)
        .command("leave", Guard::room(capability::ROOM_VIEW), leave)
        .done()
}

/// Groups a connection joins when entering `room`.
pub(crate) fn subscription_groups(ctx: &CommandContext, room: &Room) -> Vec<String> {
    let mut groups = vec![room_group(room.id)];
    groups.extend(super::poll::subscription_group(ctx, room));
    groups.extend(super::question::subscription_group(ctx, room));
    groups
}

/// Every group `room.enter` may have joined.
fn all_room_groups(room: &Room) -> Vec<String> {
    let mut groups = vec![room_group(room.id)];
    groups.extend(super::poll::all_groups(room.id));
    groups.extend(super::question::all_groups(room.id));
    groups
}

async fn enter(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    let view = ctx
        .state
        .repository
        .start_room_view(room.id, ctx.user.id)
        .await?;

    let outcome = subscription_groups(&ctx, room)
        .into_iter()
        .fold(Outcome::default(), Outcome::join);
    Ok(outcome.effect(Effect::RoomViewStarted {
        room: room.id,
        view: view.id,
    }))
}

async fn leave(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    let outcome = all_room_groups(room)
        .into_iter()
        .fold(Outcome::default(), Outcome::leave);
    Ok(outcome.effect(Effect::RoomViewEnded { room: room.id }))
}
