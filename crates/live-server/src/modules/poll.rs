//! `poll.*`: live polls.
//!
//! Managers subscribe to `room.{id}.poll.manage` and see every poll with
//! results. Everyone else with `room:poll.read` subscribes to
//! `room.{id}.poll` and only sees open and closed polls; results are
//! included once they voted or the poll closed. Every command requires the
//! room's poll module to be switched on (`config.active`).

use super::{
    module_active, parse_body, CommandContext, EventContext, Guard, Outcome, RegistryBuilder,
};
use crate::auth::{capability, has_permission};
use crate::channels::groups::poll_group;
use crate::channels::Event;
use crate::errors::LiveError;
use crate::models::{module_kind, Poll, PollState, Room};
use crate::repositories::NewPoll;
use common::types::RoomId;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    let manage = Guard::room_module(capability::ROOM_POLL_MANAGE, module_kind::POLL);
    builder
        .module("poll")
        .command("create", manage, create)
        .command("update", manage, update)
        .command("delete", manage, delete)
        .command(
            "vote",
            Guard::room_module(capability::ROOM_POLL_VOTE, module_kind::POLL),
            vote,
        )
        .command(
            "list",
            Guard::room_module(capability::ROOM_POLL_READ, module_kind::POLL),
            list,
        )
        .event("created_or_updated", push_poll)
        .event("deleted", push_deleted)
        .done()
}

/// The poll group a connection entering `room` joins, if any.
pub(crate) fn subscription_group(ctx: &CommandContext, room: &Room) -> Option<String> {
    room.module(module_kind::POLL)?;
    if has_permission(&ctx.principal, capability::ROOM_POLL_MANAGE, &ctx.world, Some(room)) {
        Some(poll_group(room.id, true))
    } else if has_permission(&ctx.principal, capability::ROOM_POLL_READ, &ctx.world, Some(room)) {
        Some(poll_group(room.id, false))
    } else {
        None
    }
}

pub(crate) fn all_groups(room: RoomId) -> [String; 2] {
    [poll_group(room, false), poll_group(room, true)]
}

#[derive(Debug, Deserialize)]
struct PollRef {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    id: Uuid,
    state: PollState,
}

#[derive(Debug, Deserialize)]
struct VoteBody {
    id: Uuid,
    #[serde(default)]
    options: Vec<Uuid>,
}

fn ensure_active(room: &Room) -> Result<(), LiveError> {
    if module_active(room, module_kind::POLL) {
        Ok(())
    } else {
        Err(LiveError::module("poll.inactive"))
    }
}

fn poll_event(poll: &Poll, manager: bool) -> Event {
    Event::new("poll.created_or_updated")
        .with("room", json!(poll.room_id))
        .with("poll", poll.to_json(None, manager))
}

fn deleted_event(room: RoomId, id: Uuid) -> Event {
    Event::new("poll.deleted")
        .with("room", json!(room))
        .with("id", json!(id))
}

/// Fan a poll change out to managers and, unless the poll is managers-only,
/// to readers. `was_public` sends readers a deletion when a poll leaves
/// their view.
fn announce(outcome: Outcome, poll: &Poll, was_public: bool) -> Outcome {
    let outcome = outcome.broadcast(poll_group(poll.room_id, true), poll_event(poll, true));
    if !poll.state.managers_only() {
        outcome.broadcast(poll_group(poll.room_id, false), poll_event(poll, false))
    } else if was_public {
        outcome.broadcast(
            poll_group(poll.room_id, false),
            deleted_event(poll.room_id, poll.id),
        )
    } else {
        outcome
    }
}

async fn create(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let new_poll: NewPoll = parse_body(body)?;
    let poll = ctx.state.repository.create_poll(room.id, new_poll).await?;

    let reply = Outcome::reply(json!({"poll": poll.to_json(Some(ctx.user.id), true)}));
    Ok(announce(reply, &poll, false))
}

async fn update(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let body: UpdateBody = parse_body(body)?;
    let previous = ctx
        .state
        .repository
        .get_poll(room.id, body.id)
        .await?
        .ok_or(LiveError::NotFound("poll.unknown"))?;
    let poll = ctx
        .state
        .repository
        .update_poll_state(room.id, body.id, body.state)
        .await?;

    let reply = Outcome::reply(json!({"poll": poll.to_json(Some(ctx.user.id), true)}));
    Ok(announce(reply, &poll, !previous.state.managers_only()))
}

async fn delete(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let PollRef { id } = parse_body(body)?;
    let poll = ctx
        .state
        .repository
        .delete_poll(room.id, id)
        .await?
        .ok_or(LiveError::NotFound("poll.unknown"))?;

    let mut outcome = Outcome::reply(json!({"poll": poll.id}))
        .broadcast(poll_group(room.id, true), deleted_event(room.id, poll.id));
    if !poll.state.managers_only() {
        outcome = outcome.broadcast(poll_group(room.id, false), deleted_event(room.id, poll.id));
    }
    Ok(outcome)
}

async fn vote(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let body: VoteBody = parse_body(body)?;
    let poll = ctx
        .state
        .repository
        .vote_poll(room.id, body.id, ctx.user.id, body.options)
        .await?;

    let manager = ctx.can(capability::ROOM_POLL_MANAGE);
    Ok(
        Outcome::reply(json!({"poll": poll.to_json(Some(ctx.user.id), manager)}))
            .broadcast(poll_group(room.id, true), poll_event(&poll, true)),
    )
}

async fn list(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let manager = ctx.can(capability::ROOM_POLL_MANAGE);
    let polls: Vec<Value> = ctx
        .state
        .repository
        .list_polls(room.id)
        .await?
        .iter()
        .filter(|p| manager || !p.state.managers_only())
        .map(|p| p.to_json(Some(ctx.user.id), manager))
        .collect();
    Ok(Outcome::reply(json!(polls)))
}

fn push_poll(_ctx: &EventContext, event: &Event) -> Option<Value> {
    Some(json!({"poll": event.get("poll")?}))
}

fn push_deleted(_ctx: &EventContext, event: &Event) -> Option<Value> {
    Some(json!({"room": event.get("room")?, "id": event.get("id")?}))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::modules::Effect;
    use chrono::Utc;
    use std::collections::HashMap;

    fn poll(state: PollState) -> Poll {
        Poll {
            id: Uuid::new_v4(),
            room_id: RoomId::new(),
            content: "Tea?".to_string(),
            state,
            poll_type: crate::models::PollType::Choice,
            is_pinned: false,
            options: Vec::new(),
            votes: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    fn groups(outcome: &Outcome) -> Vec<(&str, &str)> {
        outcome
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Broadcast { group, event } => Some((group.as_str(), event.kind.as_str())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_draft_only_reaches_managers() {
        let draft = poll(PollState::Draft);
        let outcome = announce(Outcome::default(), &draft, false);
        let manage = poll_group(draft.room_id, true);
        assert_eq!(groups(&outcome), vec![(manage.as_str(), "poll.created_or_updated")]);
    }

    #[test]
    fn test_open_poll_reaches_everyone_without_results() {
        let open = poll(PollState::Open);
        let outcome = announce(Outcome::default(), &open, false);
        assert_eq!(groups(&outcome).len(), 2);

        let reader_event = outcome
            .effects
            .iter()
            .find_map(|e| match e {
                Effect::Broadcast { group, event } if *group == poll_group(open.room_id, false) => {
                    Some(event)
                }
                _ => None,
            })
            .unwrap();
        assert!(reader_event.get("poll").unwrap().get("results").is_none());
    }

    #[test]
    fn test_archiving_retracts_from_readers() {
        let archived = poll(PollState::Archived);
        let outcome = announce(Outcome::default(), &archived, true);
        let read = poll_group(archived.room_id, false);
        assert!(groups(&outcome).contains(&(read.as_str(), "poll.deleted")));
    }

    #[test]
    fn test_push_shapes() {
        let ctx = crate::modules::tests::event_context(common::types::UserId::new(), &[], None);
        let p = poll(PollState::Open);
        let pushed = push_poll(&ctx, &poll_event(&p, false)).unwrap();
        assert_eq!(pushed["poll"]["id"], json!(p.id));

        let pushed = push_deleted(&ctx, &deleted_event(p.room_id, p.id)).unwrap();
        assert_eq!(pushed, json!({"room": p.room_id, "id": p.id}));
    }
}
