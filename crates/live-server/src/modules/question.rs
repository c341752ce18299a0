//! `question.*`: audience Q&A.
//!
//! Moderators subscribe to `room.{id}.question.moderate` and see every
//! question. Readers subscribe to `room.{id}.question` and see visible
//! questions; askers also get their own queued questions through their
//! user group. With `config.requires_moderation` new questions wait in the
//! moderation queue.

use super::{
    module_active, parse_body, CommandContext, EventContext, Guard, Outcome, RegistryBuilder,
};
use crate::auth::{capability, has_permission};
use crate::channels::groups::{question_group, user_group};
use crate::channels::Event;
use crate::errors::LiveError;
use crate::models::{module_kind, Question, QuestionState, Room};
use crate::repositories::QuestionUpdate;
use common::types::RoomId;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    let moderate = Guard::room_module(capability::ROOM_QUESTION_MODERATE, module_kind::QUESTION);
    builder
        .module("question")
        .command(
            "ask",
            Guard::room_module(capability::ROOM_QUESTION_ASK, module_kind::QUESTION),
            ask,
        )
        .command(
            "vote",
            Guard::room_module(capability::ROOM_QUESTION_VOTE, module_kind::QUESTION),
            vote,
        )
        .command(
            "list",
            Guard::room_module(capability::ROOM_QUESTION_READ, module_kind::QUESTION),
            list,
        )
        .command("update", moderate, update)
        .command("delete", moderate, delete)
        .event("question", push_question)
        .event("deleted", push_deleted)
        .done()
}

/// The question group a connection entering `room` joins, if any.
pub(crate) fn subscription_group(ctx: &CommandContext, room: &Room) -> Option<String> {
    room.module(module_kind::QUESTION)?;
    if has_permission(
        &ctx.principal,
        capability::ROOM_QUESTION_MODERATE,
        &ctx.world,
        Some(room),
    ) {
        Some(question_group(room.id, true))
    } else if has_permission(&ctx.principal, capability::ROOM_QUESTION_READ, &ctx.world, Some(room))
    {
        Some(question_group(room.id, false))
    } else {
        None
    }
}

pub(crate) fn all_groups(room: RoomId) -> [String; 2] {
    [question_group(room, false), question_group(room, true)]
}

#[derive(Debug, Deserialize)]
struct AskBody {
    content: String,
}

#[derive(Debug, Deserialize)]
struct QuestionRef {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    id: Uuid,
    #[serde(flatten)]
    update: QuestionUpdate,
}

fn ensure_active(room: &Room) -> Result<(), LiveError> {
    if module_active(room, module_kind::QUESTION) {
        Ok(())
    } else {
        Err(LiveError::module("question.inactive"))
    }
}

fn requires_moderation(room: &Room) -> bool {
    room.module(module_kind::QUESTION)
        .and_then(|m| m.config.get("requires_moderation"))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

fn question_event(question: &Question) -> Event {
    Event::new("question.question")
        .with("room", json!(question.room_id))
        .with("sender", json!(question.sender))
        .with("question", question.to_json(None))
}

fn deleted_event(room: RoomId, id: Uuid) -> Event {
    Event::new("question.deleted")
        .with("room", json!(room))
        .with("id", json!(id))
}

/// Fan a question change out. `was_visible` retracts it from readers when
/// it leaves the visible state.
fn announce(outcome: Outcome, question: &Question, was_visible: bool) -> Outcome {
    let room = question.room_id;
    let outcome = outcome.broadcast(question_group(room, true), question_event(question));
    if question.state == QuestionState::Visible {
        return outcome.broadcast(question_group(room, false), question_event(question));
    }
    let outcome = outcome.broadcast(user_group(question.sender), question_event(question));
    if was_visible {
        outcome.broadcast(question_group(room, false), deleted_event(room, question.id))
    } else {
        outcome
    }
}

async fn ask(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let AskBody { content } = parse_body(body)?;
    let state = if requires_moderation(room) {
        QuestionState::ModQueue
    } else {
        QuestionState::Visible
    };
    let question = ctx
        .state
        .repository
        .create_question(room.id, ctx.user.id, &content, state)
        .await?;

    let reply = Outcome::reply(json!({"question": question.to_json(Some(ctx.user.id))}));
    Ok(announce(reply, &question, false))
}

async fn vote(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let QuestionRef { id } = parse_body(body)?;
    let question = ctx
        .state
        .repository
        .vote_question(room.id, id, ctx.user.id)
        .await?;

    let reply = Outcome::reply(json!({"question": question.to_json(Some(ctx.user.id))}));
    Ok(announce(reply, &question, true))
}

async fn list(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let moderator = ctx.can(capability::ROOM_QUESTION_MODERATE);
    let questions: Vec<Value> = ctx
        .state
        .repository
        .list_questions(room.id)
        .await?
        .iter()
        .filter(|q| moderator || q.state == QuestionState::Visible || q.sender == ctx.user.id)
        .map(|q| q.to_json(Some(ctx.user.id)))
        .collect();
    Ok(Outcome::reply(json!(questions)))
}

async fn update(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let UpdateBody { id, update } = parse_body(body)?;
    let previous = ctx
        .state
        .repository
        .list_questions(room.id)
        .await?
        .into_iter()
        .find(|q| q.id == id)
        .ok_or(LiveError::NotFound("question.unknown"))?;
    let question = ctx
        .state
        .repository
        .update_question(room.id, id, update)
        .await?;

    let reply = Outcome::reply(json!({"question": question.to_json(Some(ctx.user.id))}));
    Ok(announce(
        reply,
        &question,
        previous.state == QuestionState::Visible,
    ))
}

async fn delete(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    ensure_active(room)?;
    let QuestionRef { id } = parse_body(body)?;
    let question = ctx
        .state
        .repository
        .delete_question(room.id, id)
        .await?
        .ok_or(LiveError::NotFound("question.unknown"))?;

    Ok(Outcome::reply(json!({"question": question.id}))
        .broadcast(question_group(room.id, true), deleted_event(room.id, question.id))
        .broadcast(question_group(room.id, false), deleted_event(room.id, question.id))
        .broadcast(user_group(question.sender), deleted_event(room.id, question.id)))
}

/// Adds `own` for the receiving user; the sender id itself is not pushed.
fn push_question(ctx: &EventContext, event: &Event) -> Option<Value> {
    let mut question = event.get("question")?.clone();
    let own = event
        .get("sender")
        .is_some_and(|s| *s == json!(ctx.user_id));
    question.as_object_mut()?.insert("own".to_string(), json!(own));
    Some(json!({"question": question}))
}

fn push_deleted(_ctx: &EventContext, event: &Event) -> Option<Value> {
    Some(json!({"room": event.get("room")?, "id": event.get("id")?}))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::modules::tests::event_context;
    use crate::modules::Effect;
    use chrono::Utc;
    use common::types::UserId;
    use std::collections::BTreeSet;

    fn question(state: QuestionState) -> Question {
        Question {
            id: Uuid::new_v4(),
            room_id: RoomId::new(),
            sender: UserId::new(),
            content: "Why?".to_string(),
            state,
            answered: false,
            is_pinned: false,
            votes: BTreeSet::new(),
            timestamp: Utc::now(),
        }
    }

    fn targets(outcome: &Outcome) -> Vec<(String, String)> {
        outcome
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Broadcast { group, event } => Some((group.clone(), event.kind.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_queued_question_reaches_moderators_and_sender() {
        let q = question(QuestionState::ModQueue);
        let sent = targets(&announce(Outcome::default(), &q, false));
        assert_eq!(
            sent,
            vec![
                (question_group(q.room_id, true), "question.question".to_string()),
                (user_group(q.sender), "question.question".to_string()),
            ]
        );
    }

    #[test]
    fn test_visible_question_reaches_readers() {
        let q = question(QuestionState::Visible);
        let sent = targets(&announce(Outcome::default(), &q, false));
        assert!(sent.contains(&(question_group(q.room_id, false), "question.question".to_string())));
    }

    #[test]
    fn test_archiving_visible_question_retracts_it() {
        let q = question(QuestionState::Archived);
        let sent = targets(&announce(Outcome::default(), &q, true));
        assert!(sent.contains(&(question_group(q.room_id, false), "question.deleted".to_string())));
    }

    #[test]
    fn test_push_marks_own_questions() {
        let q = question(QuestionState::Visible);
        let event = question_event(&q);

        let asker = event_context(q.sender, &[], None);
        let other = event_context(UserId::new(), &[], None);
        assert_eq!(push_question(&asker, &event).unwrap()["question"]["own"], json!(true));
        assert_eq!(push_question(&other, &event).unwrap()["question"]["own"], json!(false));
        assert!(push_question(&other, &event).unwrap().get("sender").is_none());
    }
}
