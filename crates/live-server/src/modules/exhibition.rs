//! `exhibition.*`: exhibitors, their staff and contact requests.
//!
//! Exhibition managers (`world:rooms.create.exhibition`) edit every
//! exhibitor; staff members may edit the presentation of their own. An
//! attendee's contact request rings every staff member's sessions until
//! one of them accepts it or the attendee cancels.
//!
//! Staff membership changes are announced to the affected users as
//! `exhibition.exhibition_data_update` carrying their staffed exhibitors
//! and open requests.

use super::{parse_body, CommandContext, EventContext, Guard, Outcome, RegistryBuilder};
use crate::auth::capability;
use crate::channels::groups::user_group;
use crate::channels::Event;
use crate::errors::LiveError;
use crate::models::{module_kind, ContactRequest, Exhibitor, User};
use common::types::UserId;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

/// Fields only exhibition managers may change.
const MANAGER_FIELDS: &[&str] = &["staff", "size", "name", "sorting_priority", "room_id"];

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    let manage = Guard::world(capability::WORLD_ROOMS_CREATE_EXHIBITION);
    let contact = Guard::world(capability::WORLD_EXHIBITION_CONTACT);
    let view = Guard::world(capability::WORLD_VIEW);
    builder
        .module("exhibition")
        .command("list.all", view, list_all)
        .command(
            "list",
            Guard::room_module(capability::ROOM_VIEW, module_kind::EXHIBITION),
            list,
        )
        .command("get", view, get)
        .command("get.staffed_by_user", view, staffed_by_user)
        .command("patch", view, patch)
        .command("delete", manage, delete)
        .command("contact", contact, contact_exhibitor)
        .command("contact_cancel", contact, contact_cancel)
        .command("contact_accept", view, contact_accept)
        .command("add_staff", manage, add_staff)
        .command("remove_staff", manage, remove_staff)
        .event("contact_request", push_payload)
        .event("contact_accepted", push_payload)
        .event("contact_request_close", push_payload)
        .event("exhibition_data_update", push_payload)
        .done()
}

#[derive(Debug, Deserialize)]
struct ExhibitorRef {
    exhibitor: Uuid,
}

#[derive(Debug, Deserialize)]
struct StaffedBody {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct RequestRef {
    contact_request: Uuid,
}

#[derive(Debug, Deserialize)]
struct AcceptBody {
    contact_request: Uuid,
    /// Chat channel the staff member opened for the conversation.
    channel: Value,
}

#[derive(Debug, Deserialize)]
struct StaffBody {
    exhibitor: Uuid,
    user: UserId,
}

fn unknown_exhibitor() -> LiveError {
    LiveError::module("exhibition.unknown_exhibitor")
}

fn unknown_request() -> LiveError {
    LiveError::module("exhibition.unknown_contact_request")
}

fn not_staff() -> LiveError {
    LiveError::module("exhibition.not_staff_member")
}

fn unknown_user_or_exhibitor() -> LiveError {
    LiveError::module("exhibition.unknown_user_or_exhibitor")
}

fn summaries<'a>(exhibitors: impl IntoIterator<Item = &'a Exhibitor>) -> Vec<Value> {
    exhibitors
        .into_iter()
        .map(Exhibitor::to_summary_json)
        .collect()
}

async fn load(ctx: &CommandContext, id: Uuid) -> Result<Exhibitor, LiveError> {
    ctx.state
        .repository
        .get_exhibitor(&ctx.world.id, id)
        .await?
        .ok_or_else(unknown_exhibitor)
}

async fn full_json(ctx: &CommandContext, exhibitor: &Exhibitor) -> Result<Value, LiveError> {
    let ids: Vec<UserId> = exhibitor.staff.iter().copied().collect();
    let staff = ctx
        .state
        .repository
        .get_users(&ctx.world.id, &ids)
        .await?
        .iter()
        .map(User::to_public_json)
        .collect();
    Ok(exhibitor.to_json(staff))
}

async fn request_json(
    ctx: &CommandContext,
    request: &ContactRequest,
    exhibitor: &Exhibitor,
) -> Result<Value, LiveError> {
    let user = ctx
        .state
        .repository
        .get_users(&ctx.world.id, &[request.user_id])
        .await?
        .first()
        .map(User::to_public_json);
    Ok(json!({
        "id": request.id,
        "exhibitor": exhibitor.to_summary_json(),
        "user": user,
        "state": request.state,
        "answered_by": request.answered_by,
        "timestamp": request.timestamp,
    }))
}

/// Exhibitors staffed by `user` and the open requests addressed to them.
async fn exhibition_data(ctx: &CommandContext, user: UserId) -> Result<Value, LiveError> {
    let repository = &ctx.state.repository;
    let staffed: Vec<Exhibitor> = repository
        .list_exhibitors(&ctx.world.id)
        .await?
        .into_iter()
        .filter(|e| e.staff.contains(&user))
        .collect();
    let ids: Vec<Uuid> = staffed.iter().map(|e| e.id).collect();
    let mut requests = Vec::new();
    for request in repository.open_contact_requests(&ids).await? {
        if let Some(exhibitor) = staffed.iter().find(|e| e.id == request.exhibitor_id) {
            requests.push(request_json(ctx, &request, exhibitor).await?);
        }
    }
    Ok(json!({"exhibitors": summaries(&staffed), "contact_requests": requests}))
}

/// Send every user in `users` their current exhibition data.
async fn announce_data(
    ctx: &CommandContext,
    mut outcome: Outcome,
    users: impl IntoIterator<Item = UserId>,
) -> Result<Outcome, LiveError> {
    for user in users {
        let data = exhibition_data(ctx, user).await?;
        outcome = outcome.broadcast(
            user_group(user),
            Event::new("exhibition.exhibition_data_update").with("data", data),
        );
    }
    Ok(outcome)
}

fn to_staff(mut outcome: Outcome, exhibitor: &Exhibitor, event: &Event) -> Outcome {
    for member in &exhibitor.staff {
        outcome = outcome.broadcast(user_group(*member), event.clone());
    }
    outcome
}

/// Apply `patch` to `current` (or a fresh exhibitor), skipping `excluded`.
fn apply_patch(
    ctx: &CommandContext,
    current: Option<Exhibitor>,
    mut patch: Map<String, Value>,
    excluded: &[&str],
) -> Result<Exhibitor, LiveError> {
    let mut merged = match current {
        Some(exhibitor) => match serde_json::to_value(exhibitor) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => return Err(LiveError::Internal(format!("exhibitor: {e}"))),
        },
        None => {
            let mut fresh = Map::new();
            fresh.insert("id".to_string(), json!(Uuid::new_v4()));
            fresh
        }
    };
    for key in excluded.iter().chain(&["id", "world_id"]) {
        patch.remove(*key);
    }
    merged.extend(patch);
    merged.insert("world_id".to_string(), json!(ctx.world.id));
    parse_body(Value::Object(merged))
}

async fn list_all(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let all = ctx.can(capability::WORLD_ROOMS_CREATE_EXHIBITION);
    let exhibitors = ctx.state.repository.list_exhibitors(&ctx.world.id).await?;
    let visible = exhibitors
        .iter()
        .filter(|e| all || e.staff.contains(&ctx.user.id));
    Ok(Outcome::reply(json!({"exhibitors": summaries(visible)})))
}

async fn list(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    let exhibitors = ctx.state.repository.list_exhibitors(&ctx.world.id).await?;
    let in_room = exhibitors.iter().filter(|e| e.room_id == Some(room.id));
    Ok(Outcome::reply(json!({"exhibitors": summaries(in_room)})))
}

async fn get(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let ExhibitorRef { exhibitor } = parse_body(body)?;
    let exhibitor = load(&ctx, exhibitor).await?;
    Ok(Outcome::reply(
        json!({"exhibitor": full_json(&ctx, &exhibitor).await?}),
    ))
}

async fn staffed_by_user(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let StaffedBody { user_id } = parse_body(body)?;
    let exhibitors = ctx.state.repository.list_exhibitors(&ctx.world.id).await?;
    let staffed = exhibitors.iter().filter(|e| e.staff.contains(&user_id));
    Ok(Outcome::reply(json!({"exhibitors": summaries(staffed)})))
}

async fn patch(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let patch: Map<String, Value> = parse_body(body)?;
    let id = match patch.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(v) => Some(parse_body::<Uuid>(v.clone())?),
    };
    let current = match id {
        Some(id) => Some(load(&ctx, id).await?),
        None => None,
    };
    let before: BTreeSet<UserId> = current
        .as_ref()
        .map(|e| e.staff.clone())
        .unwrap_or_default();

    let excluded: &[&str] = if ctx.can(capability::WORLD_ROOMS_CREATE_EXHIBITION) {
        &[]
    } else if before.contains(&ctx.user.id) {
        MANAGER_FIELDS
    } else {
        return Err(not_staff());
    };

    let exhibitor = apply_patch(&ctx, current, patch, excluded)?;
    if let Some(room) = exhibitor.room_id {
        ctx.state
            .repository
            .get_room(&ctx.world.id, room)
            .await?
            .filter(|r| !r.deleted)
            .ok_or(LiveError::NotFound("room.unknown"))?;
    }
    let exhibitor = ctx.state.repository.save_exhibitor(exhibitor).await?;
    info!(
        target: "live.modules",
        exhibitor_id = %exhibitor.id,
        user_id = %ctx.user.id,
        "Exhibitor saved"
    );

    let reply = Outcome::reply(json!({"exhibitor": full_json(&ctx, &exhibitor).await?}));
    let affected: BTreeSet<UserId> = before.union(&exhibitor.staff).copied().collect();
    announce_data(&ctx, reply, affected).await
}

async fn delete(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let ExhibitorRef { exhibitor } = parse_body(body)?;
    let removed = ctx
        .state
        .repository
        .delete_exhibitor(&ctx.world.id, exhibitor)
        .await?
        .ok_or_else(unknown_exhibitor)?;
    info!(
        target: "live.modules",
        exhibitor_id = %removed.id,
        user_id = %ctx.user.id,
        "Exhibitor deleted"
    );
    announce_data(&ctx, Outcome::default(), removed.staff).await
}

async fn contact_exhibitor(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let ExhibitorRef { exhibitor } = parse_body(body)?;
    let exhibitor = load(&ctx, exhibitor).await?;
    let request = ctx
        .state
        .repository
        .create_contact_request(exhibitor.id, ctx.user.id)
        .await?;
    let request = request_json(&ctx, &request, &exhibitor).await?;

    let event = Event::new("exhibition.contact_request").with("contact_request", request.clone());
    Ok(to_staff(
        Outcome::reply(json!({"contact_request": request})),
        &exhibitor,
        &event,
    ))
}

async fn contact_cancel(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let RequestRef { contact_request } = parse_body(body)?;
    let repository = &ctx.state.repository;
    let pending = repository
        .get_contact_request(contact_request)
        .await?
        .filter(|r| r.user_id == ctx.user.id)
        .ok_or_else(unknown_request)?;
    let exhibitor = load(&ctx, pending.exhibitor_id).await?;
    let request = repository
        .miss_contact_request(pending.id)
        .await?
        .ok_or_else(unknown_request)?;

    let event = Event::new("exhibition.contact_request_close")
        .with("contact_request", request_json(&ctx, &request, &exhibitor).await?);
    Ok(to_staff(Outcome::default(), &exhibitor, &event))
}

async fn contact_accept(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let AcceptBody {
        contact_request,
        channel,
    } = parse_body(body)?;
    let repository = &ctx.state.repository;
    let pending = repository
        .get_contact_request(contact_request)
        .await?
        .ok_or_else(unknown_request)?;
    let exhibitor = load(&ctx, pending.exhibitor_id).await?;
    if !exhibitor.staff.contains(&ctx.user.id) {
        return Err(not_staff());
    }
    let request = repository
        .answer_contact_request(pending.id, ctx.user.id)
        .await?
        .ok_or_else(unknown_request)?;
    let request_body = request_json(&ctx, &request, &exhibitor).await?;

    let accepted = Event::new("exhibition.contact_accepted")
        .with("contact_request", request_body.clone())
        .with("channel", channel);
    let closed =
        Event::new("exhibition.contact_request_close").with("contact_request", request_body);
    let outcome = Outcome::default().broadcast(user_group(request.user_id), accepted);
    Ok(to_staff(outcome, &exhibitor, &closed))
}

async fn add_staff(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    change_staff(ctx, body, true).await
}

async fn remove_staff(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    change_staff(ctx, body, false).await
}

async fn change_staff(ctx: CommandContext, body: Value, add: bool) -> Result<Outcome, LiveError> {
    let StaffBody { exhibitor, user } = parse_body(body)?;
    let repository = &ctx.state.repository;
    let mut exhibitor = repository
        .get_exhibitor(&ctx.world.id, exhibitor)
        .await?
        .ok_or_else(unknown_user_or_exhibitor)?;
    if repository.get_users(&ctx.world.id, &[user]).await?.is_empty() {
        return Err(unknown_user_or_exhibitor());
    }
    let changed = if add {
        exhibitor.staff.insert(user)
    } else {
        exhibitor.staff.remove(&user)
    };
    if !changed && !add {
        return Err(unknown_user_or_exhibitor());
    }
    repository.save_exhibitor(exhibitor).await?;
    announce_data(&ctx, Outcome::default(), [user]).await
}

fn push_payload(_ctx: &EventContext, event: &Event) -> Option<Value> {
    match event.kind.as_str() {
        "exhibition.exhibition_data_update" => event.get("data").cloned(),
        _ => Some(event.payload()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::modules::tests::event_context;

    #[test]
    fn test_data_update_unwraps_data() {
        let ctx = event_context(UserId::new(), &[], None);
        let event = Event::new("exhibition.exhibition_data_update")
            .with("data", json!({"exhibitors": [], "contact_requests": []}));
        assert_eq!(
            push_payload(&ctx, &event),
            Some(json!({"exhibitors": [], "contact_requests": []}))
        );

        let event = Event::new("exhibition.contact_request").with("contact_request", json!({}));
        assert_eq!(
            push_payload(&ctx, &event),
            Some(json!({"contact_request": {}}))
        );
    }

    #[test]
    fn test_manager_fields_cover_placement() {
        for field in ["room_id", "sorting_priority", "size", "staff", "name"] {
            assert!(MANAGER_FIELDS.contains(&field));
        }
        assert!(!MANAGER_FIELDS.contains(&"text"));
    }
}
