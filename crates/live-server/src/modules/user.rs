//! `user.*`: profiles.
//!
//! A profile change is forwarded to the user's other sessions as
//! `user.updated`; the session that made it only gets the reply.

use super::{parse_body, CommandContext, Guard, Outcome, RegistryBuilder};
use crate::auth::capability;
use crate::channels::groups::user_group;
use crate::consumer::user_broadcast;
use crate::errors::LiveError;
use common::types::UserId;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Upper bound for one `user.fetch` by ids.
const MAX_FETCH_IDS: usize = 100;

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .module("user")
        .command("update", Guard::world(capability::WORLD_VIEW), update)
        .command("fetch", Guard::world(capability::WORLD_VIEW), fetch)
        .done()
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    profile: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FetchBody {
    Many { ids: Vec<UserId> },
    One { id: UserId },
}

async fn update(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let UpdateBody { profile } = parse_body(body)?;
    let user = ctx
        .state
        .repository
        .update_user_profile(&ctx.world.id, ctx.user.id, Value::Object(profile))
        .await?;
    debug!(target: "live.modules", user_id = %user.id, "Profile updated");

    Ok(Outcome::default().broadcast(
        user_group(user.id),
        user_broadcast(Some(&ctx.socket_id), "user.updated", user.to_public_json()),
    ))
}

async fn fetch(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let repository = &ctx.state.repository;
    match parse_body(body)? {
        FetchBody::One { id } => {
            let user = repository
                .get_users(&ctx.world.id, &[id])
                .await?
                .into_iter()
                .next()
                .ok_or(LiveError::NotFound("user.not_found"))?;
            Ok(Outcome::reply(user.to_public_json()))
        }
        FetchBody::Many { mut ids } => {
            ids.truncate(MAX_FETCH_IDS);
            let users: Map<String, Value> = repository
                .get_users(&ctx.world.id, &ids)
                .await?
                .iter()
                .map(|u| (u.id.to_string(), u.to_public_json()))
                .collect();
            Ok(Outcome::reply(json!(users)))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_body_shapes() {
        let id = UserId::new();
        let one: FetchBody = serde_json::from_value(json!({"id": id})).unwrap();
        assert!(matches!(one, FetchBody::One { id: got } if got == id));
        let many: FetchBody = serde_json::from_value(json!({"ids": [id]})).unwrap();
        assert!(matches!(many, FetchBody::Many { ids } if ids == vec![id]));
        assert!(serde_json::from_value::<FetchBody>(json!({})).is_err());
    }

    #[test]
    fn test_profile_must_be_object() {
        assert!(serde_json::from_value::<UpdateBody>(json!({"profile": "x"})).is_err());
        assert!(serde_json::from_value::<UpdateBody>(json!({"profile": {}})).is_ok());
    }
}
