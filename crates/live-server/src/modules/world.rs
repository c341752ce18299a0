//! `world.*`: the world's title and client configuration.
//!
//! Updates are announced to every connection of the world with an empty
//! `world.updated` event. Each connection reloads the world before
//! rendering it, so secrets are filtered per receiver.

use super::{parse_body, CommandContext, EventContext, Guard, Outcome, RegistryBuilder};
use crate::auth::{can_see_secrets, capability, Principal};
use crate::channels::groups::world_group;
use crate::channels::Event;
use crate::errors::LiveError;
use crate::models::{World, WorldConfig};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

/// Event sent to the world group after an update.
pub const UPDATED: &str = "world.updated";

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .module("world")
        .command("config", Guard::world(capability::WORLD_VIEW), config)
        .command("update", Guard::world(capability::WORLD_UPDATE), update)
        .event("updated", push_updated)
        .done()
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    #[serde(default)]
    title: Option<String>,
    /// Keys replace the stored configuration's keys.
    #[serde(default)]
    config: Option<Map<String, Value>>,
}

fn world_json(world: &World, principal: &Principal) -> Value {
    json!({
        "title": world.title,
        "config": world.config.to_client_json(can_see_secrets(principal, world)),
    })
}

fn merge_config(
    current: &WorldConfig,
    patch: Map<String, Value>,
) -> Result<WorldConfig, LiveError> {
    let mut merged = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => return Err(LiveError::Internal(format!("world config: {e}"))),
    };
    merged.extend(patch);
    serde_json::from_value(Value::Object(merged))
        .map_err(|e| LiveError::module_with_message("world.invalid_config", e.to_string()))
}

async fn config(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    Ok(Outcome::reply(world_json(&ctx.world, &ctx.principal)))
}

async fn update(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let body: UpdateBody = parse_body(body)?;
    let mut world = World::clone(&ctx.world);
    if let Some(title) = body.title {
        world.title = title;
    }
    if let Some(patch) = body.config {
        world.config = merge_config(&world.config, patch)?;
    }

    let world = ctx.state.repository.update_world(world).await?;
    info!(
        target: "live.modules",
        world_id = %world.id,
        user_id = %ctx.user.id,
        "World updated"
    );
    Ok(Outcome::reply(world_json(&world, &ctx.principal))
        .broadcast(world_group(&world.id), Event::new(UPDATED)))
}

/// The receiving connection already reloaded `ctx.world`.
fn push_updated(ctx: &EventContext, _event: &Event) -> Option<Value> {
    Some(world_json(&ctx.world, &ctx.principal))
}
