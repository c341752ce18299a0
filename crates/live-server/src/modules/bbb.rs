//! `bbb.*`: BigBlueButton join links.

use super::{parse_body, CommandContext, Guard, Outcome, RegistryBuilder};
use crate::auth::capability;
use crate::errors::LiveError;
use crate::models::module_kind;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .module("bbb")
        .command(
            "room_url",
            Guard::room_module(capability::ROOM_BBB_JOIN, module_kind::BIGBLUEBUTTON),
            room_url,
        )
        .command("call_url", Guard::world(capability::WORLD_VIEW), call_url)
        .done()
}

#[derive(Debug, Deserialize)]
struct CallBody {
    call: Uuid,
}

async fn room_url(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    let moderator = ctx.can(capability::ROOM_BBB_MODERATE);
    let url = ctx
        .state
        .conferencing
        .bbb_room_url(&ctx.world, room, &ctx.user, moderator)
        .await?;
    Ok(Outcome::reply(json!({"url": url})))
}

async fn call_url(ctx: CommandContext, body: Value) -> Result<Outcome, LiveError> {
    let CallBody { call } = parse_body(body)?;
    let url = ctx
        .state
        .conferencing
        .bbb_call_url(&ctx.world, call, &ctx.user)
        .await?;
    Ok(Outcome::reply(json!({"url": url})))
}
