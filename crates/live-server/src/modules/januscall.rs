//! `januscall.*`: Janus video rooms and Turn credentials.

use super::{CommandContext, Guard, Outcome, RegistryBuilder};
use crate::auth::capability;
use crate::errors::LiveError;
use crate::models::module_kind;
use serde_json::{json, Value};

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .module("januscall")
        .command(
            "room_url",
            Guard::room_module(capability::ROOM_JANUSCALL_JOIN, module_kind::JANUS),
            room_url,
        )
        .command("ice_servers", Guard::world(capability::WORLD_VIEW), ice_servers)
        .done()
}

async fn room_url(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let room = ctx.room()?;
    let janus = ctx.state.conferencing.janus_room(&ctx.world, room).await?;
    Ok(Outcome::reply(json!(janus)))
}

async fn ice_servers(ctx: CommandContext, _body: Value) -> Result<Outcome, LiveError> {
    let servers = ctx.state.conferencing.ice_servers(&ctx.world.id).await?;
    Ok(Outcome::reply(json!(servers)))
}
