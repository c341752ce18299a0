//! Media server selection and call management.
//!
//! Room calls are sticky: once a call is bound to a server every later join
//! goes to that server, until the server is deactivated or stops being
//! eligible for the world, at which point the call moves to a freshly
//! selected server.

pub mod bbb;
pub mod janus;
pub mod selector;
pub mod turn;

pub use bbb::{meetings_cost, BbbClient, MeetingTelemetry};
pub use selector::{choose_server, eligible_servers, CallPurpose};
pub use turn::IceServer;

use crate::errors::LiveError;
use crate::models::{module_kind, Call, CallCredentials, Room, Server, ServerKind, User, World};
use crate::repositories::Repository;
use chrono::Utc;
use common::types::{UserId, WorldId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Room module config key naming a preferred server URL.
const PREFER_SERVER_KEY: &str = "prefer_server";

const PASSWORD_LEN: usize = 16;

/// Everything a client needs to join a Janus video room.
#[derive(Debug, Clone, Serialize)]
pub struct JanusRoom {
    pub server: String,
    #[serde(rename = "roomId")]
    pub room_id: u64,
    pub token: String,
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

/// Call lifecycle against the media server pools.
pub struct ConferencingService {
    repository: Arc<dyn Repository>,
    bbb: BbbClient,
}

impl ConferencingService {
    /// # Errors
    ///
    /// Returns `LiveError::Internal` if the HTTP client cannot be built.
    pub fn new(repository: Arc<dyn Repository>, timeout: Duration) -> Result<Self, LiveError> {
        Ok(Self {
            repository,
            bbb: BbbClient::new(timeout)?,
        })
    }

    /// BBB API client shared with the cost refresher.
    #[must_use]
    pub fn bbb(&self) -> &BbbClient {
        &self.bbb
    }

    /// Signed BBB join URL for the room's call.
    ///
    /// # Errors
    ///
    /// - `LiveError::NoCapacity` if no BBB server is eligible
    /// - `LiveError::ExternalService` if the server rejects the meeting
    pub async fn bbb_room_url(
        &self,
        world: &World,
        room: &Room,
        user: &User,
        moderator: bool,
    ) -> Result<String, LiveError> {
        let prefer = preferred_server(room, module_kind::BIGBLUEBUTTON);
        let (call, server) = self
            .room_call(world, room, ServerKind::Bbb, prefer, new_bbb_credentials)
            .await?;
        self.bbb_join(&call, &server, &room.name, user, moderator).await
    }

    /// Signed BBB join URL for a private call. Only invitees may join, and
    /// they join as moderators.
    ///
    /// # Errors
    ///
    /// - `LiveError::NotFound` if the call does not exist in this world
    /// - `LiveError::PermissionDenied` if the user is not invited
    /// - `LiveError::NoCapacity` if the call's server is gone and no other
    ///   server is eligible
    pub async fn bbb_call_url(
        &self,
        world: &World,
        call_id: Uuid,
        user: &User,
    ) -> Result<String, LiveError> {
        let call = self
            .repository
            .get_call(&world.id, call_id)
            .await?
            .filter(|c| c.kind() == ServerKind::Bbb)
            .ok_or(LiveError::NotFound("bbb.unknown_call"))?;
        if !call.invited.contains(&user.id) {
            return Err(LiveError::PermissionDenied("bbb.call_url".to_string()));
        }

        let servers = self.repository.list_servers(ServerKind::Bbb).await?;
        let (call, server) = self
            .keep_or_move(call, &servers, &world.id, None, CallPurpose::Private)
            .await?;
        self.bbb_join(&call, &server, "Call", user, true).await
    }

    /// Create a private BBB call between `invited` users.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::NoCapacity` if no BBB server accepts private calls.
    pub async fn create_private_call(
        &self,
        world: &WorldId,
        invited: Vec<UserId>,
    ) -> Result<Call, LiveError> {
        let servers = self.repository.list_servers(ServerKind::Bbb).await?;
        let server = choose_server(&servers, world, None, CallPurpose::Private)
            .ok_or(LiveError::NoCapacity(ServerKind::Bbb.as_str()))?;
        let call = Call {
            id: Uuid::new_v4(),
            world_id: world.clone(),
            room_id: None,
            server_id: server.id,
            server_url: server.url.clone(),
            credentials: new_bbb_credentials(),
            invited,
            created: Utc::now(),
        };
        self.repository.create_call(call).await
    }

    /// Janus room credentials for the room's call, with ICE servers.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::NoCapacity` if no Janus server is eligible.
    pub async fn janus_room(&self, world: &World, room: &Room) -> Result<JanusRoom, LiveError> {
        let prefer = preferred_server(room, module_kind::JANUS);
        let (call, server) = self
            .room_call(world, room, ServerKind::Janus, prefer, janus::new_room_credentials)
            .await?;
        let CallCredentials::Janus { room_id, token } = call.credentials else {
            return Err(LiveError::Internal(format!(
                "call {} has non-janus credentials",
                call.id
            )));
        };
        Ok(JanusRoom {
            server: server.url,
            room_id,
            token,
            ice_servers: self.ice_servers(&world.id).await?,
        })
    }

    /// Turn credentials for the world. Empty when no Turn server is eligible.
    ///
    /// # Errors
    ///
    /// Returns an error only if the server list cannot be read.
    pub async fn ice_servers(&self, world: &WorldId) -> Result<Vec<IceServer>, LiveError> {
        let servers = self.repository.list_servers(ServerKind::Turn).await?;
        Ok(choose_server(&servers, world, None, CallPurpose::Room)
            .map(|server| turn::turn_credentials(server, Utc::now()))
            .into_iter()
            .collect())
    }

    async fn room_call(
        &self,
        world: &World,
        room: &Room,
        kind: ServerKind,
        prefer: Option<&str>,
        credentials: fn() -> CallCredentials,
    ) -> Result<(Call, Server), LiveError> {
        let servers = self.repository.list_servers(kind).await?;

        if let Some(call) = self.repository.get_room_call(room.id, kind).await? {
            return self
                .keep_or_move(call, &servers, &world.id, prefer, CallPurpose::Room)
                .await;
        }

        let server = choose_server(&servers, &world.id, prefer, CallPurpose::Room)
            .ok_or(LiveError::NoCapacity(kind.as_str()))?;
        let call = self
            .repository
            .create_room_call(Call {
                id: Uuid::new_v4(),
                world_id: world.id.clone(),
                room_id: Some(room.id),
                server_id: server.id,
                server_url: server.url.clone(),
                credentials: credentials(),
                invited: Vec::new(),
                created: Utc::now(),
            })
            .await?;
        info!(
            target: "live.conferencing",
            room_id = %room.id,
            call_id = %call.id,
            server_id = %call.server_id,
            kind = kind.as_str(),
            "Room call bound to server"
        );

        // A concurrent join may have created the call first.
        self.keep_or_move(call, &servers, &world.id, prefer, CallPurpose::Room)
            .await
    }

    /// Keep the call on its server while that server is eligible, otherwise
    /// move it to a newly chosen one.
    async fn keep_or_move(
        &self,
        call: Call,
        servers: &[Server],
        world: &WorldId,
        prefer: Option<&str>,
        purpose: CallPurpose,
    ) -> Result<(Call, Server), LiveError> {
        let eligible = eligible_servers(servers, world, purpose);
        if let Some(server) = eligible.iter().find(|s| s.id == call.server_id) {
            return Ok((call, (*server).clone()));
        }

        let kind = call.kind();
        let server = choose_server(servers, world, prefer, purpose)
            .ok_or(LiveError::NoCapacity(kind.as_str()))?
            .clone();
        warn!(
            target: "live.conferencing",
            call_id = %call.id,
            old_server_id = %call.server_id,
            new_server_id = %server.id,
            "Call server no longer eligible, moving call"
        );
        let call = self.repository.reassign_call(call.id, &server).await?;
        Ok((call, server))
    }

    async fn bbb_join(
        &self,
        call: &Call,
        server: &Server,
        meeting_name: &str,
        user: &User,
        moderator: bool,
    ) -> Result<String, LiveError> {
        let CallCredentials::Bbb {
            meeting_id,
            attendee_pw,
            moderator_pw,
        } = &call.credentials
        else {
            return Err(LiveError::Internal(format!(
                "call {} has non-bbb credentials",
                call.id
            )));
        };

        self.bbb
            .create_meeting(
                server,
                &bbb::CreateMeeting {
                    meeting_id,
                    name: meeting_name,
                    attendee_pw,
                    moderator_pw,
                },
            )
            .await?;

        let password = if moderator { moderator_pw } else { attendee_pw };
        let url = bbb::join_url(
            server,
            meeting_id,
            &user.display_name(),
            &user.id.to_string(),
            password,
        )?;
        Ok(url.to_string())
    }
}

fn preferred_server<'a>(room: &'a Room, module: &str) -> Option<&'a str> {
    room.module(module)
        .and_then(|m| m.config.get(PREFER_SERVER_KEY))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn new_bbb_credentials() -> CallCredentials {
    CallCredentials::Bbb {
        meeting_id: Uuid::new_v4().simple().to_string(),
        attendee_pw: random_password(),
        moderator_pw: random_password(),
    }
}
