//! Repository traits for domain state owned outside the live server.
//!
//! The live server never talks to a database directly; identity, world and
//! room configuration, media server records and module content are reached
//! through these traits. [`InMemoryRepository`] implements all of them and
//! can be seeded from JSON.

mod memory;

pub use memory::{InMemoryRepository, Seed};

use crate::errors::LiveError;
use crate::models::{
    Call, ChatChannel, ChatEvent, ContactRequest, Exhibitor, Poll, PollState, PollType, Question,
    QuestionState, Room, RoomView, Server, ServerKind, User, World,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::jwt::WorldClaims;
use common::types::{RoomId, UserId, WorldId};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Worlds, rooms and user identities.
#[async_trait]
pub trait WorldRepository: Send + Sync {
    async fn get_world(&self, id: &WorldId) -> Result<Option<World>, LiveError>;

    /// Rooms of a world in display order, excluding deleted ones.
    async fn list_rooms(&self, world: &WorldId) -> Result<Vec<Room>, LiveError>;

    async fn get_room(&self, world: &WorldId, room: RoomId) -> Result<Option<Room>, LiveError>;

    /// Get or create the anonymous user for a browser client id.
    async fn login_anonymous(&self, world: &WorldId, client_id: &str) -> Result<User, LiveError>;

    /// Get or create the user behind a validated token.
    async fn login_token(&self, world: &WorldId, claims: &WorldClaims) -> Result<User, LiveError>;

    /// Replace a world's title and configuration; returns the stored world.
    async fn update_world(&self, world: World) -> Result<World, LiveError>;

    /// Users of a world among `ids`; unknown ids are skipped.
    async fn get_users(&self, world: &WorldId, ids: &[UserId]) -> Result<Vec<User>, LiveError>;

    async fn update_user_profile(
        &self,
        world: &WorldId,
        user: UserId,
        profile: Value,
    ) -> Result<User, LiveError>;
}

/// Media servers and calls.
#[async_trait]
pub trait ConferencingRepository: Send + Sync {
    async fn list_servers(&self, kind: ServerKind) -> Result<Vec<Server>, LiveError>;

    async fn update_server_cost(&self, server: Uuid, cost: i64) -> Result<(), LiveError>;

    /// The room's call of the given kind, if any.
    async fn get_room_call(
        &self,
        room: RoomId,
        kind: ServerKind,
    ) -> Result<Option<Call>, LiveError>;

    /// Store a room call unless one of the same kind already exists;
    /// returns the stored call.
    async fn create_room_call(&self, call: Call) -> Result<Call, LiveError>;

    /// Move a call to a different server.
    async fn reassign_call(&self, call: Uuid, server: &Server) -> Result<Call, LiveError>;

    async fn get_call(&self, world: &WorldId, call: Uuid) -> Result<Option<Call>, LiveError>;

    async fn create_call(&self, call: Call) -> Result<Call, LiveError>;
}

/// Input for creating a poll.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPoll {
    pub content: String,
    #[serde(default)]
    pub options: Vec<NewPollOption>,
    #[serde(default = "default_poll_state")]
    pub state: PollState,
    #[serde(default = "default_poll_type")]
    pub poll_type: PollType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPollOption {
    pub content: String,
    #[serde(default)]
    pub order: Option<u32>,
}

fn default_poll_state() -> PollState {
    PollState::Draft
}

fn default_poll_type() -> PollType {
    PollType::Choice
}

/// Moderator changes to a question.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuestionUpdate {
    #[serde(default)]
    pub state: Option<QuestionState>,
    #[serde(default)]
    pub answered: Option<bool>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
}

/// Room views and module content.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn start_room_view(&self, room: RoomId, user: UserId) -> Result<RoomView, LiveError>;

    async fn end_room_view(&self, view: Uuid) -> Result<(), LiveError>;

    /// End room views open longer than `idle`, setting their end to
    /// `start + assumed_duration`. Returns the number of views closed.
    async fn close_stale_room_views(
        &self,
        now: DateTime<Utc>,
        idle: Duration,
        assumed_duration: Duration,
    ) -> Result<usize, LiveError>;

    /// A direct channel, or the chat of a live room sharing the id.
    async fn get_chat_channel(
        &self,
        world: &WorldId,
        channel: Uuid,
    ) -> Result<Option<ChatChannel>, LiveError>;

    /// The direct channel with exactly `users` as members, created if
    /// missing. `None` unless there are two or more users, all of `world`.
    /// The flag tells whether the channel was created.
    async fn get_or_create_direct_channel(
        &self,
        world: &WorldId,
        users: &BTreeSet<UserId>,
    ) -> Result<Option<(ChatChannel, bool)>, LiveError>;

    /// Returns whether the user was not a member before.
    async fn add_channel_member(&self, channel: Uuid, user: UserId) -> Result<bool, LiveError>;

    /// Returns whether the user was a member.
    async fn remove_channel_member(&self, channel: Uuid, user: UserId)
        -> Result<bool, LiveError>;

    async fn is_channel_member(&self, channel: Uuid, user: UserId) -> Result<bool, LiveError>;

    async fn channel_members(&self, channel: Uuid) -> Result<Vec<UserId>, LiveError>;

    /// Channels of a world the user is a member of.
    async fn channels_for_user(
        &self,
        world: &WorldId,
        user: UserId,
    ) -> Result<Vec<ChatChannel>, LiveError>;

    async fn append_chat_event(
        &self,
        channel: Uuid,
        sender: UserId,
        event_type: &str,
        content: Value,
        replaces: Option<u64>,
    ) -> Result<ChatEvent, LiveError>;

    async fn get_chat_event(
        &self,
        channel: Uuid,
        event_id: u64,
    ) -> Result<Option<ChatEvent>, LiveError>;

    /// Overwrite the content of a stored event.
    async fn update_chat_event(
        &self,
        channel: Uuid,
        event_id: u64,
        content: Value,
    ) -> Result<ChatEvent, LiveError>;

    /// Up to `count` events before `before_id` (exclusive), oldest first.
    async fn fetch_chat_events(
        &self,
        channel: Uuid,
        before_id: Option<u64>,
        count: usize,
    ) -> Result<Vec<ChatEvent>, LiveError>;

    /// Highest id of a non-membership event in the channel, 0 if none.
    async fn notification_pointer(&self, channel: Uuid) -> Result<u64, LiveError>;

    async fn set_read_pointer(
        &self,
        user: UserId,
        channel: Uuid,
        event_id: u64,
    ) -> Result<(), LiveError>;

    /// Channel id -> last read event id.
    async fn read_pointers(&self, user: UserId) -> Result<HashMap<Uuid, u64>, LiveError>;

    /// Mark the user as waiting for the channel's next message.
    async fn watch_unread(&self, channel: Uuid, user: UserId) -> Result<(), LiveError>;

    async fn unwatch_unread(&self, channel: Uuid, user: UserId) -> Result<(), LiveError>;

    /// Drain the users waiting for a message in the channel.
    async fn take_unread_watchers(&self, channel: Uuid) -> Result<Vec<UserId>, LiveError>;

    async fn create_poll(&self, room: RoomId, poll: NewPoll) -> Result<Poll, LiveError>;

    async fn get_poll(&self, room: RoomId, poll: Uuid) -> Result<Option<Poll>, LiveError>;

    async fn update_poll_state(
        &self,
        room: RoomId,
        poll: Uuid,
        state: PollState,
    ) -> Result<Poll, LiveError>;

    async fn delete_poll(&self, room: RoomId, poll: Uuid) -> Result<Option<Poll>, LiveError>;

    async fn list_polls(&self, room: RoomId) -> Result<Vec<Poll>, LiveError>;

    async fn vote_poll(
        &self,
        room: RoomId,
        poll: Uuid,
        user: UserId,
        options: Vec<Uuid>,
    ) -> Result<Poll, LiveError>;

    async fn create_question(
        &self,
        room: RoomId,
        sender: UserId,
        content: &str,
        state: QuestionState,
    ) -> Result<Question, LiveError>;

    async fn vote_question(
        &self,
        room: RoomId,
        question: Uuid,
        user: UserId,
    ) -> Result<Question, LiveError>;

    async fn update_question(
        &self,
        room: RoomId,
        question: Uuid,
        update: QuestionUpdate,
    ) -> Result<Question, LiveError>;

    async fn delete_question(&self, room: RoomId, question: Uuid)
        -> Result<Option<Question>, LiveError>;

    async fn list_questions(&self, room: RoomId) -> Result<Vec<Question>, LiveError>;
}

/// Exhibitors and contact requests.
#[async_trait]
pub trait ExhibitionRepository: Send + Sync {
    /// Exhibitors of a world by sorting priority, then name.
    async fn list_exhibitors(&self, world: &WorldId) -> Result<Vec<Exhibitor>, LiveError>;

    async fn get_exhibitor(
        &self,
        world: &WorldId,
        exhibitor: Uuid,
    ) -> Result<Option<Exhibitor>, LiveError>;

    /// Insert or replace an exhibitor.
    async fn save_exhibitor(&self, exhibitor: Exhibitor) -> Result<Exhibitor, LiveError>;

    async fn delete_exhibitor(
        &self,
        world: &WorldId,
        exhibitor: Uuid,
    ) -> Result<Option<Exhibitor>, LiveError>;

    async fn create_contact_request(
        &self,
        exhibitor: Uuid,
        user: UserId,
    ) -> Result<ContactRequest, LiveError>;

    async fn get_contact_request(&self, request: Uuid)
        -> Result<Option<ContactRequest>, LiveError>;

    /// Close an open request as answered by `staff`. `None` if the request
    /// is unknown or no longer open.
    async fn answer_contact_request(
        &self,
        request: Uuid,
        staff: UserId,
    ) -> Result<Option<ContactRequest>, LiveError>;

    /// Close an open request as missed. `None` if unknown or not open.
    async fn miss_contact_request(&self, request: Uuid)
        -> Result<Option<ContactRequest>, LiveError>;

    /// Open requests addressed to any of `exhibitors`.
    async fn open_contact_requests(
        &self,
        exhibitors: &[Uuid],
    ) -> Result<Vec<ContactRequest>, LiveError>;
}

/// Every repository the live server needs.
pub trait Repository:
    WorldRepository + ConferencingRepository + ContentRepository + ExhibitionRepository
{
}

impl<T> Repository for T where
    T: WorldRepository + ConferencingRepository + ContentRepository + ExhibitionRepository
{
}
