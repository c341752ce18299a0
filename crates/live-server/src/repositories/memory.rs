//! In-memory repository, optionally seeded from a JSON file.
//!
//! Used by single-node deployments and by the integration tests. All state
//! sits behind one `RwLock`; operations are short and never await while
//! holding it.

use super::{
    ConferencingRepository, ContentRepository, ExhibitionRepository, NewPoll, QuestionUpdate,
    WorldRepository,
};
use crate::errors::LiveError;
use crate::models::{
    Call, ChatChannel, ChatEvent, ContactRequest, ContactState, Exhibitor, Poll, PollOption,
    PollState, Question, QuestionState, Room, RoomView, Server, ServerKind, User, UserKind, World,
    MEMBER_EVENT,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::jwt::WorldClaims;
use common::types::{RoomId, UserId, WorldId};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Initial repository contents.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub worlds: Vec<World>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub calls: Vec<Call>,
    #[serde(default)]
    pub exhibitors: Vec<Exhibitor>,
}

impl Seed {
    /// Load a seed from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::Config` if the file is unreadable or invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LiveError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LiveError::Config(format!("cannot read seed file {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| LiveError::Config(format!("invalid seed file {}: {e}", path.display())))
    }
}

#[derive(Default)]
struct State {
    worlds: HashMap<WorldId, World>,
    rooms: HashMap<RoomId, Room>,
    users: HashMap<UserId, User>,
    servers: Vec<Server>,
    calls: HashMap<Uuid, Call>,
    room_views: HashMap<Uuid, RoomView>,
    direct_channels: HashMap<Uuid, ChatChannel>,
    channel_members: HashMap<Uuid, BTreeSet<UserId>>,
    chat: HashMap<Uuid, Vec<ChatEvent>>,
    next_chat_event: u64,
    read_pointers: HashMap<UserId, HashMap<Uuid, u64>>,
    unread_watchers: HashMap<Uuid, BTreeSet<UserId>>,
    polls: HashMap<RoomId, Vec<Poll>>,
    questions: HashMap<RoomId, Vec<Question>>,
    exhibitors: HashMap<Uuid, Exhibitor>,
    contact_requests: HashMap<Uuid, ContactRequest>,
}

impl State {
    fn chat_channel(&self, world: &WorldId, channel: Uuid) -> Option<ChatChannel> {
        if let Some(direct) = self.direct_channels.get(&channel) {
            return (&direct.world_id == world).then(|| direct.clone());
        }
        self.rooms
            .get(&RoomId(channel))
            .filter(|r| &r.world_id == world && !r.deleted)
            .map(|r| ChatChannel::for_room(r.world_id.clone(), r.id))
    }
}

/// In-memory implementation of every repository trait.
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
    #[cfg(test)]
    rooms_unavailable: std::sync::atomic::AtomicBool,
}

impl InMemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository from a seed.
    #[must_use]
    pub fn from_seed(seed: Seed) -> Self {
        let state = State {
            worlds: seed.worlds.into_iter().map(|w| (w.id.clone(), w)).collect(),
            rooms: seed.rooms.into_iter().map(|r| (r.id, r)).collect(),
            users: seed.users.into_iter().map(|u| (u.id, u)).collect(),
            servers: seed.servers,
            calls: seed.calls.into_iter().map(|c| (c.id, c)).collect(),
            exhibitors: seed.exhibitors.into_iter().map(|e| (e.id, e)).collect(),
            ..State::default()
        };
        info!(
            target: "live.repository",
            worlds = state.worlds.len(),
            rooms = state.rooms.len(),
            servers = state.servers.len(),
            "In-memory repository seeded"
        );
        Self {
            state: RwLock::new(state),
            #[cfg(test)]
            rooms_unavailable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make `list_rooms` fail until reset.
    #[cfg(test)]
    pub(crate) fn set_rooms_unavailable(&self, unavailable: bool) {
        self.rooms_unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Insert or replace a world.
    pub async fn upsert_world(&self, world: World) {
        self.state.write().await.worlds.insert(world.id.clone(), world);
    }

    /// Insert or replace a room.
    pub async fn upsert_room(&self, room: Room) {
        self.state.write().await.rooms.insert(room.id, room);
    }

    /// Insert or replace a user.
    pub async fn upsert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    /// Insert or replace a server.
    pub async fn upsert_server(&self, server: Server) {
        let mut state = self.state.write().await;
        state.servers.retain(|s| s.id != server.id);
        state.servers.push(server);
    }

    /// Room views of a room, open or closed.
    pub async fn room_views(&self, room: RoomId) -> Vec<RoomView> {
        self.state
            .read()
            .await
            .room_views
            .values()
            .filter(|v| v.room_id == room)
            .cloned()
            .collect()
    }

    /// Insert a room view directly (test helper for cleanup scenarios).
    pub async fn insert_room_view(&self, view: RoomView) {
        self.state.write().await.room_views.insert(view.id, view);
    }
}

fn poll_not_found() -> LiveError {
    LiveError::NotFound("poll.unknown")
}

fn question_not_found() -> LiveError {
    LiveError::NotFound("question.unknown")
}

#[async_trait]
impl WorldRepository for InMemoryRepository {
    async fn get_world(&self, id: &WorldId) -> Result<Option<World>, LiveError> {
        Ok(self.state.read().await.worlds.get(id).cloned())
    }

    async fn list_rooms(&self, world: &WorldId) -> Result<Vec<Room>, LiveError> {
        #[cfg(test)]
        if self
            .rooms_unavailable
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(LiveError::Repository("rooms unavailable".to_string()));
        }
        let state = self.state.read().await;
        let mut rooms: Vec<Room> = state
            .rooms
            .values()
            .filter(|r| &r.world_id == world && !r.deleted)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| {
            a.sorting_priority
                .cmp(&b.sorting_priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(rooms)
    }

    async fn get_room(&self, world: &WorldId, room: RoomId) -> Result<Option<Room>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .rooms
            .get(&room)
            .filter(|r| &r.world_id == world && !r.deleted)
            .cloned())
    }

    async fn login_anonymous(&self, world: &WorldId, client_id: &str) -> Result<User, LiveError> {
        let mut state = self.state.write().await;
        if let Some(user) = state.users.values().find(|u| {
            &u.world_id == world
                && u.kind == UserKind::Anonymous
                && u.client_id.as_deref() == Some(client_id)
        }) {
            return Ok(user.clone());
        }

        let user = User {
            id: UserId::new(),
            world_id: world.clone(),
            kind: UserKind::Anonymous,
            client_id: Some(client_id.to_string()),
            token_id: None,
            traits: Vec::new(),
            profile: json!({}),
            created: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn login_token(&self, world: &WorldId, claims: &WorldClaims) -> Result<User, LiveError> {
        let mut state = self.state.write().await;
        let existing = state
            .users
            .values_mut()
            .find(|u| &u.world_id == world && u.token_id.as_deref() == Some(claims.uid.as_str()));

        if let Some(user) = existing {
            // Traits follow the most recent token.
            user.traits.clone_from(&claims.traits);
            return Ok(user.clone());
        }

        let user = User {
            id: UserId::new(),
            world_id: world.clone(),
            kind: UserKind::Person,
            client_id: None,
            token_id: Some(claims.uid.clone()),
            traits: claims.traits.clone(),
            profile: claims.profile.clone().unwrap_or_else(|| json!({})),
            created: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_world(&self, world: World) -> Result<World, LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .worlds
            .get_mut(&world.id)
            .ok_or(LiveError::NotFound("world.unknown"))?;
        record.title = world.title;
        record.config = world.config;
        Ok(record.clone())
    }

    async fn get_users(&self, world: &WorldId, ids: &[UserId]) -> Result<Vec<User>, LiveError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.users.get(id))
            .filter(|u| &u.world_id == world)
            .cloned()
            .collect())
    }

    async fn update_user_profile(
        &self,
        world: &WorldId,
        user: UserId,
        profile: Value,
    ) -> Result<User, LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .users
            .get_mut(&user)
            .filter(|u| &u.world_id == world)
            .ok_or(LiveError::NotFound("user.unknown"))?;
        record.profile = profile;
        Ok(record.clone())
    }
}

#[async_trait]
impl ConferencingRepository for InMemoryRepository {
    async fn list_servers(&self, kind: ServerKind) -> Result<Vec<Server>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .servers
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect())
    }

    async fn update_server_cost(&self, server: Uuid, cost: i64) -> Result<(), LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .servers
            .iter_mut()
            .find(|s| s.id == server)
            .ok_or(LiveError::NotFound("server.unknown"))?;
        record.cost = cost;
        Ok(())
    }

    async fn get_room_call(
        &self,
        room: RoomId,
        kind: ServerKind,
    ) -> Result<Option<Call>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .calls
            .values()
            .find(|c| c.room_id == Some(room) && c.kind() == kind)
            .cloned())
    }

    async fn create_room_call(&self, call: Call) -> Result<Call, LiveError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .calls
            .values()
            .find(|c| c.room_id.is_some() && c.room_id == call.room_id && c.kind() == call.kind())
        {
            return Ok(existing.clone());
        }
        state.calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn reassign_call(&self, call: Uuid, server: &Server) -> Result<Call, LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .calls
            .get_mut(&call)
            .ok_or(LiveError::NotFound("call.unknown"))?;
        record.server_id = server.id;
        record.server_url.clone_from(&server.url);
        Ok(record.clone())
    }

    async fn get_call(&self, world: &WorldId, call: Uuid) -> Result<Option<Call>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .calls
            .get(&call)
            .filter(|c| &c.world_id == world)
            .cloned())
    }

    async fn create_call(&self, call: Call) -> Result<Call, LiveError> {
        self.state.write().await.calls.insert(call.id, call.clone());
        Ok(call)
    }
}

#[async_trait]
impl ContentRepository for InMemoryRepository {
    async fn start_room_view(&self, room: RoomId, user: UserId) -> Result<RoomView, LiveError> {
        let view = RoomView {
            id: Uuid::new_v4(),
            room_id: room,
            user_id: user,
            start: Utc::now(),
            end: None,
        };
        self.state
            .write()
            .await
            .room_views
            .insert(view.id, view.clone());
        Ok(view)
    }

    async fn end_room_view(&self, view: Uuid) -> Result<(), LiveError> {
        if let Some(record) = self.state.write().await.room_views.get_mut(&view) {
            if record.end.is_none() {
                record.end = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn close_stale_room_views(
        &self,
        now: DateTime<Utc>,
        idle: Duration,
        assumed_duration: Duration,
    ) -> Result<usize, LiveError> {
        let idle = chrono::Duration::from_std(idle)
            .map_err(|e| LiveError::Internal(format!("idle threshold out of range: {e}")))?;
        let assumed = chrono::Duration::from_std(assumed_duration)
            .map_err(|e| LiveError::Internal(format!("assumed duration out of range: {e}")))?;

        let mut state = self.state.write().await;
        let mut closed = 0;
        for view in state.room_views.values_mut() {
            if view.end.is_none() && now - view.start > idle {
                view.end = Some(view.start + assumed);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn get_chat_channel(
        &self,
        world: &WorldId,
        channel: Uuid,
    ) -> Result<Option<ChatChannel>, LiveError> {
        Ok(self.state.read().await.chat_channel(world, channel))
    }

    async fn get_or_create_direct_channel(
        &self,
        world: &WorldId,
        users: &BTreeSet<UserId>,
    ) -> Result<Option<(ChatChannel, bool)>, LiveError> {
        let mut state = self.state.write().await;
        let all_known = users
            .iter()
            .all(|id| state.users.get(id).is_some_and(|u| &u.world_id == world));
        if users.len() < 2 || !all_known {
            return Ok(None);
        }

        let existing = state
            .direct_channels
            .values()
            .filter(|c| &c.world_id == world)
            .find(|c| state.channel_members.get(&c.id) == Some(users))
            .cloned();
        if let Some(channel) = existing {
            return Ok(Some((channel, false)));
        }

        let channel = ChatChannel {
            id: Uuid::new_v4(),
            world_id: world.clone(),
            room_id: None,
        };
        state.direct_channels.insert(channel.id, channel.clone());
        state.channel_members.insert(channel.id, users.clone());
        Ok(Some((channel, true)))
    }

    async fn add_channel_member(&self, channel: Uuid, user: UserId) -> Result<bool, LiveError> {
        Ok(self
            .state
            .write()
            .await
            .channel_members
            .entry(channel)
            .or_default()
            .insert(user))
    }

    async fn remove_channel_member(
        &self,
        channel: Uuid,
        user: UserId,
    ) -> Result<bool, LiveError> {
        Ok(self
            .state
            .write()
            .await
            .channel_members
            .get_mut(&channel)
            .is_some_and(|members| members.remove(&user)))
    }

    async fn is_channel_member(&self, channel: Uuid, user: UserId) -> Result<bool, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .channel_members
            .get(&channel)
            .is_some_and(|members| members.contains(&user)))
    }

    async fn channel_members(&self, channel: Uuid) -> Result<Vec<UserId>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .channel_members
            .get(&channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn channels_for_user(
        &self,
        world: &WorldId,
        user: UserId,
    ) -> Result<Vec<ChatChannel>, LiveError> {
        let state = self.state.read().await;
        let mut channels: Vec<ChatChannel> = state
            .channel_members
            .iter()
            .filter(|(_, members)| members.contains(&user))
            .filter_map(|(id, _)| state.chat_channel(world, *id))
            .collect();
        channels.sort_by_key(|c| c.id);
        Ok(channels)
    }

    async fn append_chat_event(
        &self,
        channel: Uuid,
        sender: UserId,
        event_type: &str,
        content: Value,
        replaces: Option<u64>,
    ) -> Result<ChatEvent, LiveError> {
        let mut state = self.state.write().await;
        state.next_chat_event += 1;
        let event = ChatEvent {
            event_id: state.next_chat_event,
            channel,
            sender,
            event_type: event_type.to_string(),
            content,
            replaces,
            timestamp: Utc::now(),
        };
        state.chat.entry(channel).or_default().push(event.clone());
        Ok(event)
    }

    async fn get_chat_event(
        &self,
        channel: Uuid,
        event_id: u64,
    ) -> Result<Option<ChatEvent>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .chat
            .get(&channel)
            .and_then(|events| events.iter().find(|e| e.event_id == event_id))
            .cloned())
    }

    async fn update_chat_event(
        &self,
        channel: Uuid,
        event_id: u64,
        content: Value,
    ) -> Result<ChatEvent, LiveError> {
        let mut state = self.state.write().await;
        let event = state
            .chat
            .get_mut(&channel)
            .and_then(|events| events.iter_mut().find(|e| e.event_id == event_id))
            .ok_or(LiveError::NotFound("chat.unknown_event"))?;
        event.content = content;
        Ok(event.clone())
    }

    async fn fetch_chat_events(
        &self,
        channel: Uuid,
        before_id: Option<u64>,
        count: usize,
    ) -> Result<Vec<ChatEvent>, LiveError> {
        let state = self.state.read().await;
        let Some(events) = state.chat.get(&channel) else {
            return Ok(Vec::new());
        };
        let mut selected: Vec<ChatEvent> = events
            .iter()
            .rev()
            .filter(|e| before_id.map_or(true, |b| e.event_id < b))
            .take(count)
            .cloned()
            .collect();
        selected.reverse();
        Ok(selected)
    }

    async fn notification_pointer(&self, channel: Uuid) -> Result<u64, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .chat
            .get(&channel)
            .and_then(|events| {
                events
                    .iter()
                    .filter(|e| e.event_type != MEMBER_EVENT)
                    .map(|e| e.event_id)
                    .max()
            })
            .unwrap_or(0))
    }

    async fn set_read_pointer(
        &self,
        user: UserId,
        channel: Uuid,
        event_id: u64,
    ) -> Result<(), LiveError> {
        self.state
            .write()
            .await
            .read_pointers
            .entry(user)
            .or_default()
            .insert(channel, event_id);
        Ok(())
    }

    async fn read_pointers(&self, user: UserId) -> Result<HashMap<Uuid, u64>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .read_pointers
            .get(&user)
            .cloned()
            .unwrap_or_default())
    }

    async fn watch_unread(&self, channel: Uuid, user: UserId) -> Result<(), LiveError> {
        self.state
            .write()
            .await
            .unread_watchers
            .entry(channel)
            .or_default()
            .insert(user);
        Ok(())
    }

    async fn unwatch_unread(&self, channel: Uuid, user: UserId) -> Result<(), LiveError> {
        if let Some(watchers) = self.state.write().await.unread_watchers.get_mut(&channel) {
            watchers.remove(&user);
        }
        Ok(())
    }

    async fn take_unread_watchers(&self, channel: Uuid) -> Result<Vec<UserId>, LiveError> {
        Ok(self
            .state
            .write()
            .await
            .unread_watchers
            .remove(&channel)
            .map(|watchers| watchers.into_iter().collect())
            .unwrap_or_default())
    }

    async fn create_poll(&self, room: RoomId, poll: NewPoll) -> Result<Poll, LiveError> {
        if poll.content.trim().is_empty() {
            return Err(LiveError::module_with_message(
                "poll.invalid",
                "A poll needs a question.",
            ));
        }
        let options = poll
            .options
            .into_iter()
            .enumerate()
            .map(|(i, o)| PollOption {
                id: Uuid::new_v4(),
                content: o.content,
                order: o
                    .order
                    .unwrap_or_else(|| u32::try_from(i + 1).unwrap_or(u32::MAX)),
            })
            .collect();
        let record = Poll {
            id: Uuid::new_v4(),
            room_id: room,
            content: poll.content,
            state: poll.state,
            poll_type: poll.poll_type,
            is_pinned: false,
            options,
            votes: HashMap::new(),
            timestamp: Utc::now(),
        };
        self.state
            .write()
            .await
            .polls
            .entry(room)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn get_poll(&self, room: RoomId, poll: Uuid) -> Result<Option<Poll>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .polls
            .get(&room)
            .and_then(|polls| polls.iter().find(|p| p.id == poll))
            .cloned())
    }

    async fn update_poll_state(
        &self,
        room: RoomId,
        poll: Uuid,
        new_state: PollState,
    ) -> Result<Poll, LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .polls
            .get_mut(&room)
            .and_then(|polls| polls.iter_mut().find(|p| p.id == poll))
            .ok_or_else(poll_not_found)?;
        record.state = new_state;
        Ok(record.clone())
    }

    async fn delete_poll(&self, room: RoomId, poll: Uuid) -> Result<Option<Poll>, LiveError> {
        let mut state = self.state.write().await;
        let Some(polls) = state.polls.get_mut(&room) else {
            return Ok(None);
        };
        let position = polls.iter().position(|p| p.id == poll);
        Ok(position.map(|i| polls.remove(i)))
    }

    async fn list_polls(&self, room: RoomId) -> Result<Vec<Poll>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .polls
            .get(&room)
            .cloned()
            .unwrap_or_default())
    }

    async fn vote_poll(
        &self,
        room: RoomId,
        poll: Uuid,
        user: UserId,
        options: Vec<Uuid>,
    ) -> Result<Poll, LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .polls
            .get_mut(&room)
            .and_then(|polls| polls.iter_mut().find(|p| p.id == poll))
            .ok_or_else(poll_not_found)?;
        record
            .vote(user, options)
            .map_err(|reason| LiveError::module_with_message("poll.vote", reason))?;
        Ok(record.clone())
    }

    async fn create_question(
        &self,
        room: RoomId,
        sender: UserId,
        content: &str,
        question_state: QuestionState,
    ) -> Result<Question, LiveError> {
        if content.trim().is_empty() {
            return Err(LiveError::module_with_message(
                "question.invalid",
                "A question cannot be empty.",
            ));
        }
        let question = Question {
            id: Uuid::new_v4(),
            room_id: room,
            sender,
            content: content.to_string(),
            state: question_state,
            answered: false,
            is_pinned: false,
            votes: BTreeSet::new(),
            timestamp: Utc::now(),
        };
        self.state
            .write()
            .await
            .questions
            .entry(room)
            .or_default()
            .push(question.clone());
        Ok(question)
    }

    async fn vote_question(
        &self,
        room: RoomId,
        question: Uuid,
        user: UserId,
    ) -> Result<Question, LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .questions
            .get_mut(&room)
            .and_then(|qs| qs.iter_mut().find(|q| q.id == question))
            .ok_or_else(question_not_found)?;
        if record.state != QuestionState::Visible {
            return Err(LiveError::module_with_message(
                "question.vote",
                "Only visible questions can be voted on.",
            ));
        }
        record.votes.insert(user);
        Ok(record.clone())
    }

    async fn update_question(
        &self,
        room: RoomId,
        question: Uuid,
        update: QuestionUpdate,
    ) -> Result<Question, LiveError> {
        let mut state = self.state.write().await;
        let record = state
            .questions
            .get_mut(&room)
            .and_then(|qs| qs.iter_mut().find(|q| q.id == question))
            .ok_or_else(question_not_found)?;
        if let Some(new_state) = update.state {
            record.state = new_state;
        }
        if let Some(answered) = update.answered {
            record.answered = answered;
        }
        if let Some(pinned) = update.is_pinned {
            record.is_pinned = pinned;
        }
        Ok(record.clone())
    }

    async fn delete_question(
        &self,
        room: RoomId,
        question: Uuid,
    ) -> Result<Option<Question>, LiveError> {
        let mut state = self.state.write().await;
        let Some(questions) = state.questions.get_mut(&room) else {
            return Ok(None);
        };
        let position = questions.iter().position(|q| q.id == question);
        Ok(position.map(|i| questions.remove(i)))
    }

    async fn list_questions(&self, room: RoomId) -> Result<Vec<Question>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .questions
            .get(&room)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExhibitionRepository for InMemoryRepository {
    async fn list_exhibitors(&self, world: &WorldId) -> Result<Vec<Exhibitor>, LiveError> {
        let state = self.state.read().await;
        let mut exhibitors: Vec<Exhibitor> = state
            .exhibitors
            .values()
            .filter(|e| &e.world_id == world)
            .cloned()
            .collect();
        exhibitors.sort_by(|a, b| {
            a.sorting_priority
                .cmp(&b.sorting_priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(exhibitors)
    }

    async fn get_exhibitor(
        &self,
        world: &WorldId,
        exhibitor: Uuid,
    ) -> Result<Option<Exhibitor>, LiveError> {
        Ok(self
            .state
            .read()
            .await
            .exhibitors
            .get(&exhibitor)
            .filter(|e| &e.world_id == world)
            .cloned())
    }

    async fn save_exhibitor(&self, exhibitor: Exhibitor) -> Result<Exhibitor, LiveError> {
        self.state
            .write()
            .await
            .exhibitors
            .insert(exhibitor.id, exhibitor.clone());
        Ok(exhibitor)
    }

    async fn delete_exhibitor(
        &self,
        world: &WorldId,
        exhibitor: Uuid,
    ) -> Result<Option<Exhibitor>, LiveError> {
        let mut state = self.state.write().await;
        if !state
            .exhibitors
            .get(&exhibitor)
            .is_some_and(|e| &e.world_id == world)
        {
            return Ok(None);
        }
        state
            .contact_requests
            .retain(|_, r| r.exhibitor_id != exhibitor);
        Ok(state.exhibitors.remove(&exhibitor))
    }

    async fn create_contact_request(
        &self,
        exhibitor: Uuid,
        user: UserId,
    ) -> Result<ContactRequest, LiveError> {
        let request = ContactRequest {
            id: Uuid::new_v4(),
            exhibitor_id: exhibitor,
            user_id: user,
            state: ContactState::Open,
            answered_by: None,
            timestamp: Utc::now(),
        };
        self.state
            .write()
            .await
            .contact_requests
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_contact_request(
        &self,
        request: Uuid,
    ) -> Result<Option<ContactRequest>, LiveError> {
        Ok(self.state.read().await.contact_requests.get(&request).cloned())
    }

    async fn answer_contact_request(
        &self,
        request: Uuid,
        staff: UserId,
    ) -> Result<Option<ContactRequest>, LiveError> {
        let mut state = self.state.write().await;
        let Some(record) = state
            .contact_requests
            .get_mut(&request)
            .filter(|r| r.state == ContactState::Open)
        else {
            return Ok(None);
        };
        record.state = ContactState::Answered;
        record.answered_by = Some(staff);
        Ok(Some(record.clone()))
    }

    async fn miss_contact_request(
        &self,
        request: Uuid,
    ) -> Result<Option<ContactRequest>, LiveError> {
        let mut state = self.state.write().await;
        let Some(record) = state
            .contact_requests
            .get_mut(&request)
            .filter(|r| r.state == ContactState::Open)
        else {
            return Ok(None);
        };
        record.state = ContactState::Missed;
        Ok(Some(record.clone()))
    }

    async fn open_contact_requests(
        &self,
        exhibitors: &[Uuid],
    ) -> Result<Vec<ContactRequest>, LiveError> {
        let wanted: HashSet<&Uuid> = exhibitors.iter().collect();
        let mut requests: Vec<ContactRequest> = self
            .state
            .read()
            .await
            .contact_requests
            .values()
            .filter(|r| r.state == ContactState::Open && wanted.contains(&r.exhibitor_id))
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.timestamp);
        Ok(requests)
    }
}
