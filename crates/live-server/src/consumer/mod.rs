//! Per-connection protocol state machine.
//!
//! A [`Consumer`] owns one client session. The transport feeds it text
//! frames and drains [`Outbound`] messages; the consumer parses frames,
//! authenticates, dispatches commands through the module registry, applies
//! their effects and renders channel layer events for the client.
//!
//! # Lifecycle
//!
//! 1. [`Consumer::connect`] creates a channel, joins the deployment's
//!    version group and registers the connection
//! 2. Only `authenticate` and `ping` are accepted until login succeeds
//! 3. [`Consumer::run`] loops until the client leaves, a control event
//!    closes the session, the connection outlives its group memberships or
//!    the server shuts down
//! 4. Disconnect ends open room views, leaves every group and unregisters

use crate::auth::{authenticate, can_see_secrets, capability, has_permission, Identity, Principal};
use crate::channels::groups::{user_group, version_group, world_group};
use crate::channels::{ChannelReceiver, Event};
use crate::errors::{LiveError, ProtocolError};
use crate::models::{User, World};
use crate::modules::{authorize, chat, world, CommandContext, Effect, EventContext, Outcome};
use crate::observability::metrics;
use crate::protocol::{
    error_frame, error_frame_for, push_frame, success_frame, ClientFrame, AUTHENTICATE, PING,
};
use crate::registry::{channels_to_evict, RefreshThrottle};
use crate::state::AppState;
use common::types::{RoomId, UserId};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Control event types handled by the consumer itself.
pub mod control {
    /// Close the connection immediately.
    pub const DROP: &str = "connection.drop";
    /// Ask the client to reload, then close.
    pub const RELOAD: &str = "connection.reload";
    /// The session was evicted by a newer one of the same user.
    pub const REPLACED: &str = "connection.replaced";
    /// Forward a push to every session of a user except the originating one.
    pub const USER_BROADCAST: &str = "user.broadcast";
}

/// Delay between `connection.reload` and the close.
pub const RELOAD_CLOSE_DELAY: Duration = Duration::from_secs(2);

/// Delay between `connection.replaced` and the close.
pub const REPLACED_CLOSE_DELAY: Duration = Duration::from_millis(500);

/// Message for the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Value),
    Close,
}

/// Build a `user.broadcast` event: `kind`/`data` are pushed to every
/// session of the user except the `origin` socket. Without an origin every
/// session receives it.
#[must_use]
pub fn user_broadcast(origin: Option<&str>, kind: &str, data: Value) -> Event {
    Event::new(control::USER_BROADCAST)
        .with("socket", json!(origin))
        .with("event_type", json!(kind))
        .with("data", data)
}

struct Session {
    user: Arc<User>,
    principal: Arc<Principal>,
}

enum Flow {
    Continue,
    Close,
}

/// One client session.
pub struct Consumer {
    state: Arc<AppState>,
    world: Arc<World>,
    channel: String,
    socket_id: String,
    outbound: mpsc::Sender<Outbound>,
    session: Option<Session>,
    /// Open room view per entered room.
    room_views: HashMap<RoomId, Uuid>,
    throttle: RefreshThrottle,
    close_at: Option<Instant>,
}

impl Consumer {
    /// Open a session for `world`.
    ///
    /// Returns the consumer and the mailbox of its channel.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::Store` if the connection cannot be registered.
    pub async fn connect(
        state: Arc<AppState>,
        world: Arc<World>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<(Self, mpsc::Receiver<Event>), LiveError> {
        let ChannelReceiver { name, events } = state.layer.new_channel().await;

        let registered = async {
            state
                .layer
                .group_add(&version_group(state.registry.label()), &name)
                .await?;
            state.registry.register_connection().await
        }
        .await;
        if let Err(e) = registered {
            state.layer.close_channel(&name).await;
            return Err(e.into());
        }

        metrics::connection_opened();
        let socket_id = Uuid::new_v4().to_string();
        info!(
            target: "live.consumer",
            world_id = %world.id,
            channel = %name,
            socket_id = %socket_id,
            "Connection opened"
        );

        Ok((
            Self {
                state,
                world,
                channel: name,
                socket_id,
                outbound,
                session: None,
                room_views: HashMap::new(),
                throttle: RefreshThrottle::new(Instant::now()),
                close_at: None,
            },
            events,
        ))
    }

    /// Channel layer name of this session.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Socket id used to suppress echoes of `user.broadcast`.
    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Process frames and events until the session ends, then clean up.
    #[instrument(
        skip_all,
        name = "live.consumer",
        fields(world_id = %self.world.id, channel = %self.channel)
    )]
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<String>,
        mut events: mpsc::Receiver<Event>,
        cancel_token: CancellationToken,
    ) {
        // Close before group memberships expire so no session silently
        // stops receiving broadcasts.
        let max_age = self
            .state
            .config
            .group_expiry()
            .mul_f64(rand::thread_rng().gen_range(0.9..1.0));
        let expired = sleep(max_age);
        tokio::pin!(expired);

        loop {
            let close_at = self.close_at;
            let flow = tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(target: "live.consumer", "Server shutting down, closing connection");
                    Flow::Close
                }
                () = &mut expired => {
                    debug!(target: "live.consumer", "Connection reached its maximum age");
                    Flow::Close
                }
                () = sleep_until(close_at.unwrap_or_else(Instant::now)), if close_at.is_some() => {
                    Flow::Close
                }
                text = inbound.recv() => match text {
                    Some(text) => self.handle_text(&text).await,
                    None => Flow::Close,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => Flow::Close,
                },
            };
            if matches!(flow, Flow::Close) {
                break;
            }
        }

        self.disconnect().await;
    }

    async fn send(&self, frame: Value) {
        if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
            debug!(
                target: "live.consumer",
                channel = %self.channel,
                "Transport gone, dropping frame"
            );
        }
    }

    async fn send_error(&self, request_id: Option<&Value>, error: &LiveError) {
        self.send(error_frame_for(request_id, error)).await;
    }

    async fn handle_text(&mut self, text: &str) -> Flow {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: "live.consumer", error = %e, "Malformed frame");
                self.send_error(None, &e.into()).await;
                return Flow::Continue;
            }
        };

        match frame.verb.as_str() {
            PING => self.pong(frame).await,
            AUTHENTICATE => self.authenticate(frame).await,
            _ => self.dispatch(frame).await,
        }
        Flow::Continue
    }

    async fn pong(&mut self, frame: ClientFrame) {
        self.send(json!(["pong", frame.body])).await;

        if !self.throttle.due(Instant::now()) {
            return;
        }
        if let Err(e) = self.state.registry.refresh().await {
            warn!(target: "live.consumer", error = %e, "Failed to refresh connection marker");
        }
        if let Some(session) = &self.session {
            if let Err(e) = self.state.registry.refresh_user(session.user.id).await {
                warn!(
                    target: "live.consumer",
                    error = %e,
                    "Failed to refresh user connections"
                );
            }
        }
    }

    async fn authenticate(&mut self, frame: ClientFrame) {
        let request_id = frame.request_id.as_ref();
        if self.session.is_some() {
            self.send_error(request_id, &ProtocolError::AlreadyAuthenticated.into())
                .await;
            return;
        }

        match self.login(&frame.body).await {
            Ok(reply) => {
                metrics::record_auth("success");
                self.send(push_frame("authenticated", reply)).await;
            }
            Err(e) => {
                metrics::record_auth(&e.code());
                if e.is_internal() {
                    error!(target: "live.consumer", error = %e, "Login failed");
                } else {
                    debug!(target: "live.consumer", code = %e.code(), "Login rejected");
                }
                self.send_error(request_id, &e).await;
            }
        }
    }

    async fn login(&mut self, payload: &Value) -> Result<Value, LiveError> {
        let Identity { user, principal } =
            authenticate(self.state.repository.as_ref(), &self.world, payload).await?;

        let reply = match self.enter_world(&user, &principal).await {
            Ok(reply) => reply,
            Err(e) => {
                self.abandon_login(user.id).await;
                return Err(e);
            }
        };

        info!(
            target: "live.consumer",
            user_id = %user.id,
            kind = ?user.kind,
            "Connection authenticated"
        );
        self.session = Some(Session {
            user: Arc::new(user),
            principal: Arc::new(principal),
        });
        Ok(reply)
    }

    /// Join the user's groups, enforce the connection limit and build the
    /// `authenticated` body.
    async fn enter_world(&self, user: &User, principal: &Principal) -> Result<Value, LiveError> {
        let layer = &self.state.layer;
        layer.group_add(&user_group(user.id), &self.channel).await?;
        layer
            .group_add(&world_group(&self.world.id), &self.channel)
            .await?;

        let ordered = self
            .state
            .registry
            .register_user_connection(user.id, &self.channel)
            .await?;
        if !principal.is_admin() {
            self.evict(user.id, &ordered).await;
        }

        let rooms: Vec<Value> = self
            .state
            .repository
            .list_rooms(&self.world.id)
            .await?
            .iter()
            .filter(|room| {
                !room.deleted
                    && has_permission(principal, capability::ROOM_VIEW, &self.world, Some(*room))
            })
            .map(|room| room.to_client_json())
            .collect();

        let repository = self.state.repository.as_ref();
        Ok(json!({
            "user": user.to_public_json(),
            "world.config": self
                .world
                .config
                .to_client_json(can_see_secrets(principal, &self.world)),
            "rooms": rooms,
            "chat.channels": chat::channels_json(repository, &self.world.id, user.id).await?,
            "chat.read_pointers": chat::read_pointers_json(repository, user.id).await?,
        }))
    }

    /// Undo a login that failed after joining groups, so the unauthenticated
    /// connection receives no user or world broadcasts.
    async fn abandon_login(&self, user: UserId) {
        let layer = &self.state.layer;
        for group in [user_group(user), world_group(&self.world.id)] {
            if let Err(e) = layer.group_discard(&group, &self.channel).await {
                warn!(
                    target: "live.consumer",
                    group = %group,
                    error = %e,
                    "Failed to leave group after aborted login"
                );
            }
        }
        if let Err(e) = self
            .state
            .registry
            .unregister_user_connection(user, &self.channel)
            .await
        {
            warn!(
                target: "live.consumer",
                error = %e,
                "Failed to remove connection of aborted login"
            );
        }
    }

    /// Replace the user's oldest sessions beyond the world's limit.
    ///
    /// This connection may be among them when a newer login of the same
    /// user registered concurrently; it then receives the replacement too.
    async fn evict(&self, user: UserId, ordered: &[String]) {
        let evicted = channels_to_evict(ordered, self.world.config.connection_limit);
        if evicted.is_empty() {
            return;
        }

        for channel in &evicted {
            if let Err(e) = self
                .state
                .layer
                .send(channel, Event::new(control::REPLACED))
                .await
            {
                warn!(
                    target: "live.consumer",
                    error = %e,
                    evicted_channel = %channel,
                    "Failed to notify replaced connection"
                );
            }
            if let Err(e) = self
                .state
                .registry
                .unregister_user_connection(user, channel)
                .await
            {
                warn!(
                    target: "live.consumer",
                    error = %e,
                    evicted_channel = %channel,
                    "Failed to remove replaced connection"
                );
            }
        }

        metrics::record_evictions(evicted.len());
        info!(
            target: "live.consumer",
            user_id = %user,
            evicted = evicted.len(),
            limit = self.world.config.connection_limit,
            "Replaced connections over the limit"
        );
    }

    async fn dispatch(&mut self, frame: ClientFrame) {
        let request_id = frame.request_id.clone();
        let Some(session) = &self.session else {
            self.send_error(request_id.as_ref(), &ProtocolError::Unauthenticated.into())
                .await;
            return;
        };
        let user = session.user.clone();
        let principal = session.principal.clone();

        let known = self.state.modules.command(&frame.verb).is_some();
        let started = Instant::now();
        let result = match self.execute(user, principal, &frame).await {
            Ok(outcome) => self.apply(outcome, request_id.as_ref()).await,
            Err(e) => Err(e),
        };

        let success = result.is_ok();
        if let Err(e) = result {
            if e.is_internal() {
                error!(
                    target: "live.consumer",
                    verb = %frame.verb,
                    error = %e,
                    "Command failed"
                );
            } else {
                debug!(
                    target: "live.consumer",
                    verb = %frame.verb,
                    code = %e.code(),
                    "Command rejected"
                );
            }
            self.send_error(request_id.as_ref(), &e).await;
        }

        let (verb, prefix) = if known {
            (frame.verb.as_str(), frame.prefix())
        } else {
            (metrics::UNKNOWN_VERB, metrics::UNKNOWN_VERB)
        };
        metrics::record_command(verb, prefix, success, started.elapsed());
    }

    async fn execute(
        &self,
        user: Arc<User>,
        principal: Arc<Principal>,
        frame: &ClientFrame,
    ) -> Result<Outcome, LiveError> {
        let handler = self
            .state
            .modules
            .command(&frame.verb)
            .ok_or_else(|| ProtocolError::UnknownCommand(frame.verb.clone()))?;

        let room = authorize(
            &handler.guard,
            self.state.repository.as_ref(),
            &self.world,
            &principal,
            &frame.body,
        )
        .await?;

        let ctx = CommandContext {
            state: self.state.clone(),
            world: self.world.clone(),
            user,
            principal,
            room,
            channel: self.channel.clone(),
            socket_id: self.socket_id.clone(),
        };
        handler.call(ctx, frame.body.clone()).await
    }

    /// Apply group effects, then room view effects, reply, then broadcast.
    ///
    /// Group changes are the only fallible effects; running them first
    /// means a failure never leaves a started room view behind.
    async fn apply(
        &mut self,
        outcome: Outcome,
        request_id: Option<&Value>,
    ) -> Result<(), LiveError> {
        let Outcome { reply, effects } = outcome;
        let (groups, rest): (Vec<Effect>, Vec<Effect>) = effects
            .into_iter()
            .partition(|e| matches!(e, Effect::JoinGroup(_) | Effect::LeaveGroup(_)));

        for effect in groups {
            match effect {
                Effect::JoinGroup(group) => {
                    self.state.layer.group_add(&group, &self.channel).await?;
                }
                Effect::LeaveGroup(group) => {
                    self.state.layer.group_discard(&group, &self.channel).await?;
                }
                _ => {}
            }
        }

        let mut broadcasts = Vec::new();
        for effect in rest {
            match effect {
                Effect::Broadcast { group, event } => broadcasts.push((group, event)),
                Effect::RoomViewStarted { room, view } => {
                    if let Some(previous) = self.room_views.insert(room, view) {
                        self.end_view(previous).await;
                    }
                }
                Effect::RoomViewEnded { room } => {
                    if let Some(view) = self.room_views.remove(&room) {
                        self.end_view(view).await;
                    }
                }
                Effect::JoinGroup(_) | Effect::LeaveGroup(_) => {}
            }
        }

        self.send(success_frame(request_id, reply)).await;

        for (group, event) in broadcasts {
            match self.state.layer.group_send(&group, event).await {
                Ok(delivered) => {
                    debug!(target: "live.consumer", group = %group, delivered, "Broadcast sent");
                }
                Err(e) => {
                    warn!(target: "live.consumer", group = %group, error = %e, "Broadcast failed");
                }
            }
        }
        Ok(())
    }

    async fn end_view(&self, view: Uuid) {
        if let Err(e) = self.state.repository.end_room_view(view).await {
            warn!(target: "live.consumer", view_id = %view, error = %e, "Failed to end room view");
        }
    }

    fn schedule_close(&mut self, delay: Duration) {
        let at = Instant::now() + delay;
        self.close_at = Some(self.close_at.map_or(at, |current| current.min(at)));
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        match event.kind.as_str() {
            control::DROP => {
                info!(target: "live.consumer", "Connection dropped by administrator");
                return Flow::Close;
            }
            control::RELOAD => {
                self.send(push_frame(control::RELOAD, json!({}))).await;
                self.schedule_close(RELOAD_CLOSE_DELAY);
            }
            control::REPLACED => {
                info!(target: "live.consumer", "Connection replaced by a newer session");
                self.send(error_frame(None, control::REPLACED, None)).await;
                self.schedule_close(REPLACED_CLOSE_DELAY);
            }
            control::USER_BROADCAST => self.forward_user_broadcast(&event).await,
            _ => self.push_event(&event).await,
        }
        Flow::Continue
    }

    async fn forward_user_broadcast(&self, event: &Event) {
        let origin = event.get("socket").and_then(Value::as_str);
        if origin == Some(self.socket_id.as_str()) {
            return;
        }
        let Some(kind) = event.get("event_type").and_then(Value::as_str) else {
            warn!(target: "live.consumer", "user.broadcast without event_type");
            return;
        };
        let data = event.get("data").cloned().unwrap_or_else(|| json!({}));
        self.send(push_frame(kind, data)).await;
    }

    async fn push_event(&mut self, event: &Event) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(render) = self.state.modules.event(&event.kind) else {
            debug!(target: "live.consumer", kind = %event.kind, "No handler for event");
            return;
        };
        let principal = session.principal.clone();
        let user_id = session.user.id;

        if event.kind == world::UPDATED {
            self.reload_world().await;
        }
        let room = match event.get("room").and_then(|v| RoomId::deserialize(v).ok()) {
            Some(id) => match self.state.repository.get_room(&self.world.id, id).await {
                Ok(room) => room.filter(|r| !r.deleted),
                Err(e) => {
                    warn!(
                        target: "live.consumer",
                        kind = %event.kind,
                        error = %e,
                        "Failed to load room of event, dropping it"
                    );
                    return;
                }
            },
            None => None,
        };

        let ctx = EventContext {
            world: self.world.clone(),
            user_id,
            principal,
            socket_id: self.socket_id.clone(),
            room,
        };
        if let Some(body) = render(&ctx, event) {
            self.send(push_frame(&event.kind, body)).await;
        }
    }

    /// Pick up a changed world configuration.
    async fn reload_world(&mut self) {
        match self.state.repository.get_world(&self.world.id).await {
            Ok(Some(world)) => self.world = Arc::new(world),
            Ok(None) => warn!(target: "live.consumer", "World vanished, keeping cached copy"),
            Err(e) => warn!(target: "live.consumer", error = %e, "Failed to reload world"),
        }
    }

    async fn disconnect(mut self) {
        // Writer may already be gone.
        let _ = self.outbound.send(Outbound::Close).await;

        for (_, view) in std::mem::take(&mut self.room_views) {
            self.end_view(view).await;
        }
        if let Some(session) = &self.session {
            if let Err(e) = self
                .state
                .registry
                .unregister_user_connection(session.user.id, &self.channel)
                .await
            {
                warn!(
                    target: "live.consumer",
                    error = %e,
                    "Failed to remove connection from user list"
                );
            }
        }
        self.state.layer.close_channel(&self.channel).await;
        if let Err(e) = self.state.registry.unregister_connection().await {
            warn!(target: "live.consumer", error = %e, "Failed to unregister connection");
        }

        metrics::connection_closed();
        info!(
            target: "live.consumer",
            channel = %self.channel,
            "Connection closed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repositories::{InMemoryRepository, WorldRepository};
    use crate::store::{MemoryStore, SharedStore};
    use std::collections::HashMap as Vars;

    struct Fixture {
        state: Arc<AppState>,
        inbound: mpsc::Sender<String>,
        outbound: mpsc::Receiver<Outbound>,
        channel: String,
        socket_id: String,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    async fn state() -> Arc<AppState> {
        state_with(Arc::new(InMemoryRepository::new())).await
    }

    async fn state_with(repo: Arc<InMemoryRepository>) -> Arc<AppState> {
        let vars: Vars<String, String> =
            [("REDIS_URL".to_string(), "memory://".to_string())].into();
        let config = Config::from_vars(&vars).unwrap();
        repo.upsert_world(
            serde_json::from_value(json!({"id": "democon", "title": "Demo"})).unwrap(),
        )
        .await;
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        Arc::new(AppState::new(config, repo, vec![store]).unwrap())
    }

    async fn start(state: Arc<AppState>) -> Fixture {
        let world = Arc::new(
            state
                .repository
                .get_world(&common::types::WorldId::new("democon"))
                .await
                .unwrap()
                .unwrap(),
        );
        let (out_tx, outbound) = mpsc::channel(64);
        let (inbound, in_rx) = mpsc::channel(64);
        let (consumer, events) = Consumer::connect(state.clone(), world, out_tx).await.unwrap();
        let channel = consumer.channel().to_string();
        let socket_id = consumer.socket_id().to_string();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(in_rx, events, cancel.clone()));
        Fixture {
            state,
            inbound,
            outbound,
            channel,
            socket_id,
            cancel,
            task,
        }
    }

    async fn next_frame(fixture: &mut Fixture) -> Value {
        match fixture.outbound.recv().await.unwrap() {
            Outbound::Frame(frame) => frame,
            Outbound::Close => unreachable!("connection closed unexpectedly"),
        }
    }

    #[tokio::test]
    async fn test_commands_require_authentication() {
        let mut f = start(state().await).await;
        f.inbound
            .send(r#"["room.enter", 1, {}]"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut f).await,
            json!(["error", 1, {"code": "protocol.unauthenticated"}])
        );

        f.inbound.send(r#"["ping", 5]"#.to_string()).await.unwrap();
        assert_eq!(next_frame(&mut f).await, json!(["pong", 5]));

        f.inbound.send("{".to_string()).await.unwrap();
        assert_eq!(
            next_frame(&mut f).await,
            json!(["error", {"code": "protocol.malformed"}])
        );
        f.cancel.cancel();
        f.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate_once() {
        let mut f = start(state().await).await;
        f.inbound
            .send(r#"["authenticate", {"client_id": "abc"}]"#.to_string())
            .await
            .unwrap();
        let frame = next_frame(&mut f).await;
        assert_eq!(frame[0], json!("authenticated"));
        assert_eq!(frame[1]["user"]["kind"], json!("anonymous"));
        assert_eq!(frame[1]["rooms"], json!([]));

        f.inbound
            .send(r#"["authenticate", 2, {"client_id": "abc"}]"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut f).await,
            json!(["error", 2, {"code": "protocol.already_authenticated"}])
        );

        f.inbound
            .send(r#"["nope.nothing", 3, {}]"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut f).await,
            json!(["error", 3, {"code": "protocol.unknown_command"}])
        );
        f.cancel.cancel();
        f.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_user_broadcast_skips_origin() {
        let mut f = start(state().await).await;
        f.inbound
            .send(r#"["authenticate", {"client_id": "abc"}]"#.to_string())
            .await
            .unwrap();
        next_frame(&mut f).await;

        let own = user_broadcast(Some(&f.socket_id), "user.updated", json!({"a": 1}));
        f.state.layer.send(&f.channel, own).await.unwrap();
        let other = user_broadcast(Some("elsewhere"), "user.updated", json!({"a": 2}));
        f.state.layer.send(&f.channel, other).await.unwrap();
        let everyone = user_broadcast(None, "user.updated", json!({"a": 3}));
        f.state.layer.send(&f.channel, everyone).await.unwrap();

        assert_eq!(next_frame(&mut f).await, json!(["user.updated", {"a": 2}]));
        assert_eq!(next_frame(&mut f).await, json!(["user.updated", {"a": 3}]));
        f.cancel.cancel();
        f.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_closes_and_cleans_up() {
        let mut f = start(state().await).await;
        let label = f.state.registry.label().to_string();
        assert_eq!(
            f.state.registry.get_connections().await.unwrap().get(&label),
            Some(&1)
        );

        f.state
            .layer
            .send(&f.channel, Event::new(control::DROP))
            .await
            .unwrap();
        assert_eq!(f.outbound.recv().await.unwrap(), Outbound::Close);
        f.task.await.unwrap();

        assert!(f.state.layer.groups_of(&f.channel).await.is_empty());
        assert_eq!(
            f.state
                .registry
                .get_connections()
                .await
                .unwrap()
                .get(&label)
                .copied()
                .unwrap_or(0),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_closes_after_delay() {
        let mut f = start(state().await).await;
        f.state
            .layer
            .send(&f.channel, Event::new(control::RELOAD))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut f).await, json!(["connection.reload", {}]));

        let started = Instant::now();
        assert_eq!(f.outbound.recv().await.unwrap(), Outbound::Close);
        assert!(started.elapsed() >= RELOAD_CLOSE_DELAY);
        f.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_login_leaves_no_trace() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut f = start(state_with(repo.clone()).await).await;
        repo.set_rooms_unavailable(true);

        f.inbound
            .send(r#"["authenticate", {"client_id": "abc"}]"#.to_string())
            .await
            .unwrap();
        let frame = next_frame(&mut f).await;
        assert_eq!(frame[0], json!("error"));

        let groups = f.state.layer.groups_of(&f.channel).await;
        assert_eq!(
            groups,
            [version_group(f.state.registry.label())].into_iter().collect()
        );
        let democon = common::types::WorldId::new("democon");
        let user = repo.login_anonymous(&democon, "abc").await.unwrap();
        let ordered = f
            .state
            .registry
            .register_user_connection(user.id, "elsewhere")
            .await
            .unwrap();
        assert_eq!(ordered, vec!["elsewhere".to_string()]);
        f.state
            .registry
            .unregister_user_connection(user.id, "elsewhere")
            .await
            .unwrap();

        // Still unauthenticated, so the retry goes through.
        repo.set_rooms_unavailable(false);
        f.inbound
            .send(r#"["authenticate", {"client_id": "abc"}]"#.to_string())
            .await
            .unwrap();
        assert_eq!(next_frame(&mut f).await[0], json!("authenticated"));
        f.cancel.cancel();
        f.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_group_join_starts_no_view() {
        let state = state().await;
        let world = Arc::new(
            state
                .repository
                .get_world(&common::types::WorldId::new("democon"))
                .await
                .unwrap()
                .unwrap(),
        );
        let (out_tx, _outbound) = mpsc::channel(64);
        let (mut consumer, _events) = Consumer::connect(state.clone(), world, out_tx)
            .await
            .unwrap();

        let room = RoomId(Uuid::new_v4());
        let outcome = Outcome::default()
            .effect(Effect::RoomViewStarted {
                room,
                view: Uuid::new_v4(),
            })
            .join("not a valid group".to_string());
        assert!(consumer.apply(outcome, None).await.is_err());
        assert!(consumer.room_views.is_empty());
    }
}
