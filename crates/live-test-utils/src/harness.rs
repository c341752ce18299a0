//! In-process session harness
//!
//! Provides `TestLiveServer` for driving real [`Consumer`] sessions without a
//! network socket: state is built on the in-memory store and repository, and
//! each [`TestClient`] feeds text frames in and reads frames back out exactly
//! as the WebSocket transport would.

use common::types::WorldId;
use live_server::config::Config;
use live_server::consumer::{Consumer, Outbound};
use live_server::models::{Room, Server, World};
use live_server::repositories::{InMemoryRepository, Repository};
use live_server::state::AppState;
use live_server::store::{MemoryStore, SharedStore};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a client waits for an expected frame before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Test harness hosting one world on shared in-memory state.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_ping() {
///     let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
///     let mut client = server.connect().await;
///     client.send(json!(["ping", 1])).await;
///     assert_eq!(client.recv().await, json!(["pong", 1]));
/// }
/// ```
pub struct TestLiveServer {
    state: Arc<AppState>,
    repository: Arc<InMemoryRepository>,
    store: Arc<MemoryStore>,
    world: WorldId,
    shutdown: CancellationToken,
}

impl TestLiveServer {
    /// Build state for `world` with default configuration.
    pub async fn spawn(world: World) -> Self {
        Self::spawn_with(world, HashMap::new()).await
    }

    /// Build state for `world`, overriding configuration variables.
    pub async fn spawn_with(world: World, overrides: HashMap<String, String>) -> Self {
        let mut vars = HashMap::from([
            ("REDIS_URL".to_string(), "memory://".to_string()),
            ("LIVE_COMMIT".to_string(), "testcommit".to_string()),
            ("LIVE_ENVIRONMENT".to_string(), "test".to_string()),
        ]);
        vars.extend(overrides);
        let config = Config::from_vars(&vars).expect("test config should be valid");

        let repository = Arc::new(InMemoryRepository::new());
        let world_id = world.id.clone();
        repository.upsert_world(world).await;

        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn SharedStore> = store.clone();
        let repo: Arc<dyn Repository> = repository.clone();
        let state =
            Arc::new(AppState::new(config, repo, vec![shared]).expect("app state should build"));

        Self {
            state,
            repository,
            store,
            world: world_id,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repository
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Id of the hosted world.
    pub fn world_id(&self) -> &WorldId {
        &self.world
    }

    pub async fn add_room(&self, room: Room) -> Room {
        self.repository.upsert_room(room.clone()).await;
        room
    }

    pub async fn add_server(&self, server: Server) {
        self.repository.upsert_server(server).await;
    }

    /// Open a new session on the hosted world.
    pub async fn connect(&self) -> TestClient {
        let world = self
            .state
            .repository
            .get_world(&self.world)
            .await
            .expect("repository should be readable")
            .expect("test world should exist");

        let (out_tx, outbound) = mpsc::channel(256);
        let (inbound, in_rx) = mpsc::channel(64);
        let (consumer, events) = Consumer::connect(self.state.clone(), Arc::new(world), out_tx)
            .await
            .expect("connection should register");
        let channel = consumer.channel().to_string();
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(consumer.run(in_rx, events, cancel.clone()));

        TestClient {
            inbound,
            outbound,
            pending: VecDeque::new(),
            channel,
            next_id: 1,
            cancel,
            task: Some(task),
        }
    }

    /// Number of live connections registered under this deployment's label.
    pub async fn connection_count(&self) -> i64 {
        let label = self.state.registry.label().to_string();
        self.state
            .registry
            .get_connections()
            .await
            .expect("registry should be readable")
            .get(&label)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for TestLiveServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One client session.
pub struct TestClient {
    inbound: mpsc::Sender<String>,
    outbound: mpsc::Receiver<Outbound>,
    /// Pushes received while waiting for a reply.
    pending: VecDeque<Value>,
    channel: String,
    next_id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TestClient {
    /// Channel layer name of this session.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Send a raw text frame.
    pub async fn send_text(&self, text: &str) {
        self.inbound
            .send(text.to_string())
            .await
            .expect("consumer should accept frames");
    }

    pub async fn send(&self, frame: Value) {
        self.send_text(&frame.to_string()).await;
    }

    /// Next frame, failing the test on close or timeout.
    pub async fn recv(&mut self) -> Value {
        if let Some(frame) = self.pending.pop_front() {
            return frame;
        }
        match self.recv_outbound().await {
            Some(Outbound::Frame(frame)) => frame,
            Some(Outbound::Close) => panic!("connection closed while waiting for a frame"),
            None => panic!("connection task ended while waiting for a frame"),
        }
    }

    /// Send `[verb, id, body]` and return the matching reply frame.
    ///
    /// Pushes arriving first are kept for later [`recv`](Self::recv) calls.
    pub async fn request(&mut self, verb: &str, body: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!([verb, id, body])).await;

        loop {
            let frame = match self.recv_outbound().await {
                Some(Outbound::Frame(frame)) => frame,
                Some(Outbound::Close) => panic!("connection closed while waiting for {verb}"),
                None => panic!("connection task ended while waiting for {verb}"),
            };
            let is_reply = frame.get(0) == Some(&json!(id))
                || (frame.get(0) == Some(&json!("error")) && frame.get(1) == Some(&json!(id)));
            if is_reply {
                return frame;
            }
            self.pending.push_back(frame);
        }
    }

    /// Like [`request`](Self::request) but asserts success and returns the body.
    pub async fn call(&mut self, verb: &str, body: Value) -> Value {
        let frame = self.request(verb, body).await;
        assert_eq!(
            frame.get(1),
            Some(&json!("success")),
            "{verb} failed: {frame}"
        );
        frame.get(2).cloned().unwrap_or(Value::Null)
    }

    /// Like [`request`](Self::request) but asserts an error and returns its code.
    pub async fn call_err(&mut self, verb: &str, body: Value) -> String {
        let frame = self.request(verb, body).await;
        assert_eq!(frame.get(0), Some(&json!("error")), "{verb} succeeded: {frame}");
        frame[2]["code"].as_str().unwrap_or_default().to_string()
    }

    /// Authenticate and return the `authenticated` push body.
    pub async fn authenticate(&mut self, payload: Value) -> Value {
        self.send(json!(["authenticate", payload])).await;
        let frame = self.recv().await;
        assert_eq!(
            frame.get(0),
            Some(&json!("authenticated")),
            "authentication failed: {frame}"
        );
        frame.get(1).cloned().unwrap_or(Value::Null)
    }

    pub async fn authenticate_anonymous(&mut self, client_id: &str) -> Value {
        self.authenticate(json!({"client_id": client_id})).await
    }

    pub async fn authenticate_token(&mut self, token: &str) -> Value {
        self.authenticate(json!({"token": token})).await
    }

    /// Skip frames until a push of `kind` arrives and return its body.
    pub async fn expect_push(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame.get(0) == Some(&json!(kind)) {
                return frame.get(1).cloned().unwrap_or(Value::Null);
            }
        }
    }

    /// Assert that nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        assert!(self.pending.is_empty(), "unexpected frame: {:?}", self.pending);
        if let Ok(Some(message)) = tokio::time::timeout(wait, self.outbound.recv()).await {
            panic!("unexpected message: {message:?}");
        }
    }

    /// Wait until the server closes the session and its cleanup finished.
    pub async fn expect_closed(&mut self) {
        loop {
            match self.recv_outbound().await {
                Some(Outbound::Close) | None => break,
                Some(Outbound::Frame(_)) => {}
            }
        }
        self.join().await;
    }

    /// Close from the client side and wait for cleanup.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            tokio::time::timeout(RECV_TIMEOUT, task)
                .await
                .expect("consumer should stop")
                .expect("consumer task should not panic");
        }
    }

    async fn recv_outbound(&mut self) -> Option<Outbound> {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for a frame")
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
