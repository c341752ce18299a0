//! Channel layer implementation.
//!
//! # Key Patterns
//!
//! - `{prefix}group:{name}` - sorted set of channel names, scored by join time
//!   (epoch seconds). Refreshed to the group expiry on every add.
//! - `{prefix}process:{process}` - pub/sub topic for channels owned by a
//!   process.
//!
//! Group keys live on the shard chosen by hashing the group name; process
//! topics live on the shard chosen by hashing the process name.

use super::groups::is_valid_group_name;
use super::shard::consistent_hash;
use super::Event;
use crate::store::{SharedStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mailbox capacity per channel. Messages beyond this are dropped.
pub const CHANNEL_CAPACITY: usize = 100;

/// Separator between the process part and the local part of a channel name.
const PROCESS_SEPARATOR: char = '!';

/// A newly created channel and its mailbox.
#[derive(Debug)]
pub struct ChannelReceiver {
    /// Globally addressable channel name.
    pub name: String,
    /// Events delivered to the channel.
    pub events: mpsc::Receiver<Event>,
}

/// Wire format for messages routed through a process topic.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    channel: String,
    event: Event,
}

struct Inner {
    shards: Vec<Arc<dyn SharedStore>>,
    prefix: String,
    process: String,
    group_expiry: Duration,
    local: RwLock<HashMap<String, mpsc::Sender<Event>>>,
    /// channel -> groups it joined through this layer.
    memberships: Mutex<HashMap<String, BTreeSet<String>>>,
}

/// Sharded channel layer.
///
/// Cheap to clone; all clones share mailboxes and membership bookkeeping.
#[derive(Clone)]
pub struct ChannelLayer {
    inner: Arc<Inner>,
}

impl ChannelLayer {
    /// Create a layer over the given shards.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoShards` if `shards` is empty.
    pub fn new(
        shards: Vec<Arc<dyn SharedStore>>,
        prefix: impl Into<String>,
        group_expiry: Duration,
    ) -> Result<Self, StoreError> {
        if shards.is_empty() {
            return Err(StoreError::NoShards);
        }
        let process = format!("live.{}", Uuid::new_v4().simple());
        Ok(Self {
            inner: Arc::new(Inner {
                shards,
                prefix: prefix.into(),
                process,
                group_expiry,
                local: RwLock::new(HashMap::new()),
                memberships: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Name of this process on the layer.
    #[must_use]
    pub fn process_name(&self) -> &str {
        &self.inner.process
    }

    /// Number of store shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Create a new channel owned by this process.
    pub async fn new_channel(&self) -> ChannelReceiver {
        let name = format!(
            "{}{PROCESS_SEPARATOR}{}",
            self.inner.process,
            Uuid::new_v4().simple()
        );
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.inner.local.write().await.insert(name.clone(), tx);
        ChannelReceiver { name, events: rx }
    }

    /// Drop a local channel and leave every group it joined.
    pub async fn close_channel(&self, channel: &str) {
        self.inner.local.write().await.remove(channel);
        self.discard_all(channel).await;
    }

    /// Send an event to a single channel, local or remote.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidName` for names without a process part,
    /// or a store error if publishing to a remote process fails.
    pub async fn send(&self, channel: &str, event: Event) -> Result<(), StoreError> {
        let process = process_of(channel)
            .ok_or_else(|| StoreError::InvalidName(channel.to_string()))?;

        if process == self.inner.process {
            self.deliver_local(channel, event).await;
            return Ok(());
        }

        let payload = serde_json::to_string(&Envelope {
            channel: channel.to_string(),
            event,
        })?;
        let topic = self.process_topic(process);
        self.shard_for(process)?.publish(&topic, &payload).await
    }

    /// Add a channel to a group.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidName` for unacceptable group names, or a
    /// store error.
    pub async fn group_add(&self, group: &str, channel: &str) -> Result<(), StoreError> {
        ensure_valid(group)?;
        let key = self.group_key(group);
        let shard = self.shard_for(group)?;
        shard.zadd(&key, channel, now_secs()).await?;
        shard.expire(&key, self.inner.group_expiry).await?;

        self.inner
            .memberships
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(group.to_string());

        debug!(
            target: "live.channels",
            group = %group,
            channel = %channel,
            "Joined group"
        );
        Ok(())
    }

    /// Remove a channel from a group.
    ///
    /// Leaving a group the channel never joined is a no-op that does not
    /// touch the store. Returns whether the channel was a member.
    ///
    /// # Errors
    ///
    /// Returns a store error if the removal fails.
    pub async fn group_discard(&self, group: &str, channel: &str) -> Result<bool, StoreError> {
        let was_member = {
            let mut memberships = self.inner.memberships.lock().await;
            match memberships.get_mut(channel) {
                Some(groups) => {
                    let removed = groups.remove(group);
                    if groups.is_empty() {
                        memberships.remove(channel);
                    }
                    removed
                }
                None => false,
            }
        };
        if !was_member {
            return Ok(false);
        }

        let key = self.group_key(group);
        self.shard_for(group)?.zrem(&key, channel).await?;
        debug!(
            target: "live.channels",
            group = %group,
            channel = %channel,
            "Left group"
        );
        Ok(true)
    }

    /// Leave every group a channel joined through this layer.
    pub async fn discard_all(&self, channel: &str) {
        let groups = self
            .inner
            .memberships
            .lock()
            .await
            .remove(channel)
            .unwrap_or_default();

        for group in groups {
            let key = self.group_key(&group);
            let result = match self.shard_for(&group) {
                Ok(shard) => shard.zrem(&key, channel).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(
                    target: "live.channels",
                    error = %e,
                    group = %group,
                    "Failed to leave group during cleanup"
                );
            }
        }
    }

    /// Groups a local channel is currently a member of.
    pub async fn groups_of(&self, channel: &str) -> BTreeSet<String> {
        self.inner
            .memberships
            .lock()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Current members of a group, oldest first. Expired members are pruned.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn group_members(&self, group: &str) -> Result<Vec<String>, StoreError> {
        ensure_valid(group)?;
        let key = self.group_key(group);
        let shard = self.shard_for(group)?;
        let expiry = i64::try_from(self.inner.group_expiry.as_secs()).unwrap_or(i64::MAX);
        shard
            .zrem_range_by_score(&key, i64::MIN, now_secs().saturating_sub(expiry))
            .await?;
        shard.zrange(&key).await
    }

    /// Send an event to every member of a group. Returns the number of
    /// channels the event was handed to.
    ///
    /// # Errors
    ///
    /// Returns a store error if the membership cannot be read. Per-member
    /// delivery failures are logged and skipped.
    pub async fn group_send(&self, group: &str, event: Event) -> Result<usize, StoreError> {
        let members = self.group_members(group).await?;
        let mut delivered = 0;
        for channel in &members {
            match self.send(channel, event.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        target: "live.channels",
                        error = %e,
                        group = %group,
                        "Failed to deliver group message"
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Subscribe to this process's topic and deliver remote messages to
    /// local channels until cancelled.
    ///
    /// # Errors
    ///
    /// Returns a store error if the subscription cannot be established.
    pub async fn start_listener(
        &self,
        cancel_token: CancellationToken,
    ) -> Result<JoinHandle<()>, StoreError> {
        let process = self.inner.process.clone();
        let topic = self.process_topic(&process);
        let mut messages = self.shard_for(&process)?.subscribe(&topic).await?;
        let layer = self.clone();

        info!(
            target: "live.channels",
            process = %process,
            "Channel listener started"
        );

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!(
                            target: "live.channels",
                            "Channel listener received cancellation signal, exiting"
                        );
                        break;
                    }
                    message = messages.recv() => {
                        let Some(payload) = message else {
                            warn!(
                                target: "live.channels",
                                "Process subscription closed, listener exiting"
                            );
                            break;
                        };
                        match serde_json::from_str::<Envelope>(&payload) {
                            Ok(envelope) => {
                                layer.deliver_local(&envelope.channel, envelope.event).await;
                            }
                            Err(e) => {
                                warn!(
                                    target: "live.channels",
                                    error = %e,
                                    "Dropping malformed layer message"
                                );
                            }
                        }
                    }
                }
            }
        }))
    }

    async fn deliver_local(&self, channel: &str, event: Event) -> bool {
        let local = self.inner.local.read().await;
        let Some(tx) = local.get(channel) else {
            debug!(
                target: "live.channels",
                channel = %channel,
                "Message for unknown local channel dropped"
            );
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    target: "live.channels",
                    channel = %channel,
                    event_type = %event.kind,
                    "Channel full, message dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn shard_for(&self, name: &str) -> Result<&Arc<dyn SharedStore>, StoreError> {
        let index = consistent_hash(name, self.inner.shards.len());
        self.inner.shards.get(index).ok_or(StoreError::NoShards)
    }

    fn group_key(&self, group: &str) -> String {
        format!("{}group:{group}", self.inner.prefix)
    }

    fn process_topic(&self, process: &str) -> String {
        format!("{}process:{process}", self.inner.prefix)
    }
}

fn process_of(channel: &str) -> Option<&str> {
    channel
        .split_once(PROCESS_SEPARATOR)
        .map(|(process, _)| process)
        .filter(|p| !p.is_empty())
}

fn ensure_valid(group: &str) -> Result<(), StoreError> {
    if is_valid_group_name(group) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(group.to_string()))
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn layer_over(store: Arc<MemoryStore>) -> ChannelLayer {
        ChannelLayer::new(vec![store], "test:", Duration::from_secs(86_400)).unwrap()
    }

    #[test]
    fn test_requires_shards() {
        assert!(matches!(
            ChannelLayer::new(Vec::new(), "p:", Duration::from_secs(1)),
            Err(StoreError::NoShards)
        ));
    }

    #[test]
    fn test_process_of() {
        assert_eq!(process_of("live.abc!123"), Some("live.abc"));
        assert_eq!(process_of("no-separator"), None);
        assert_eq!(process_of("!orphan"), None);
    }

    #[tokio::test]
    async fn test_local_send_and_group_send() {
        let store = Arc::new(MemoryStore::new());
        let layer = layer_over(store);

        let mut a = layer.new_channel().await;
        let mut b = layer.new_channel().await;
        assert!(a.name.starts_with(layer.process_name()));

        layer.group_add("room.x", &a.name).await.unwrap();
        layer.group_add("room.x", &b.name).await.unwrap();

        let delivered = layer
            .group_send("room.x", Event::new("chat.event").with("n", json!(1)))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.events.recv().await.unwrap().kind, "chat.event");
        assert_eq!(b.events.recv().await.unwrap().kind, "chat.event");

        layer.send(&a.name, Event::new("direct")).await.unwrap();
        assert_eq!(a.events.recv().await.unwrap().kind, "direct");
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_discard_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let layer = layer_over(store.clone());
        let a = layer.new_channel().await;

        // Never joined: no-op, no store key created.
        assert!(!layer.group_discard("room.x", &a.name).await.unwrap());
        assert_eq!(store.key_count().await, 0);

        layer.group_add("room.x", &a.name).await.unwrap();
        assert!(layer.group_discard("room.x", &a.name).await.unwrap());
        assert!(!layer.group_discard("room.x", &a.name).await.unwrap());
        assert!(layer.group_members("room.x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_channel_leaves_all_groups() {
        let store = Arc::new(MemoryStore::new());
        let layer = layer_over(store);
        let a = layer.new_channel().await;
        let b = layer.new_channel().await;

        layer.group_add("room.x", &a.name).await.unwrap();
        layer.group_add("room.y", &a.name).await.unwrap();
        layer.group_add("room.y", &b.name).await.unwrap();
        assert_eq!(layer.groups_of(&a.name).await.len(), 2);

        layer.close_channel(&a.name).await;

        assert!(layer.groups_of(&a.name).await.is_empty());
        assert!(layer.group_members("room.x").await.unwrap().is_empty());
        assert_eq!(layer.group_members("room.y").await.unwrap(), vec![b.name]);
    }

    #[tokio::test]
    async fn test_invalid_group_name_rejected() {
        let layer = layer_over(Arc::new(MemoryStore::new()));
        let a = layer.new_channel().await;
        assert!(matches!(
            layer.group_add("bad name", &a.name).await,
            Err(StoreError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_delivery_through_shared_store() {
        let store = Arc::new(MemoryStore::new());
        let layer_a = layer_over(store.clone());
        let layer_b = layer_over(store);

        let cancel = CancellationToken::new();
        let handle = layer_b.start_listener(cancel.clone()).await.unwrap();

        let mut on_b = layer_b.new_channel().await;
        layer_a.group_add("world.demo", &on_b.name).await.unwrap();

        let delivered = layer_a
            .group_send("world.demo", Event::new("connection.reload"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let event = tokio::time::timeout(Duration::from_secs(1), on_b.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, "connection.reload");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_groups_spread_across_shards() {
        let shards: Vec<Arc<dyn SharedStore>> = (0..3)
            .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn SharedStore>)
            .collect();
        let layer = ChannelLayer::new(shards, "test:", Duration::from_secs(60)).unwrap();
        let mut a = layer.new_channel().await;

        for i in 0..10 {
            layer.group_add(&format!("room.{i}"), &a.name).await.unwrap();
        }
        for i in 0..10 {
            layer
                .group_send(&format!("room.{i}"), Event::new("ping"))
                .await
                .unwrap();
        }
        for _ in 0..10 {
            assert_eq!(a.events.recv().await.unwrap().kind, "ping");
        }
    }
}
