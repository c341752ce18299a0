//! Shared key-value store used by the channel layer and connection registry.
//!
//! Production deployments use Redis ([`RedisStore`]); tests and single-node
//! development use [`MemoryStore`], which honours TTLs against the tokio clock
//! so that `start_paused` tests can advance time deterministically.
//!
//! The trait only exposes the handful of commands the live server needs:
//! hash counters, expiring markers, sorted sets with scores and pub/sub.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use common::config::StoreConfig;
use common::secret::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size for pub/sub subscriptions.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Redis command or connection failure.
    #[error("redis: {0}")]
    Redis(String),

    /// The channel layer was configured without shards.
    #[error("no store shards configured")]
    NoShards,

    /// Group or channel name contains characters the layer refuses.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Operations the live server needs from its shared store.
///
/// Scores on sorted sets are integers (seconds or milliseconds depending on
/// the caller). Range queries return members in ascending score order.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// `HINCRBY key field delta`, returns the new value.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// `HGETALL key` for an integer-valued hash.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError>;

    /// `SET key value EX ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `EXISTS key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// `EXPIRE key ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `ZADD key score member`.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// `ZREM key member`, returns whether the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// `ZRANGE key 0 -1`, ascending by score.
    async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// `ZREMRANGEBYSCORE key min max`, returns the number of removed members.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64)
        -> Result<u64, StoreError>;

    /// `PUBLISH topic payload`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a topic. Messages arrive on the returned receiver until it
    /// is dropped.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, StoreError>;
}

/// Open one store per configured shard.
///
/// `memory://` shards share a single in-process [`MemoryStore`] per URL so
/// that several components of one process see the same data.
///
/// # Errors
///
/// Returns `StoreError::Redis` if a Redis shard cannot be reached.
pub async fn connect_shards(config: &StoreConfig) -> Result<Vec<Arc<dyn SharedStore>>, StoreError> {
    let mut shards: Vec<Arc<dyn SharedStore>> = Vec::with_capacity(config.shard_count());
    let mut memory: HashMap<String, Arc<MemoryStore>> = HashMap::new();

    for url in &config.shard_urls {
        let url = url.expose_secret();
        if url.starts_with(common::config::MEMORY_STORE_URL) {
            let store = memory
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new()))
                .clone();
            shards.push(store);
        } else {
            shards.push(Arc::new(RedisStore::connect(url).await?));
        }
    }

    if shards.is_empty() {
        return Err(StoreError::NoShards);
    }
    Ok(shards)
}
