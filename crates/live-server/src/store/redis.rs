//! Redis-backed shared store.
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every command clones it instead of sharing it behind a
//! lock. Pub/sub needs a dedicated connection per subscription, opened from
//! the retained [`Client`].
//!
//! Store URLs may contain credentials (`redis://:password@host`) and are
//! never logged.

use super::{SharedStore, StoreError, SUBSCRIPTION_BUFFER};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Redis shard of the shared store.
#[derive(Clone)]
pub struct RedisStore {
    /// Retained for opening pub/sub connections.
    client: Client,
    /// Multiplexed connection (cheaply cloneable, designed for concurrent use).
    connection: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to a Redis shard.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Redis` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log redis_url, it may contain credentials.
            error!(
                target: "live.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            StoreError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "live.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                StoreError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { client, connection })
    }
}

fn command_error(op: &'static str, key: &str, e: &::redis::RedisError) -> StoreError {
    warn!(
        target: "live.store.redis",
        error = %e,
        op = op,
        key = %key,
        "Redis command failed"
    );
    StoreError::Redis(format!("{op} failed: {e}"))
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        conn.hincr(key, field, delta)
            .await
            .map_err(|e| command_error("HINCRBY", key, &e))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.connection.clone();
        conn.hgetall(key)
            .await
            .map_err(|e| command_error("HGETALL", key, &e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .set_ex(key, value, ttl_seconds(ttl))
            .await
            .map_err(|e| command_error("SETEX", key, &e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        conn.exists(key)
            .await
            .map_err(|e| command_error("EXISTS", key, &e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let secs = i64::try_from(ttl_seconds(ttl)).unwrap_or(i64::MAX);
        let _: bool = conn
            .expire(key, secs)
            .await
            .map_err(|e| command_error("EXPIRE", key, &e))?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .zadd(key, member, score)
            .await
            .map_err(|e| command_error("ZADD", key, &e))?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .zrem(key, member)
            .await
            .map_err(|e| command_error("ZREM", key, &e))?;
        Ok(removed > 0)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        conn.zrange(key, 0, -1)
            .await
            .map_err(|e| command_error("ZRANGE", key, &e))
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        conn.zrembyscore(key, min, max)
            .await
            .map_err(|e| command_error("ZREMRANGEBYSCORE", key, &e))
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| command_error("PUBLISH", topic, &e))?;
        if receivers == 0 {
            debug!(
                target: "live.store.redis",
                topic = %topic,
                "Published message had no subscribers"
            );
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| command_error("SUBSCRIBE", topic, &e))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| command_error("SUBSCRIBE", topic, &e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(
                            target: "live.store.redis",
                            error = %e,
                            topic = %topic,
                            "Dropping non-UTF8 pub/sub payload"
                        );
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(
                target: "live.store.redis",
                topic = %topic,
                "Subscription ended"
            );
        });

        Ok(rx)
    }
}
