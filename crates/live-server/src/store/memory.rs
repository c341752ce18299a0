//! In-process shared store.
//!
//! Mirrors the Redis semantics the live server relies on: keys expire lazily
//! on access, sorted sets order by score then member, and published messages
//! fan out to every live subscriber of a topic. Expiry is measured with
//! [`tokio::time::Instant`] so paused-clock tests can advance past TTLs.

use super::{SharedStore, StoreError, SUBSCRIPTION_BUFFER};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// A value with an optional expiry deadline.
#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Return the live value under `key`, evicting it first if it has expired.
fn live_mut<'a, T>(map: &'a mut HashMap<String, Expiring<T>>, key: &str) -> Option<&'a mut Expiring<T>> {
    let now = Instant::now();
    if map.get(key).is_some_and(|e| !e.live(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Expiring<String>>,
    hashes: HashMap<String, Expiring<HashMap<String, i64>>>,
    zsets: HashMap<String, Expiring<Vec<(i64, String)>>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

/// In-memory implementation of [`SharedStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (test helper).
    pub async fn key_count(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner.strings.values().filter(|e| e.live(now)).count()
            + inner.hashes.values().filter(|e| e.live(now)).count()
            + inner.zsets.values().filter(|e| e.live(now)).count()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        if live_mut(&mut inner.hashes, key).is_none() {
            inner
                .hashes
                .insert(key.to_string(), Expiring::new(HashMap::new()));
        }
        let hash = inner
            .hashes
            .get_mut(key)
            .ok_or_else(|| StoreError::Redis("hash vanished".to_string()))?;
        let counter = hash.value.entry(field.to_string()).or_insert(0);
        *counter += delta;
        Ok(*counter)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(live_mut(&mut inner.hashes, key)
            .map(|e| e.value.clone())
            .unwrap_or_default())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(live_mut(&mut inner.strings, key).is_some()
            || live_mut(&mut inner.hashes, key).is_some()
            || live_mut(&mut inner.zsets, key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let deadline = Some(Instant::now() + ttl);
        let mut inner = self.inner.lock().await;
        if let Some(e) = live_mut(&mut inner.strings, key) {
            e.expires_at = deadline;
        }
        if let Some(e) = live_mut(&mut inner.hashes, key) {
            e.expires_at = deadline;
        }
        if let Some(e) = live_mut(&mut inner.zsets, key) {
            e.expires_at = deadline;
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if live_mut(&mut inner.zsets, key).is_none() {
            inner.zsets.insert(key.to_string(), Expiring::new(Vec::new()));
        }
        if let Some(set) = inner.zsets.get_mut(key) {
            set.value.retain(|(_, m)| m != member);
            set.value.push((score, member.to_string()));
            set.value.sort();
        }
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(set) = live_mut(&mut inner.zsets, key) else {
            return Ok(false);
        };
        let before = set.value.len();
        set.value.retain(|(_, m)| m != member);
        let removed = set.value.len() < before;
        if set.value.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(live_mut(&mut inner.zsets, key)
            .map(|set| set.value.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(set) = live_mut(&mut inner.zsets, key) else {
            return Ok(0);
        };
        let before = set.value.len();
        set.value.retain(|(score, _)| *score < min || *score > max);
        let removed = (before - set.value.len()) as u64;
        if set.value.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(subscribers) = inner.subscribers.get_mut(topic) {
            subscribers.retain(|tx| match tx.try_send(payload.to_string()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut inner = self.inner.lock().await;
        inner
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.hincr_by("connections", "a", 1).await.unwrap(), 1);
        assert_eq!(store.hincr_by("connections", "a", 1).await.unwrap(), 2);
        assert_eq!(store.hincr_by("connections", "b", 1).await.unwrap(), 1);
        assert_eq!(store.hincr_by("connections", "a", -1).await.unwrap(), 1);

        let all = store.hget_all("connections").await.unwrap();
        assert_eq!(all.get("a"), Some(&1));
        assert_eq!(all.get("b"), Some(&1));
        assert!(store.hget_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("marker", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.exists("marker").await.unwrap());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.exists("marker").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("marker").await.unwrap());
        assert_eq!(store.key_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_refreshes_zset() {
        let store = MemoryStore::new();
        store.zadd("z", "a", 1).await.unwrap();
        store.expire("z", Duration::from_secs(90)).await.unwrap();

        tokio::time::advance(Duration::from_secs(80)).await;
        store.expire("z", Duration::from_secs(90)).await.unwrap();
        tokio::time::advance(Duration::from_secs(80)).await;
        assert_eq!(store.zrange("z").await.unwrap(), vec!["a"]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.zrange("z").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zset_orders_by_score_and_updates() {
        let store = MemoryStore::new();
        store.zadd("z", "late", 30).await.unwrap();
        store.zadd("z", "early", 10).await.unwrap();
        store.zadd("z", "mid", 20).await.unwrap();
        assert_eq!(store.zrange("z").await.unwrap(), vec!["early", "mid", "late"]);

        // Re-adding moves the member.
        store.zadd("z", "early", 40).await.unwrap();
        assert_eq!(store.zrange("z").await.unwrap(), vec!["mid", "late", "early"]);
    }

    #[tokio::test]
    async fn test_zrem_and_range_removal() {
        let store = MemoryStore::new();
        for (m, s) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            store.zadd("z", m, s).await.unwrap();
        }
        assert!(store.zrem("z", "b").await.unwrap());
        assert!(!store.zrem("z", "b").await.unwrap());
        assert_eq!(store.zrem_range_by_score("z", 0, 3).await.unwrap(), 2);
        assert_eq!(store.zrange("z").await.unwrap(), vec!["d"]);
        assert!(!store.zrem("missing", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_zset_is_removed() {
        let store = MemoryStore::new();
        store.zadd("z", "only", 1).await.unwrap();
        store.zrem("z", "only").await.unwrap();
        assert!(!store.exists("z").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let store = MemoryStore::new();
        let mut a = store.subscribe("topic").await.unwrap();
        let mut b = store.subscribe("topic").await.unwrap();
        let mut other = store.subscribe("other").await.unwrap();

        store.publish("topic", "hello").await.unwrap();

        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_drops_closed_subscribers() {
        let store = MemoryStore::new();
        let rx = store.subscribe("topic").await.unwrap();
        drop(rx);
        store.publish("topic", "hello").await.unwrap();

        let inner = store.inner.lock().await;
        assert!(inner.subscribers.get("topic").unwrap().is_empty());
    }
}
