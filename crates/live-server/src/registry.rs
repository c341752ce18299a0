//! Connection registry.
//!
//! Tracks live WebSocket connections in the shared store so that operators
//! can see how many clients each deployment label holds, and so that per-user
//! connection limits hold across processes.
//!
//! # Key Patterns
//!
//! - `connections` - hash of `label -> open connection count`
//! - `connections:{label}` - liveness marker, refreshed on ping, 60 s TTL.
//!   Labels whose marker expired are hidden from listings.
//! - `user:{id}:connections` - sorted set of channel names scored by
//!   authentication time (epoch milliseconds), 90 s TTL.

use crate::store::{SharedStore, StoreError};
use common::types::UserId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Registry hash key.
pub const CONNECTIONS_KEY: &str = "connections";

/// TTL of the per-label liveness marker.
pub const LABEL_MARKER_TTL: Duration = Duration::from_secs(60);

/// TTL of the per-user connection set.
pub const USER_CONNECTIONS_TTL: Duration = Duration::from_secs(90);

/// Minimum time between registry refreshes triggered by client pings.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(50);

/// Connection registry bound to one deployment label.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn SharedStore>,
    label: String,
}

impl ConnectionRegistry {
    /// Create a registry for `label` on the given store shard.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, label: impl Into<String>) -> Self {
        Self {
            store,
            label: label.into(),
        }
    }

    /// Deployment label (`{commit}.{environment}`).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Count a new connection under this label.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn register_connection(&self) -> Result<(), StoreError> {
        let count = self.store.hincr_by(CONNECTIONS_KEY, &self.label, 1).await?;
        self.refresh().await?;
        debug!(
            target: "live.registry",
            label = %self.label,
            count = count,
            "Connection registered"
        );
        Ok(())
    }

    /// Remove a connection from this label's count.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn unregister_connection(&self) -> Result<(), StoreError> {
        let count = self
            .store
            .hincr_by(CONNECTIONS_KEY, &self.label, -1)
            .await?;
        debug!(
            target: "live.registry",
            label = %self.label,
            count = count,
            "Connection unregistered"
        );
        Ok(())
    }

    /// Refresh the liveness marker of this label.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        self.store
            .set_ex(&label_marker_key(&self.label), "1", LABEL_MARKER_TTL)
            .await
    }

    /// Connection counts of every label whose marker is still alive.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get_connections(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let all = self.store.hget_all(CONNECTIONS_KEY).await?;
        let mut live = BTreeMap::new();
        for (label, count) in all {
            if self.store.exists(&label_marker_key(&label)).await? {
                live.insert(label, count);
            }
        }
        Ok(live)
    }

    /// Record an authenticated connection of `user`.
    ///
    /// Entries older than the user set TTL are pruned first. Returns the
    /// user's live channels ordered oldest first, including `channel`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn register_user_connection(
        &self,
        user: UserId,
        channel: &str,
    ) -> Result<Vec<String>, StoreError> {
        let key = user_connections_key(user);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(USER_CONNECTIONS_TTL.as_millis()).unwrap_or(i64::MAX);

        self.store
            .zrem_range_by_score(&key, i64::MIN, now_ms.saturating_sub(ttl_ms))
            .await?;
        self.store.zadd(&key, channel, now_ms).await?;
        self.store.expire(&key, USER_CONNECTIONS_TTL).await?;
        self.store.zrange(&key).await
    }

    /// Remove a channel from the user's set.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn unregister_user_connection(
        &self,
        user: UserId,
        channel: &str,
    ) -> Result<(), StoreError> {
        self.store
            .zrem(&user_connections_key(user), channel)
            .await
            .map(|_| ())
    }

    /// Extend the TTL of the user's set.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn refresh_user(&self, user: UserId) -> Result<(), StoreError> {
        self.store
            .expire(&user_connections_key(user), USER_CONNECTIONS_TTL)
            .await
    }
}

/// Choose which of a user's channels must close so that at most `limit`
/// remain: the oldest `len - limit` entries.
///
/// `ordered` is oldest first. A limit of zero means unlimited. The result
/// depends only on the order, so concurrent logins of the same user agree
/// on the survivors and the newest connection is always kept.
#[must_use]
pub fn channels_to_evict(ordered: &[String], limit: usize) -> Vec<String> {
    if limit == 0 {
        return Vec::new();
    }
    ordered
        .iter()
        .take(ordered.len().saturating_sub(limit))
        .cloned()
        .collect()
}

/// Throttles registry refreshes driven by client pings.
#[derive(Debug)]
pub struct RefreshThrottle {
    last: Instant,
    interval: Duration,
}

impl RefreshThrottle {
    /// Start a throttle at `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            last: now,
            interval: REFRESH_INTERVAL,
        }
    }

    /// Whether a refresh is due; marks it as done when it is.
    pub fn due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last) > self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

fn label_marker_key(label: &str) -> String {
    format!("{CONNECTIONS_KEY}:{label}")
}

fn user_connections_key(user: UserId) -> String {
    format!("user:{user}:connections")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_register_and_unregister_counts() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(store, "abc.production");

        registry.register_connection().await.unwrap();
        registry.register_connection().await.unwrap();
        registry.unregister_connection().await.unwrap();

        let connections = registry.get_connections().await.unwrap();
        assert_eq!(connections.get("abc.production"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_label_marker_hides_label() {
        let store = Arc::new(MemoryStore::new());
        let old = ConnectionRegistry::new(store.clone(), "old.production");
        let new = ConnectionRegistry::new(store, "new.production");

        old.register_connection().await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        new.register_connection().await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        let connections = new.get_connections().await.unwrap();
        assert!(!connections.contains_key("old.production"));
        assert_eq!(connections.get("new.production"), Some(&1));

        // A ping-driven refresh brings the label back.
        old.refresh().await.unwrap();
        assert!(new
            .get_connections()
            .await
            .unwrap()
            .contains_key("old.production"));
    }

    #[tokio::test]
    async fn test_user_connections_ordered_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(store, "abc.production");
        let user = UserId::new();

        registry.register_user_connection(user, "p!1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let ordered = registry.register_user_connection(user, "p!2").await.unwrap();
        assert_eq!(ordered, names(&["p!1", "p!2"]));

        registry.unregister_user_connection(user, "p!1").await.unwrap();
        let ordered = registry.register_user_connection(user, "p!3").await.unwrap();
        assert_eq!(ordered.first().unwrap(), "p!2");
        assert_eq!(ordered.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_connections_expire() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(store.clone(), "abc.production");
        let user = UserId::new();

        registry.register_user_connection(user, "p!1").await.unwrap();
        tokio::time::advance(USER_CONNECTIONS_TTL + Duration::from_secs(1)).await;
        assert_eq!(store.key_count().await, 0);
    }

    #[test]
    fn test_channels_to_evict_keeps_newest() {
        let ordered = names(&["a", "b", "c"]);
        assert_eq!(channels_to_evict(&ordered, 1), names(&["a", "b"]));
        assert_eq!(channels_to_evict(&ordered, 2), names(&["a"]));
        assert!(channels_to_evict(&ordered, 3).is_empty());
        assert!(channels_to_evict(&ordered, 5).is_empty());
    }

    #[test]
    fn test_channels_to_evict_unlimited() {
        let ordered = names(&["a", "b", "c"]);
        assert!(channels_to_evict(&ordered, 0).is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_logins_agree_on_survivor() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(store, "abc.production");
        let user = UserId::new();

        // A registers, then B registers before A has evicted anything.
        let seen_by_a = registry.register_user_connection(user, "A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let seen_by_b = registry.register_user_connection(user, "B").await.unwrap();
        assert_eq!(seen_by_a, names(&["A"]));
        assert_eq!(seen_by_b, names(&["A", "B"]));

        // Whichever login evaluates the full list, only A goes.
        let full = names(&["A", "B"]);
        assert_eq!(channels_to_evict(&full, 1), names(&["A"]));
        assert!(channels_to_evict(&seen_by_a, 1).is_empty());

        let evicted = channels_to_evict(&seen_by_b, 1);
        assert_eq!(evicted, names(&["A"]));
        for channel in &evicted {
            registry.unregister_user_connection(user, channel).await.unwrap();
        }
        let ordered = registry.register_user_connection(user, "B").await.unwrap();
        assert_eq!(ordered, names(&["B"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_throttle() {
        let start = Instant::now();
        let mut throttle = RefreshThrottle::new(start);
        assert!(!throttle.due(start + Duration::from_secs(10)));
        assert!(!throttle.due(start + Duration::from_secs(50)));
        assert!(throttle.due(start + Duration::from_secs(51)));
        assert!(!throttle.due(start + Duration::from_secs(60)));
        assert!(throttle.due(start + Duration::from_secs(102)));
    }
}
