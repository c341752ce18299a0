//! Operations behind the `live-connections` admin command.
//!
//! Deployments are addressed by their connection label
//! (`{commit}.{environment}`), filtered with shell-style globs. Control
//! events go to every member of the matching `version.{label}` groups, one
//! channel at a time with an optional pause so reconnects are spread out.

use crate::channels::groups::version_group;
use crate::channels::{ChannelLayer, Event};
use crate::consumer::control;
use crate::errors::LiveError;
use crate::registry::ConnectionRegistry;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Pattern used when none is given.
pub const MATCH_ALL: &str = "*";

/// Which control event to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Close connections immediately.
    Drop,
    /// Ask clients to reload, then close.
    Reload,
}

impl ControlAction {
    #[must_use]
    pub fn event_type(self) -> &'static str {
        match self {
            ControlAction::Drop => control::DROP,
            ControlAction::Reload => control::RELOAD,
        }
    }
}

/// Compile label filters. No patterns matches every label.
///
/// # Errors
///
/// Returns `LiveError::Config` for an invalid glob.
pub fn label_matcher(patterns: &[String]) -> Result<GlobSet, LiveError> {
    let mut builder = GlobSetBuilder::new();
    if patterns.is_empty() {
        builder.add(Glob::new(MATCH_ALL).map_err(|e| LiveError::Config(e.to_string()))?);
    }
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| LiveError::Config(format!("invalid pattern {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| LiveError::Config(e.to_string()))
}

/// Live connection counts per label.
///
/// # Errors
///
/// Returns `LiveError::Store` if the registry cannot be read.
pub async fn list_connections(
    registry: &ConnectionRegistry,
) -> Result<BTreeMap<String, i64>, LiveError> {
    Ok(registry.get_connections().await?)
}

/// Send `action` to every connection of every live label matching
/// `patterns`. Returns the number of channels notified.
///
/// # Errors
///
/// - `LiveError::Config` for an invalid pattern
/// - `LiveError::Store` if the registry or a group cannot be read
pub async fn send_control(
    registry: &ConnectionRegistry,
    layer: &ChannelLayer,
    patterns: &[String],
    action: ControlAction,
    interval: Duration,
) -> Result<usize, LiveError> {
    let matcher = label_matcher(patterns)?;
    let labels: Vec<String> = list_connections(registry)
        .await?
        .into_keys()
        .filter(|label| matcher.is_match(label))
        .collect();

    let mut notified = 0;
    for label in &labels {
        let channels = layer.group_members(&version_group(label)).await?;
        info!(
            target: "live.admin",
            label = %label,
            channels = channels.len(),
            action = action.event_type(),
            "Sending control event"
        );
        for channel in channels {
            if let Err(e) = layer.send(&channel, Event::new(action.event_type())).await {
                warn!(
                    target: "live.admin",
                    channel = %channel,
                    error = %e,
                    "Failed to send control event"
                );
                continue;
            }
            notified += 1;
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
    }
    Ok(notified)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};
    use std::sync::Arc;

    #[test]
    fn test_matcher_defaults_to_everything() {
        let matcher = label_matcher(&[]).unwrap();
        assert!(matcher.is_match("abc123.production"));

        let matcher = label_matcher(&["*.staging".to_string()]).unwrap();
        assert!(matcher.is_match("abc123.staging"));
        assert!(!matcher.is_match("abc123.production"));

        assert!(label_matcher(&["[".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_send_control_targets_matching_labels() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let layer =
            ChannelLayer::new(vec![store.clone()], "test:", Duration::from_secs(3600)).unwrap();
        let old = ConnectionRegistry::new(store.clone(), "old.production");
        let new = ConnectionRegistry::new(store.clone(), "new.production");

        let mut old_channel = layer.new_channel().await;
        layer
            .group_add(&version_group("old.production"), &old_channel.name)
            .await
            .unwrap();
        old.register_connection().await.unwrap();
        let mut new_channel = layer.new_channel().await;
        layer
            .group_add(&version_group("new.production"), &new_channel.name)
            .await
            .unwrap();
        new.register_connection().await.unwrap();

        let notified = send_control(
            &old,
            &layer,
            &["old.*".to_string()],
            ControlAction::Reload,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(notified, 1);
        let event = old_channel.events.recv().await.unwrap();
        assert_eq!(event.kind, "connection.reload");
        assert!(new_channel.events.try_recv().is_err());

        let counts = list_connections(&new).await.unwrap();
        assert_eq!(counts.get("old.production"), Some(&1));
        assert_eq!(counts.get("new.production"), Some(&1));
    }
}
