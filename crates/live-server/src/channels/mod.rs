//! Channel layer: addressable per-connection mailboxes and named groups.
//!
//! Each connection owns a channel named `{process}!{id}`. Messages to a
//! channel owned by this process are delivered in memory; messages to
//! channels of other processes are published on that process's topic in the
//! shared store. Group membership lives in sorted sets on the shard chosen by
//! [`consistent_hash`] of the group name.

pub mod groups;
pub mod layer;
pub mod shard;

pub use layer::{ChannelLayer, ChannelReceiver};
pub use shard::consistent_hash;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message travelling through the channel layer.
///
/// The `type` field selects the handler on the receiving connection; every
/// other field is payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Create an event without payload.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Map::new(),
        }
    }

    /// Add a payload field.
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    /// Read a payload field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The module namespace of the event (`poll` for `poll.deleted`).
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.kind.split('.').next().unwrap_or_default()
    }

    /// Payload as a JSON object, without the `type` field.
    #[must_use]
    pub fn payload(&self) -> Value {
        Value::Object(self.data.clone())
    }
}
