//! Exhibitors and the contact requests attendees send them.

use chrono::{DateTime, Utc};
use common::types::{RoomId, UserId, WorldId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Booth size in the exhibition hall grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExhibitorSize {
    #[default]
    #[serde(rename = "1x1")]
    Small,
    #[serde(rename = "3x1")]
    Wide,
    #[serde(rename = "3x3")]
    Large,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhibitorLink {
    pub display_text: String,
    pub url: String,
}

/// An exhibitor of a world, optionally placed in an exhibition room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exhibitor {
    pub id: Uuid,
    pub world_id: WorldId,
    pub name: String,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub short_text: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub size: ExhibitorSize,
    #[serde(default)]
    pub sorting_priority: i32,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub links: Vec<ExhibitorLink>,
    #[serde(default)]
    pub contact_enabled: bool,
    #[serde(default)]
    pub staff: BTreeSet<UserId>,
}

impl Exhibitor {
    /// Short form used in listings.
    #[must_use]
    pub fn to_summary_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "tagline": self.tagline,
            "short_text": self.short_text,
            "logo": self.logo,
            "size": self.size,
            "sorting_priority": self.sorting_priority,
            "room_id": self.room_id,
        })
    }

    /// Full form; `staff` holds the public records of the staff members.
    #[must_use]
    pub fn to_json(&self, staff: Vec<Value>) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "tagline": self.tagline,
            "short_text": self.short_text,
            "text": self.text,
            "logo": self.logo,
            "size": self.size,
            "sorting_priority": self.sorting_priority,
            "room_id": self.room_id,
            "links": self.links,
            "contact_enabled": self.contact_enabled,
            "staff": staff,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactState {
    Open,
    Answered,
    Missed,
}

/// An attendee asking an exhibitor's staff for a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRequest {
    pub id: Uuid,
    pub exhibitor_id: Uuid,
    pub user_id: UserId,
    pub state: ContactState,
    #[serde(default)]
    pub answered_by: Option<UserId>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exhibitor_defaults() {
        let exhibitor: Exhibitor = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "world_id": "democon",
            "name": "Booth",
        }))
        .unwrap();
        assert_eq!(exhibitor.size, ExhibitorSize::Small);
        assert!(exhibitor.staff.is_empty());
        assert!(!exhibitor.contact_enabled);
        assert_eq!(exhibitor.to_summary_json()["size"], json!("1x1"));
    }

    #[test]
    fn test_size_names() {
        let size: ExhibitorSize = serde_json::from_value(json!("3x3")).unwrap();
        assert_eq!(size, ExhibitorSize::Large);
        assert!(serde_json::from_value::<ExhibitorSize>(json!("2x2")).is_err());
    }
}
