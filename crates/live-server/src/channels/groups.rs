//! Group naming.
//!
//! Every fan-out target in the live server is a named group. Names are
//! restricted to ASCII alphanumerics plus `-`, `_` and `.` and must be
//! shorter than 100 characters so they are safe as store keys.

use common::types::{RoomId, UserId, WorldId};
use uuid::Uuid;

/// Maximum accepted group name length.
pub const MAX_GROUP_NAME_LEN: usize = 100;

/// Whether a group name is acceptable to the channel layer.
#[must_use]
pub fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < MAX_GROUP_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Every connection of one deployment label (`{commit}.{environment}`).
#[must_use]
pub fn version_group(label: &str) -> String {
    format!("version.{label}")
}

/// Every connection of one user.
#[must_use]
pub fn user_group(user: UserId) -> String {
    format!("user.{user}")
}

/// Every authenticated connection of one world.
#[must_use]
pub fn world_group(world: &WorldId) -> String {
    format!("world.{world}")
}

/// Connections that entered a room.
#[must_use]
pub fn room_group(room: RoomId) -> String {
    format!("room.{room}")
}

/// Connections subscribed to a chat channel.
#[must_use]
pub fn chat_group(channel: Uuid) -> String {
    format!("chat.{channel}")
}

/// Poll audience of a room; managers get drafts and results.
#[must_use]
pub fn poll_group(room: RoomId, manage: bool) -> String {
    if manage {
        format!("room.{room}.poll.manage")
    } else {
        format!("room.{room}.poll")
    }
}

/// Question audience of a room; moderators also see the moderation queue.
#[must_use]
pub fn question_group(room: RoomId, moderate: bool) -> String {
    if moderate {
        format!("room.{room}.question.moderate")
    } else {
        format!("room.{room}.question")
    }
}
