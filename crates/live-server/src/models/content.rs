//! Records mutated by the room modules.

use chrono::{DateTime, Utc};
use common::types::{RoomId, UserId, WorldId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// A user's presence in a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomView {
    pub id: Uuid,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// A chat channel: the chat of a room, or a direct conversation.
///
/// A room's channel shares the room's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChannel {
    pub id: Uuid,
    pub world_id: WorldId,
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

impl ChatChannel {
    #[must_use]
    pub fn for_room(world_id: WorldId, room: RoomId) -> Self {
        Self {
            id: room.0,
            world_id,
            room_id: Some(room),
        }
    }

    /// Direct channels have fixed members and no room.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.room_id.is_none()
    }
}

/// A chat event in a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub event_id: u64,
    pub channel: Uuid,
    pub sender: UserId,
    pub event_type: String,
    pub content: Value,
    /// Event whose content this one replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Membership event types are not counted for unread notifications.
pub const MEMBER_EVENT: &str = "channel.member";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Draft,
    Open,
    Closed,
    Archived,
}

impl PollState {
    /// Drafts and archived polls are only shown to poll managers.
    #[must_use]
    pub fn managers_only(self) -> bool {
        matches!(self, PollState::Draft | PollState::Archived)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollType {
    /// Exactly one option per vote.
    Choice,
    /// One or more options per vote.
    Multi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: Uuid,
    pub content: String,
    pub order: u32,
}

/// A poll in a room.
#[derive(Debug, Clone)]
pub struct Poll {
    pub id: Uuid,
    pub room_id: RoomId,
    pub content: String,
    pub state: PollState,
    pub poll_type: PollType,
    pub is_pinned: bool,
    pub options: Vec<PollOption>,
    pub votes: HashMap<UserId, Vec<Uuid>>,
    pub timestamp: DateTime<Utc>,
}

impl Poll {
    /// Record a vote. Errors carry a user-facing reason.
    ///
    /// # Errors
    ///
    /// Returns a message if the poll is not open, the user already voted, or
    /// the option selection is invalid for the poll type.
    pub fn vote(&mut self, user: UserId, options: Vec<Uuid>) -> Result<(), String> {
        if self.state != PollState::Open {
            return Err("Poll is not open.".to_string());
        }
        if self.votes.contains_key(&user) {
            return Err("You already voted.".to_string());
        }
        let unique: BTreeSet<Uuid> = options.iter().copied().collect();
        if unique.is_empty() || unique.len() != options.len() {
            return Err("Invalid selection.".to_string());
        }
        if self.poll_type == PollType::Choice && unique.len() != 1 {
            return Err("Only one option may be selected.".to_string());
        }
        if !unique
            .iter()
            .all(|id| self.options.iter().any(|o| o.id == *id))
        {
            return Err("Unknown option.".to_string());
        }
        self.votes.insert(user, options);
        Ok(())
    }

    /// Vote count per option.
    #[must_use]
    pub fn results(&self) -> BTreeMap<Uuid, usize> {
        let mut results: BTreeMap<Uuid, usize> =
            self.options.iter().map(|o| (o.id, 0)).collect();
        for choice in self.votes.values().flatten() {
            if let Some(count) = results.get_mut(choice) {
                *count += 1;
            }
        }
        results
    }

    /// Poll as sent to clients. Results are included for managers, for users
    /// who voted and once the poll is closed.
    #[must_use]
    pub fn to_json(&self, for_user: Option<UserId>, manager: bool) -> Value {
        let voted = for_user.is_some_and(|u| self.votes.contains_key(&u));
        let mut value = json!({
            "id": self.id,
            "room": self.room_id,
            "content": self.content,
            "state": self.state,
            "poll_type": self.poll_type,
            "is_pinned": self.is_pinned,
            "options": self.options,
            "timestamp": self.timestamp,
        });
        if manager || voted || self.state == PollState::Closed {
            value["results"] = json!(self.results());
        }
        if for_user.is_some() {
            value["voted"] = json!(voted);
        }
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionState {
    /// Awaiting moderation, visible to moderators and the sender.
    ModQueue,
    Visible,
    Archived,
}

/// A question asked in a room.
#[derive(Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub room_id: RoomId,
    pub sender: UserId,
    pub content: String,
    pub state: QuestionState,
    pub answered: bool,
    pub is_pinned: bool,
    pub votes: BTreeSet<UserId>,
    pub timestamp: DateTime<Utc>,
}

impl Question {
    /// Question as sent to clients.
    #[must_use]
    pub fn to_json(&self, for_user: Option<UserId>) -> Value {
        let mut value = json!({
            "id": self.id,
            "room": self.room_id,
            "content": self.content,
            "state": self.state,
            "answered": self.answered,
            "is_pinned": self.is_pinned,
            "score": self.votes.len(),
            "timestamp": self.timestamp,
        });
        if let Some(user) = for_user {
            value["voted"] = json!(self.votes.contains(&user));
            value["own"] = json!(self.sender == user);
        }
        value
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn poll(poll_type: PollType) -> Poll {
        Poll {
            id: Uuid::new_v4(),
            room_id: RoomId::new(),
            content: "Tea or coffee?".to_string(),
            state: PollState::Open,
            poll_type,
            is_pinned: false,
            options: vec![
                PollOption {
                    id: Uuid::new_v4(),
                    content: "Tea".to_string(),
                    order: 1,
                },
                PollOption {
                    id: Uuid::new_v4(),
                    content: "Coffee".to_string(),
                    order: 2,
                },
            ],
            votes: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    fn option_ids(poll: &Poll) -> Vec<Uuid> {
        poll.options.iter().map(|o| o.id).collect()
    }

    #[test]
    fn test_choice_vote_counts() {
        let mut p = poll(PollType::Choice);
        let ids = option_ids(&p);
        let tea = *ids.first().unwrap();

        p.vote(UserId::new(), vec![tea]).unwrap();
        p.vote(UserId::new(), vec![tea]).unwrap();

        assert_eq!(p.results().get(&tea), Some(&2));
        assert_eq!(p.results().get(ids.get(1).unwrap()), Some(&0));
    }

    #[test]
    fn test_vote_rejections() {
        let mut p = poll(PollType::Choice);
        let ids = option_ids(&p);
        let user = UserId::new();

        assert!(p.vote(user, ids.clone()).is_err(), "choice allows one option");
        assert!(p.vote(user, vec![]).is_err());
        assert!(p.vote(user, vec![Uuid::new_v4()]).is_err());

        p.vote(user, vec![*ids.first().unwrap()]).unwrap();
        assert!(p.vote(user, vec![*ids.first().unwrap()]).is_err(), "double vote");

        p.state = PollState::Closed;
        assert!(p.vote(UserId::new(), vec![*ids.first().unwrap()]).is_err());
    }

    #[test]
    fn test_multi_vote() {
        let mut p = poll(PollType::Multi);
        let ids = option_ids(&p);
        p.vote(UserId::new(), ids.clone()).unwrap();
        assert!(p.results().values().all(|c| *c == 1));

        let first = *ids.first().unwrap();
        assert!(p.vote(UserId::new(), vec![first, first]).is_err());
    }

    #[test]
    fn test_results_visibility() {
        let mut p = poll(PollType::Choice);
        let voter = UserId::new();
        let bystander = UserId::new();
        p.vote(voter, vec![*option_ids(&p).first().unwrap()]).unwrap();

        assert!(p.to_json(Some(bystander), false).get("results").is_none());
        assert!(p.to_json(Some(voter), false).get("results").is_some());
        assert!(p.to_json(None, true).get("results").is_some());
        assert_eq!(p.to_json(Some(voter), false)["voted"], true);
    }

    #[test]
    fn test_question_json_score() {
        let sender = UserId::new();
        let q = Question {
            id: Uuid::new_v4(),
            room_id: RoomId::new(),
            sender,
            content: "Why?".to_string(),
            state: QuestionState::Visible,
            answered: false,
            is_pinned: false,
            votes: [UserId::new(), sender].into_iter().collect(),
            timestamp: Utc::now(),
        };
        let json = q.to_json(Some(sender));
        assert_eq!(json["score"], 2);
        assert_eq!(json["voted"], true);
        assert_eq!(json["own"], true);
        assert_eq!(json["state"], "visible");
    }
}
