use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A committed chat message as it travels over the gateway and the REST API.
///
/// Immutable once created except for `content`/`is_edited`, `reactions`,
/// and `read_by`. `read_by` is append-only: a receipt is never removed by
/// the server. Messages with a `thread_id` are replies; they belong to the
/// same conversation topic but are excluded from the main feed by every
/// consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub author_id: Uuid,
    pub author_username: String,
    pub content: String,
    /// Parent message id when this message is a thread reply.
    pub thread_id: Option<Uuid>,
    pub is_edited: bool,
    /// Server-assigned at persistence time; the ordering key for feeds.
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<Reaction>,
    pub read_by: Vec<ReadEntry>,
}

/// One (user, emoji) reaction. Unique per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
}

/// One read receipt on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadEntry {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

/// A poll attached to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub author_id: Uuid,
    pub question: String,
    pub options: Vec<PollOption>,
    pub allow_multiple: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: Uuid,
    pub label: String,
    pub voters: Vec<Uuid>,
}

impl Poll {
    /// Lazily evaluated expiry: a poll past `expires_at` is inactive
    /// regardless of the stored flag.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|e| e > now)
    }
}
