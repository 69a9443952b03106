use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, Poll, Reaction};
use crate::topic::Topic;

/// Events sent over the WebSocket gateway, server to client.
///
/// Every event has a fixed schema; payloads are validated by
/// deserialization at the gateway boundary, never passed through as loose
/// JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the authenticated connection is live.
    Ready { user_id: Uuid, username: String },

    /// One-shot presence snapshot sent right after Ready, so the client
    /// does not have to wait for the next presence transition.
    PresenceSnapshot { entries: Vec<PresenceEntry> },

    /// A committed message was published to its conversation topic.
    /// Thread replies arrive on the same topic; consumers must keep them
    /// out of the main feed.
    MessageDelivered { message: Message },

    /// A message's content was edited in place.
    MessageEdited {
        conversation_id: Uuid,
        message_id: Uuid,
        content: String,
        edited_at: DateTime<Utc>,
    },

    /// A user started typing in a conversation.
    TypingStart {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// A user explicitly stopped typing.
    TypingStop {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    /// A user came online or went offline.
    PresenceChanged {
        user_id: Uuid,
        username: String,
        online: bool,
        last_seen_at: DateTime<Utc>,
    },

    /// One or more messages were marked read by a user.
    ReadReceipt {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    },

    /// The full reaction set of a message after an add or remove.
    ReactionChanged {
        conversation_id: Uuid,
        message_id: Uuid,
        reactions: Vec<Reaction>,
    },

    /// A message was pinned or unpinned.
    PinChanged {
        conversation_id: Uuid,
        message_id: Uuid,
        action: PinAction,
    },

    /// A thread gained a reply. `reply_count` is the server-derived total.
    ThreadUpdated {
        conversation_id: Uuid,
        thread_id: Uuid,
        reply_count: u64,
        last_reply: Message,
    },

    VoteCreated { poll: Poll },

    VoteUpdated { poll: Poll },

    VoteDeleted {
        conversation_id: Uuid,
        poll_id: Uuid,
    },

    /// Conversation metadata changed (rename, membership, ...).
    ConversationUpdated {
        conversation: Conversation,
        change_type: ConversationChange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinAction {
    Pin,
    Unpin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationChange {
    Created,
    Renamed,
    ParticipantsChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub username: String,
    pub online: bool,
    pub last_seen_at: DateTime<Utc>,
}

impl GatewayEvent {
    /// Returns the topic this event is scoped to. Events that return
    /// `None` are global and go to every connection.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::MessageDelivered { message } => Some(Topic::Conversation(message.conversation_id)),
            Self::MessageEdited { conversation_id, .. }
            | Self::TypingStart { conversation_id, .. }
            | Self::TypingStop { conversation_id, .. }
            | Self::ReadReceipt { conversation_id, .. }
            | Self::ReactionChanged { conversation_id, .. }
            | Self::PinChanged { conversation_id, .. }
            | Self::ThreadUpdated { conversation_id, .. }
            | Self::VoteDeleted { conversation_id, .. } => {
                Some(Topic::Conversation(*conversation_id))
            }
            Self::VoteCreated { poll } | Self::VoteUpdated { poll } => {
                Some(Topic::Conversation(poll.conversation_id))
            }
            Self::ConversationUpdated { conversation, .. } => {
                Some(Topic::Conversation(conversation.id))
            }
            // Ready, PresenceSnapshot, PresenceChanged are global/targeted.
            _ => None,
        }
    }
}

/// Commands sent from client to server over the WebSocket.
///
/// Durable writes (send, edit, react, pin, vote) go over the REST API and
/// come back as gateway events; the socket carries topic membership,
/// typing, and read receipts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Join an additional topic (idempotent).
    JoinTopic { topic: Topic },

    /// Leave a topic.
    LeaveTopic { topic: Topic },

    /// Indicate typing in a conversation. Senders refresh this while
    /// typing and send `TypingStop` when done; the quiet-period timeout
    /// is the sender's responsibility.
    TypingStart { conversation_id: Uuid },

    TypingStop { conversation_id: Uuid },

    /// Mark messages read. Idempotent per (message, user).
    MarkRead {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_events_are_topic_scoped() {
        let cid = Uuid::new_v4();
        let ev = GatewayEvent::TypingStart {
            conversation_id: cid,
            user_id: Uuid::new_v4(),
            username: "ana".into(),
        };
        assert_eq!(ev.topic(), Some(Topic::Conversation(cid)));
    }

    #[test]
    fn presence_is_global() {
        let ev = GatewayEvent::PresenceChanged {
            user_id: Uuid::new_v4(),
            username: "ana".into(),
            online: true,
            last_seen_at: Utc::now(),
        };
        assert_eq!(ev.topic(), None);
    }

    #[test]
    fn malformed_command_is_rejected() {
        let raw = r#"{"type":"JoinTopic","data":{"topic":"garbage"}}"#;
        assert!(serde_json::from_str::<GatewayCommand>(raw).is_err());
    }
}
