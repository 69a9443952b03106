use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named broadcast channel. Connections subscribe to topics; events are
/// published to exactly one topic (or to all connections for global events).
///
/// Wire form: `user:<uuid>` or `conversation:<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// Private per-identity topic — targeted events for one user.
    User(Uuid),
    /// Shared per-conversation topic.
    Conversation(Uuid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{id}"),
            Topic::Conversation(id) => write!(f, "conversation:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParseError(pub String);

impl fmt::Display for TopicParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid topic: {}", self.0)
    }
}

impl std::error::Error for TopicParseError {}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| TopicParseError(s.to_string()))?;
        let id: Uuid = id.parse().map_err(|_| TopicParseError(s.to_string()))?;
        match kind {
            "user" => Ok(Topic::User(id)),
            "conversation" => Ok(Topic::Conversation(id)),
            _ => Err(TopicParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> String {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_wire_form() {
        let id = Uuid::new_v4();
        let t: Topic = format!("conversation:{id}").parse().unwrap();
        assert_eq!(t, Topic::Conversation(id));
        assert_eq!(t.to_string(), format!("conversation:{id}"));
    }

    #[test]
    fn rejects_malformed_topics() {
        assert!("conversation".parse::<Topic>().is_err());
        assert!("room:not-a-uuid".parse::<Topic>().is_err());
        assert!(format!("channel:{}", Uuid::new_v4()).parse::<Topic>().is_err());
    }
}
