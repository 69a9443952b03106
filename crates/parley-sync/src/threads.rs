use std::collections::{HashMap, HashSet};

use parley_types::models::Message;
use uuid::Uuid;

/// Per-thread reply counters and reply sequences, fed by both REST fetch
/// and live events.
///
/// The live value is an optimistic increment; a server-derived count from
/// a `ThreadUpdated` event or a fetch always overrides it. Each distinct
/// reply id increments its counter exactly once, however many times the
/// event is delivered.
#[derive(Debug, Default)]
pub struct ThreadCounters {
    counts: HashMap<Uuid, u64>,
    seen_replies: HashSet<Uuid>,
    replies: HashMap<Uuid, Vec<Message>>,
}

impl ThreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live thread reply. Returns false for a duplicate delivery.
    pub fn record_reply(&mut self, reply: Message) -> bool {
        let Some(parent) = reply.thread_id else {
            return false;
        };
        if !self.seen_replies.insert(reply.id) {
            return false;
        }

        *self.counts.entry(parent).or_insert(0) += 1;

        let seq = self.replies.entry(parent).or_default();
        seq.push(reply);
        seq.sort_by_key(|m| m.created_at);
        true
    }

    /// Authoritative override from the server.
    pub fn set_count(&mut self, parent: Uuid, count: u64) {
        self.counts.insert(parent, count);
    }

    /// Seed a thread from a fetched reply list, replacing optimistic state.
    pub fn seed(&mut self, parent: Uuid, mut replies: Vec<Message>) {
        replies.sort_by_key(|m| m.created_at);
        self.counts.insert(parent, replies.len() as u64);
        for r in &replies {
            self.seen_replies.insert(r.id);
        }
        self.replies.insert(parent, replies);
    }

    pub fn count(&self, parent: Uuid) -> u64 {
        self.counts.get(&parent).copied().unwrap_or(0)
    }

    /// Replies for a thread-scoped consumer, oldest first.
    pub fn replies(&self, parent: Uuid) -> &[Message] {
        self.replies.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reply(parent: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            author_username: "ana".into(),
            content: "reply".into(),
            thread_id: Some(parent),
            is_edited: false,
            created_at: Utc::now(),
            reactions: vec![],
            read_by: vec![],
        }
    }

    #[test]
    fn duplicate_reply_increments_once() {
        let mut threads = ThreadCounters::new();
        let parent = Uuid::new_v4();
        let r = reply(parent);

        assert!(threads.record_reply(r.clone()));
        assert!(!threads.record_reply(r));
        assert_eq!(threads.count(parent), 1);
        assert_eq!(threads.replies(parent).len(), 1);
    }

    #[test]
    fn server_count_overrides_optimistic_value() {
        let mut threads = ThreadCounters::new();
        let parent = Uuid::new_v4();
        threads.record_reply(reply(parent));

        threads.set_count(parent, 7);
        assert_eq!(threads.count(parent), 7);
    }

    #[test]
    fn seed_replaces_and_dedups_future_events() {
        let mut threads = ThreadCounters::new();
        let parent = Uuid::new_v4();
        let r = reply(parent);

        threads.seed(parent, vec![r.clone()]);
        assert_eq!(threads.count(parent), 1);

        // The same reply streaming in later is a duplicate
        assert!(!threads.record_reply(r));
        assert_eq!(threads.count(parent), 1);
    }
}
