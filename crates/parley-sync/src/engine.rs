use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::trace;
use uuid::Uuid;

use parley_types::events::{GatewayEvent, PinAction};
use parley_types::models::{Message, ReadEntry};

use crate::pins::PinnedSet;
use crate::polls::PollBoard;
use crate::threads::ThreadCounters;
use crate::typing::TypingView;

/// Side effects the engine asks its driver to perform. The engine itself
/// never does I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    /// Confirm optimistically-applied read receipts through the store; on
    /// failure the driver calls [`ConversationView::rollback_read`].
    ConfirmRead {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    },
}

/// Per-view reconciliation state: an ordered message sequence plus the
/// derived-state trackers, converging on the same logical state in every
/// instance regardless of event arrival order.
///
/// Duplicates are dropped by message id, order is re-derived from
/// `created_at` (stable, so ties keep arrival order), and thread replies
/// never enter the main sequence.
pub struct ConversationView {
    local_identity: Uuid,
    conversation_id: Uuid,
    /// While focused, messages from other senders are optimistically
    /// marked read on arrival.
    focused: bool,
    conversation_name: Option<String>,
    messages: Vec<Message>,
    seen: HashSet<Uuid>,
    pending_sends: HashMap<Uuid, String>,
    pub threads: ThreadCounters,
    pub pins: PinnedSet,
    pub polls: PollBoard,
    pub typing: TypingView,
}

impl ConversationView {
    pub fn new(local_identity: Uuid, conversation_id: Uuid) -> Self {
        Self {
            local_identity,
            conversation_id,
            focused: false,
            conversation_name: None,
            messages: Vec::new(),
            seen: HashSet::new(),
            pending_sends: HashMap::new(),
            threads: ThreadCounters::new(),
            pins: PinnedSet::new(),
            polls: PollBoard::new(),
            typing: TypingView::new(),
        }
    }

    pub fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// The main feed, ascending by `created_at`. Thread replies are never
    /// in here.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversation_name(&self) -> Option<&str> {
        self.conversation_name.as_deref()
    }

    /// Merge one pushed event. Events scoped to other conversations are
    /// ignored — each view converges independently.
    pub fn apply_event(&mut self, event: GatewayEvent, now: DateTime<Utc>) -> Vec<SyncEffect> {
        match event {
            GatewayEvent::MessageDelivered { message } => {
                if message.conversation_id != self.conversation_id {
                    return vec![];
                }
                self.merge_message(message, now)
            }

            GatewayEvent::MessageEdited {
                conversation_id,
                message_id,
                content,
                ..
            } => {
                if conversation_id != self.conversation_id {
                    return vec![];
                }
                // Absent target: the authoritative value shows up on the
                // next fetch of that message — a no-op here, not an error.
                if let Some(msg) = self.messages.iter_mut().find(|m| m.id == message_id) {
                    msg.content = content;
                    msg.is_edited = true;
                } else {
                    trace!("edit for unloaded message {message_id}, ignored");
                }
                vec![]
            }

            GatewayEvent::ReactionChanged {
                conversation_id,
                message_id,
                reactions,
            } => {
                if conversation_id != self.conversation_id {
                    return vec![];
                }
                if let Some(msg) = self.messages.iter_mut().find(|m| m.id == message_id) {
                    msg.reactions = reactions;
                }
                vec![]
            }

            GatewayEvent::ReadReceipt {
                conversation_id,
                message_ids,
                user_id,
                read_at,
            } => {
                if conversation_id != self.conversation_id {
                    return vec![];
                }
                for mid in message_ids {
                    if let Some(msg) = self.messages.iter_mut().find(|m| m.id == mid)
                        && !msg.read_by.iter().any(|r| r.user_id == user_id)
                    {
                        msg.read_by.push(ReadEntry { user_id, read_at });
                    }
                }
                vec![]
            }

            GatewayEvent::PinChanged {
                conversation_id,
                message_id,
                action,
            } => {
                if conversation_id != self.conversation_id {
                    return vec![];
                }
                match action {
                    PinAction::Pin => self.pins.pin(message_id),
                    PinAction::Unpin => self.pins.unpin(message_id),
                }
                vec![]
            }

            GatewayEvent::ThreadUpdated {
                conversation_id,
                thread_id,
                reply_count,
                ..
            } => {
                if conversation_id != self.conversation_id {
                    return vec![];
                }
                // Server-derived count beats any local increment.
                self.threads.set_count(thread_id, reply_count);
                vec![]
            }

            GatewayEvent::TypingStart {
                conversation_id,
                user_id,
                username,
            } => {
                if conversation_id == self.conversation_id && user_id != self.local_identity {
                    self.typing.refresh(user_id, &username, now);
                }
                vec![]
            }

            GatewayEvent::TypingStop {
                conversation_id,
                user_id,
            } => {
                if conversation_id == self.conversation_id {
                    self.typing.stop(user_id);
                }
                vec![]
            }

            GatewayEvent::VoteCreated { poll } | GatewayEvent::VoteUpdated { poll } => {
                if poll.conversation_id == self.conversation_id {
                    self.polls.upsert(poll);
                }
                vec![]
            }

            GatewayEvent::VoteDeleted {
                conversation_id,
                poll_id,
            } => {
                if conversation_id == self.conversation_id {
                    self.polls.remove(poll_id);
                }
                vec![]
            }

            GatewayEvent::ConversationUpdated { conversation, .. } => {
                if conversation.id == self.conversation_id {
                    self.conversation_name = Some(conversation.name);
                }
                vec![]
            }

            // Connection-scoped events; nothing for a view to merge.
            GatewayEvent::Ready { .. }
            | GatewayEvent::PresenceSnapshot { .. }
            | GatewayEvent::PresenceChanged { .. } => vec![],
        }
    }

    fn merge_message(&mut self, message: Message, now: DateTime<Utc>) -> Vec<SyncEffect> {
        // Thread replies update the counter and the thread-scoped view,
        // never the main sequence.
        if message.thread_id.is_some() {
            self.threads.record_reply(message);
            return vec![];
        }

        let from_other = message.author_id != self.local_identity;
        let message_id = message.id;

        if !self.insert_unseen(message) {
            // Duplicate delivery: a no-op, not a second render.
            return vec![];
        }

        if from_other && self.focused {
            self.apply_optimistic_read(message_id, now);
            return vec![SyncEffect::ConfirmRead {
                conversation_id: self.conversation_id,
                message_ids: vec![message_id],
            }];
        }

        vec![]
    }

    /// Dedup-checked insert followed by a stable re-sort, guarding against
    /// events arriving out of timestamp order.
    fn insert_unseen(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        self.messages.sort_by_key(|m| m.created_at);
        true
    }

    fn apply_optimistic_read(&mut self, message_id: Uuid, now: DateTime<Utc>) {
        if let Some(msg) = self.messages.iter_mut().find(|m| m.id == message_id)
            && !msg.read_by.iter().any(|r| r.user_id == self.local_identity)
        {
            msg.read_by.push(ReadEntry {
                user_id: self.local_identity,
                read_at: now,
            });
        }
    }

    /// Undo optimistic receipts after a failed confirmation.
    pub fn rollback_read(&mut self, message_ids: &[Uuid]) {
        for mid in message_ids {
            if let Some(msg) = self.messages.iter_mut().find(|m| m.id == *mid) {
                msg.read_by.retain(|r| r.user_id != self.local_identity);
            }
        }
    }

    /// Start an optimistic send: the UI clears its input immediately and
    /// holds this token. The draft is kept for restoration on failure.
    pub fn begin_send(&mut self, draft: &str) -> Uuid {
        let token = Uuid::new_v4();
        self.pending_sends.insert(token, draft.to_string());
        token
    }

    /// The store confirmed the send. The returned message goes through the
    /// same dedup as a pushed event, because the server push for it may
    /// have arrived first — either order must end with exactly one entry.
    pub fn complete_send(&mut self, token: Uuid, message: Message) {
        self.pending_sends.remove(&token);
        if message.thread_id.is_some() {
            self.threads.record_reply(message);
        } else {
            self.insert_unseen(message);
        }
    }

    /// The send failed: hand the draft back so the UI can restore it.
    pub fn fail_send(&mut self, token: Uuid) -> Option<String> {
        self.pending_sends.remove(&token)
    }

    /// Replace local state with a freshly fetched snapshot, used after a
    /// reconnect when in-memory state must be treated as stale. Live
    /// events that already streamed in dedup against the snapshot.
    pub fn load_snapshot(&mut self, fetched: Vec<Message>) {
        self.messages.clear();
        self.seen.clear();
        for msg in fetched {
            // Apply the thread filter here too — every consumer does.
            if msg.thread_id.is_some() {
                self.threads.record_reply(msg);
            } else {
                self.insert_unseen(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn msg_at(conversation_id: Uuid, author_id: Uuid, content: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            author_id,
            author_username: "ben".into(),
            content: content.into(),
            thread_id: None,
            is_edited: false,
            created_at: at,
            reactions: vec![],
            read_by: vec![],
        }
    }

    fn delivered(message: Message) -> GatewayEvent {
        GatewayEvent::MessageDelivered { message }
    }

    fn view() -> (ConversationView, Uuid, Uuid) {
        let me = Uuid::new_v4();
        let conv = Uuid::new_v4();
        (ConversationView::new(me, conv), me, conv)
    }

    #[test]
    fn duplicate_delivery_renders_once() {
        let (mut view, _me, conv) = view();
        let m = msg_at(conv, Uuid::new_v4(), "hi", Utc::now());

        view.apply_event(delivered(m.clone()), Utc::now());
        view.apply_event(delivered(m), Utc::now());

        assert_eq!(view.messages().len(), 1);
    }

    #[test]
    fn sequence_is_sorted_by_created_at_regardless_of_arrival() {
        let (mut view, _me, conv) = view();
        let base = Utc::now();
        let author = Uuid::new_v4();

        let m1 = msg_at(conv, author, "first", base);
        let m2 = msg_at(conv, author, "second", base + Duration::seconds(1));
        let m3 = msg_at(conv, author, "third", base + Duration::seconds(2));

        // Network jitter: arrival order 3, 1, 2
        for m in [m3, m1, m2] {
            view.apply_event(delivered(m), Utc::now());
        }

        let contents: Vec<&str> = view.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let (mut view, _me, conv) = view();
        let t = Utc::now();
        let author = Uuid::new_v4();

        let a = msg_at(conv, author, "a", t);
        let b = msg_at(conv, author, "b", t);
        view.apply_event(delivered(a), t);
        view.apply_event(delivered(b), t);

        let contents: Vec<&str> = view.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["a", "b"]);
    }

    #[test]
    fn thread_reply_never_enters_main_feed_and_counts_once() {
        let (mut view, _me, conv) = view();
        let parent = msg_at(conv, Uuid::new_v4(), "root", Utc::now());
        let parent_id = parent.id;
        view.apply_event(delivered(parent), Utc::now());

        let mut reply = msg_at(conv, Uuid::new_v4(), "reply", Utc::now());
        reply.thread_id = Some(parent_id);

        view.apply_event(delivered(reply.clone()), Utc::now());
        view.apply_event(delivered(reply), Utc::now());

        assert_eq!(view.messages().len(), 1, "reply leaked into the main feed");
        assert_eq!(view.threads.count(parent_id), 1);
        assert_eq!(view.threads.replies(parent_id).len(), 1);
    }

    #[test]
    fn focused_view_optimistically_marks_read_and_requests_confirmation() {
        let (mut view, me, conv) = view();
        view.set_focused(true);
        let m = msg_at(conv, Uuid::new_v4(), "hello", Utc::now());
        let mid = m.id;

        let effects = view.apply_event(delivered(m), Utc::now());

        assert_eq!(
            effects,
            vec![SyncEffect::ConfirmRead {
                conversation_id: conv,
                message_ids: vec![mid],
            }]
        );
        let read_by = &view.messages()[0].read_by;
        assert_eq!(read_by.len(), 1);
        assert_eq!(read_by[0].user_id, me);
    }

    #[test]
    fn unfocused_view_does_not_mark_read() {
        let (mut view, _me, conv) = view();
        let m = msg_at(conv, Uuid::new_v4(), "hello", Utc::now());

        let effects = view.apply_event(delivered(m), Utc::now());

        assert!(effects.is_empty());
        assert!(view.messages()[0].read_by.is_empty());
    }

    #[test]
    fn own_message_is_not_optimistically_marked_read() {
        let (mut view, me, conv) = view();
        view.set_focused(true);
        let m = msg_at(conv, me, "mine", Utc::now());

        let effects = view.apply_event(delivered(m), Utc::now());
        assert!(effects.is_empty());
    }

    #[test]
    fn rollback_removes_only_the_local_receipt() {
        let (mut view, me, conv) = view();
        view.set_focused(true);
        let other = Uuid::new_v4();
        let mut m = msg_at(conv, other, "hello", Utc::now());
        m.read_by.push(ReadEntry {
            user_id: other,
            read_at: Utc::now(),
        });
        let mid = m.id;

        view.apply_event(delivered(m), Utc::now());
        assert_eq!(view.messages()[0].read_by.len(), 2);

        view.rollback_read(&[mid]);
        let read_by = &view.messages()[0].read_by;
        assert_eq!(read_by.len(), 1);
        assert_eq!(read_by[0].user_id, other);
        assert!(!read_by.iter().any(|r| r.user_id == me));
    }

    #[test]
    fn read_receipt_event_is_idempotent() {
        let (mut view, _me, conv) = view();
        let m = msg_at(conv, Uuid::new_v4(), "hello", Utc::now());
        let mid = m.id;
        let reader = Uuid::new_v4();
        view.apply_event(delivered(m), Utc::now());

        let receipt = GatewayEvent::ReadReceipt {
            conversation_id: conv,
            message_ids: vec![mid],
            user_id: reader,
            read_at: Utc::now(),
        };
        view.apply_event(receipt.clone(), Utc::now());
        view.apply_event(receipt, Utc::now());

        assert_eq!(view.messages()[0].read_by.len(), 1);
    }

    #[test]
    fn optimistic_echo_push_arrives_before_confirmation() {
        let (mut view, me, conv) = view();
        let token = view.begin_send("hello");

        // The server push for m1 beats the REST response
        let m1 = msg_at(conv, me, "hello", Utc::now());
        view.apply_event(delivered(m1.clone()), Utc::now());
        view.complete_send(token, m1);

        let bubbles: Vec<&str> = view.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(bubbles, ["hello"], "expected exactly one hello bubble");
    }

    #[test]
    fn optimistic_echo_confirmation_arrives_before_push() {
        let (mut view, me, conv) = view();
        let token = view.begin_send("hello");

        let m1 = msg_at(conv, me, "hello", Utc::now());
        view.complete_send(token, m1.clone());
        view.apply_event(delivered(m1), Utc::now());

        assert_eq!(view.messages().len(), 1);
    }

    #[test]
    fn failed_send_restores_the_draft() {
        let (mut view, _me, _conv) = view();
        let token = view.begin_send("don't lose me");

        let draft = view.fail_send(token);
        assert_eq!(draft.as_deref(), Some("don't lose me"));
        assert!(view.messages().is_empty());
    }

    #[test]
    fn edit_and_reaction_on_unloaded_message_are_noops() {
        let (mut view, _me, conv) = view();

        view.apply_event(
            GatewayEvent::MessageEdited {
                conversation_id: conv,
                message_id: Uuid::new_v4(),
                content: "edited".into(),
                edited_at: Utc::now(),
            },
            Utc::now(),
        );
        view.apply_event(
            GatewayEvent::ReactionChanged {
                conversation_id: conv,
                message_id: Uuid::new_v4(),
                reactions: vec![],
            },
            Utc::now(),
        );

        assert!(view.messages().is_empty());
    }

    #[test]
    fn edit_updates_loaded_message_in_place() {
        let (mut view, _me, conv) = view();
        let m = msg_at(conv, Uuid::new_v4(), "tpyo", Utc::now());
        let mid = m.id;
        view.apply_event(delivered(m), Utc::now());

        view.apply_event(
            GatewayEvent::MessageEdited {
                conversation_id: conv,
                message_id: mid,
                content: "typo".into(),
                edited_at: Utc::now(),
            },
            Utc::now(),
        );

        assert_eq!(view.messages()[0].content, "typo");
        assert!(view.messages()[0].is_edited);
    }

    #[test]
    fn events_for_other_conversations_are_ignored() {
        let (mut view, _me, _conv) = view();
        let foreign = msg_at(Uuid::new_v4(), Uuid::new_v4(), "elsewhere", Utc::now());

        view.apply_event(delivered(foreign), Utc::now());
        assert!(view.messages().is_empty());
    }

    #[test]
    fn reconnect_refetch_does_not_duplicate_streamed_messages() {
        let (mut view, _me, conv) = view();
        let base = Utc::now();
        let author = Uuid::new_v4();

        // One message streamed in just before the disconnect was noticed
        let m1 = msg_at(conv, author, "m1", base);
        view.apply_event(delivered(m1.clone()), base);

        // Reconnect: state is stale, re-fetch returns m1 plus three newer
        let m2 = msg_at(conv, author, "m2", base + Duration::seconds(1));
        let m3 = msg_at(conv, author, "m3", base + Duration::seconds(2));
        let m4 = msg_at(conv, author, "m4", base + Duration::seconds(3));
        view.load_snapshot(vec![m1.clone(), m2.clone(), m3.clone(), m4.clone()]);

        assert_eq!(view.messages().len(), 4);

        // The live push for m4 may still arrive after the fetch
        view.apply_event(delivered(m4), Utc::now());
        assert_eq!(view.messages().len(), 4);
    }
}
