use std::sync::Arc;

use tracing::warn;

use parley_db::Database;
use parley_types::events::GatewayEvent;
use parley_types::models::Message;
use parley_types::topic::Topic;

/// Fans a committed message out to its conversation topic.
///
/// Precondition: the message is already durably persisted — the pipeline
/// never performs the write itself, and a write that failed upstream must
/// never reach it. Publishing is fire-and-forget; there is no per-client
/// acknowledgment or retry at this layer.
#[derive(Clone)]
pub struct DeliveryPipeline {
    router: crate::router::RoomRouter,
    db: Arc<Database>,
}

impl DeliveryPipeline {
    pub fn new(router: crate::router::RoomRouter, db: Arc<Database>) -> Self {
        Self { router, db }
    }

    /// Deliver a committed message. Thread replies travel on the same
    /// conversation topic — consumers keep them out of the main feed —
    /// and additionally produce a `ThreadUpdated` event whose count is
    /// re-derived from the store. `client_count` is the sender's
    /// last-known reply count, used only when that lookup fails.
    pub async fn deliver(&self, message: Message, client_count: Option<u64>) {
        let topic = Topic::Conversation(message.conversation_id);
        let thread_id = message.thread_id;

        self.router
            .publish(topic, GatewayEvent::MessageDelivered {
                message: message.clone(),
            })
            .await;

        let Some(thread_id) = thread_id else {
            return;
        };

        let db = self.db.clone();
        let parent = thread_id.to_string();
        let counted = tokio::task::spawn_blocking(move || db.count_thread_replies(&parent)).await;

        let reply_count = match counted {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("Reply count lookup failed for thread {}: {}; using client increment", thread_id, e);
                client_count.map_or(1, |c| c + 1)
            }
            Err(e) => {
                warn!("Reply count task failed for thread {}: {}; using client increment", thread_id, e);
                client_count.map_or(1, |c| c + 1)
            }
        };

        self.router
            .publish(topic, GatewayEvent::ThreadUpdated {
                conversation_id: message.conversation_id,
                thread_id,
                reply_count,
                last_reply: message,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::router::RoomRouter;

    fn test_message(conversation_id: Uuid, author_id: Uuid, content: &str, thread_id: Option<Uuid>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            author_id,
            author_username: "ana".into(),
            content: content.into(),
            thread_id,
            is_edited: false,
            created_at: Utc::now(),
            reactions: vec![],
            read_by: vec![],
        }
    }

    async fn fixture() -> (DeliveryPipeline, RoomRouter, Arc<Database>, Uuid, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let author = Uuid::new_v4();
        db.create_user(&author.to_string(), "ana", "hash").unwrap();
        let conversation: Uuid = "00000000-0000-0000-0000-000000000001".parse().unwrap();

        let router = RoomRouter::new();
        let pipeline = DeliveryPipeline::new(router.clone(), db.clone());
        (pipeline, router, db, conversation, author)
    }

    #[tokio::test]
    async fn committed_message_reaches_the_conversation_topic() {
        let (pipeline, router, db, conversation, author) = fixture().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.join(Uuid::new_v4(), tx, Topic::Conversation(conversation)).await;

        let msg = test_message(conversation, author, "hello", None);
        db.insert_message(
            &msg.id.to_string(),
            &conversation.to_string(),
            &author.to_string(),
            &msg.content,
            None,
            msg.created_at,
        )
        .unwrap();

        pipeline.deliver(msg.clone(), None).await;

        match rx.try_recv().unwrap() {
            GatewayEvent::MessageDelivered { message } => assert_eq!(message.id, msg.id),
            other => panic!("expected MessageDelivered, got: {other:?}"),
        }
        // No thread event for a plain message
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn thread_reply_emits_authoritative_count() {
        let (pipeline, router, db, conversation, author) = fixture().await;

        let parent = test_message(conversation, author, "root", None);
        db.insert_message(
            &parent.id.to_string(),
            &conversation.to_string(),
            &author.to_string(),
            "root",
            None,
            parent.created_at,
        )
        .unwrap();

        let reply = test_message(conversation, author, "reply", Some(parent.id));
        db.insert_message(
            &reply.id.to_string(),
            &conversation.to_string(),
            &author.to_string(),
            "reply",
            Some(&parent.id.to_string()),
            reply.created_at,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.join(Uuid::new_v4(), tx, Topic::Conversation(conversation)).await;

        // A stale client count must not win over the store's answer
        pipeline.deliver(reply.clone(), Some(41)).await;

        match rx.try_recv().unwrap() {
            GatewayEvent::MessageDelivered { message } => {
                assert_eq!(message.thread_id, Some(parent.id));
            }
            other => panic!("expected MessageDelivered, got: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            GatewayEvent::ThreadUpdated { thread_id, reply_count, last_reply, .. } => {
                assert_eq!(thread_id, parent.id);
                assert_eq!(reply_count, 1);
                assert_eq!(last_reply.id, reply.id);
            }
            other => panic!("expected ThreadUpdated, got: {other:?}"),
        }
    }
}
