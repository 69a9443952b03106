use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::topic::Topic;

/// Publish/subscribe fabric: each conversation and each identity is a
/// topic, and connections join and leave topics at any time.
///
/// Publishing is fire-and-forget: delivery to any individual connection is
/// best-effort, a topic with no subscribers silently absorbs the event,
/// and closed subscribers are pruned on the next publish.
#[derive(Clone)]
pub struct RoomRouter {
    inner: Arc<RwLock<HashMap<Topic, TopicEntry>>>,
}

type TopicEntry = HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>;

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Join a connection to a topic. Re-joining an already-joined topic is
    /// a no-op, not an error.
    pub async fn join(&self, conn_id: Uuid, sender: mpsc::UnboundedSender<GatewayEvent>, topic: Topic) {
        let mut map = self.inner.write().await;
        map.entry(topic).or_default().insert(conn_id, sender);
    }

    pub async fn leave(&self, conn_id: Uuid, topic: Topic) {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(&topic) {
            entry.remove(&conn_id);
            if entry.is_empty() {
                map.remove(&topic);
            }
        }
    }

    /// Drop a connection from every topic it joined. Called once on
    /// disconnect.
    pub async fn leave_all(&self, conn_id: Uuid) {
        let mut map = self.inner.write().await;
        map.retain(|_, entry| {
            entry.remove(&conn_id);
            !entry.is_empty()
        });
    }

    /// Publish an event to all subscribers of a topic.
    pub async fn publish(&self, topic: Topic, event: GatewayEvent) {
        self.publish_inner(topic, None, event).await;
    }

    /// Publish to a topic, skipping one connection — used for typing
    /// events, which the originator does not need echoed back.
    pub async fn publish_except(&self, topic: Topic, except: Uuid, event: GatewayEvent) {
        self.publish_inner(topic, Some(except), event).await;
    }

    async fn publish_inner(&self, topic: Topic, except: Option<Uuid>, event: GatewayEvent) {
        let mut map = self.inner.write().await;
        let Some(entry) = map.get_mut(&topic) else {
            // No subscribers: silently absorbed, not an error.
            return;
        };

        entry.retain(|conn_id, tx| {
            if Some(*conn_id) == except {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });

        if entry.is_empty() {
            debug!(topic = %topic, "room router: last subscriber gone");
            map.remove(&topic);
        }
    }

    /// Subscriber count for a topic.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .read()
            .await
            .get(topic)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::Message;

    fn message(conversation_id: Uuid, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            author_id: Uuid::new_v4(),
            author_username: "ana".into(),
            content: content.into(),
            thread_id: None,
            is_edited: false,
            created_at: chrono::Utc::now(),
            reactions: vec![],
            read_by: vec![],
        }
    }

    fn delivered(conversation_id: Uuid, content: &str) -> GatewayEvent {
        GatewayEvent::MessageDelivered {
            message: message(conversation_id, content),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_for_their_topic_only() {
        let router = RoomRouter::new();
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        router.join(conn, tx, Topic::Conversation(conv_a)).await;

        router.publish(Topic::Conversation(conv_b), delivered(conv_b, "b-1")).await;
        assert!(rx.try_recv().is_err(), "received an event for a foreign topic");

        router.publish(Topic::Conversation(conv_a), delivered(conv_a, "a-1")).await;
        match rx.try_recv().unwrap() {
            GatewayEvent::MessageDelivered { message } => assert_eq!(message.content, "a-1"),
            other => panic!("expected MessageDelivered, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let router = RoomRouter::new();
        let conv = Uuid::new_v4();
        let topic = Topic::Conversation(conv);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        router.join(conn, tx.clone(), topic).await;
        router.join(conn, tx, topic).await;

        assert_eq!(router.subscriber_count(&topic).await, 1);

        router.publish(topic, delivered(conv, "once")).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "double join produced a duplicate delivery");
    }

    #[tokio::test]
    async fn publish_to_empty_topic_is_absorbed() {
        let router = RoomRouter::new();
        let conv = Uuid::new_v4();
        // Must not panic or error
        router.publish(Topic::Conversation(conv), delivered(conv, "void")).await;
        assert_eq!(router.subscriber_count(&Topic::Conversation(conv)).await, 0);
    }

    #[tokio::test]
    async fn publish_except_skips_the_originator() {
        let router = RoomRouter::new();
        let conv = Uuid::new_v4();
        let topic = Topic::Conversation(conv);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        router.join(conn_a, tx_a, topic).await;
        router.join(conn_b, tx_b, topic).await;

        router
            .publish_except(
                topic,
                conn_a,
                GatewayEvent::TypingStart {
                    conversation_id: conv,
                    user_id: Uuid::new_v4(),
                    username: "ana".into(),
                },
            )
            .await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let router = RoomRouter::new();
        let conv = Uuid::new_v4();
        let topic = Topic::Conversation(conv);

        let (tx, rx) = mpsc::unbounded_channel();
        router.join(Uuid::new_v4(), tx, topic).await;
        drop(rx);

        router.publish(topic, delivered(conv, "gone")).await;
        assert_eq!(router.subscriber_count(&topic).await, 0);
    }

    #[tokio::test]
    async fn leave_all_clears_every_membership() {
        let router = RoomRouter::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();

        let t1 = Topic::Conversation(Uuid::new_v4());
        let t2 = Topic::User(Uuid::new_v4());
        router.join(conn, tx.clone(), t1).await;
        router.join(conn, tx, t2).await;

        router.leave_all(conn).await;
        assert_eq!(router.subscriber_count(&t1).await, 0);
        assert_eq!(router.subscriber_count(&t2).await, 0);
    }
}
