use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::models::Message;

use crate::engine::{ConversationView, SyncEffect};
use crate::{StoreError, SyncError};

/// External store the runner confirms optimistic state against. The
/// concrete implementation is the application's HTTP client.
#[allow(async_fn_in_trait)]
pub trait ViewStore {
    async fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
        thread_id: Option<Uuid>,
    ) -> Result<Message, StoreError>;

    async fn confirm_read(
        &self,
        conversation_id: Uuid,
        message_ids: &[Uuid],
    ) -> Result<(), StoreError>;

    async fn fetch_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;
}

/// Drives one [`ConversationView`]: feeds it events, performs the effects
/// it requests, and rolls optimistic state back when the store says no.
pub struct ViewRunner<S> {
    view: ConversationView,
    store: S,
}

impl<S: ViewStore> ViewRunner<S> {
    pub fn new(view: ConversationView, store: S) -> Self {
        Self { view, store }
    }

    pub fn view(&self) -> &ConversationView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ConversationView {
        &mut self.view
    }

    /// Merge a pushed event and carry out whatever the engine asks for.
    /// A failed read confirmation is rolled back and logged, not surfaced:
    /// receipts are best-effort and the message itself already rendered.
    pub async fn handle_event(&mut self, event: GatewayEvent) {
        let effects = self.view.apply_event(event, Utc::now());
        for effect in effects {
            match effect {
                SyncEffect::ConfirmRead {
                    conversation_id,
                    message_ids,
                } => {
                    if let Err(err) = self
                        .store
                        .confirm_read(conversation_id, &message_ids)
                        .await
                    {
                        warn!("read confirmation failed, rolling back: {err}");
                        self.view.rollback_read(&message_ids);
                    }
                }
            }
        }
    }

    /// Optimistic send: the caller clears its input before awaiting this.
    /// On failure the draft comes back inside the error.
    pub async fn send(&mut self, content: &str, thread_id: Option<Uuid>) -> Result<(), SyncError> {
        let token = self.view.begin_send(content);
        match self
            .store
            .send_message(self.view.conversation_id(), content, thread_id)
            .await
        {
            Ok(message) => {
                self.view.complete_send(token, message);
                Ok(())
            }
            Err(source) => {
                let draft = self.view.fail_send(token).unwrap_or_default();
                Err(SyncError::SendFailed { draft, source })
            }
        }
    }

    /// Re-fetch after a reconnect; in-memory state is treated as stale and
    /// replaced wholesale.
    pub async fn resync(&mut self) -> Result<(), StoreError> {
        let fetched = self.store.fetch_messages(self.view.conversation_id()).await?;
        self.view.load_snapshot(fetched);
        Ok(())
    }
}
