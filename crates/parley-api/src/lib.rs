//! REST surface for durable writes. Every mutation persists first, then
//! hands the committed state to the gateway for fan-out — an event is never
//! published for a row that failed to write.

pub mod auth;
pub mod conversations;
pub mod messages;
pub mod middleware;
pub mod pins;
pub mod polls;
pub mod reactions;
pub mod receipts;
pub mod threads;

use axum::http::StatusCode;
use tracing::error;
use uuid::Uuid;

use crate::auth::AppState;

/// Membership guard shared by the conversation-scoped handlers.
pub(crate) async fn ensure_participant(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<(), StatusCode> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = user_id.to_string();

    let is_member = tokio::task::spawn_blocking(move || db.is_participant(&cid, &uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if is_member { Ok(()) } else { Err(StatusCode::FORBIDDEN) }
}
