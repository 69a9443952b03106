use axum::{
    Extension,
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use parley_types::api::{Claims, MarkReadRequest};
use parley_types::events::GatewayEvent;
use parley_types::topic::Topic;

use crate::auth::AppState;
use crate::ensure_participant;

/// Persist read receipts and broadcast only the ids that were newly
/// recorded. Re-marking an already-read message is absorbed silently, so
/// retries and reconnect replays produce no second event.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let read_at = Utc::now();
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let ids = req.message_ids.clone();

    let newly_read = tokio::task::spawn_blocking(move || {
        let mut newly_read = Vec::new();
        for mid in &ids {
            if db.mark_read(&mid.to_string(), &uid, read_at)? {
                newly_read.push(*mid);
            }
        }
        Ok::<_, anyhow::Error>(newly_read)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if !newly_read.is_empty() {
        state
            .gateway
            .router
            .publish(
                Topic::Conversation(conversation_id),
                GatewayEvent::ReadReceipt {
                    conversation_id,
                    message_ids: newly_read,
                    user_id: claims.sub,
                    read_at,
                },
            )
            .await;
    }

    Ok(StatusCode::NO_CONTENT)
}
