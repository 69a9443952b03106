use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use parley_types::api::{Claims, ThreadRepliesResponse};

use crate::auth::AppState;
use crate::ensure_participant;

/// Replies of one thread, oldest first, with the authoritative count.
/// Clients opening a thread use this to replace their optimistic counter.
pub async fn get_thread_replies(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let mid = message_id.to_string();
    let (parent, replies) = tokio::task::spawn_blocking(move || {
        let parent = db.get_message(&mid)?;
        let replies = db.find_thread_replies(&mid)?;
        Ok::<_, anyhow::Error>((parent, replies))
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match parent {
        Some(p) if p.conversation_id == conversation_id => {}
        _ => return Err(StatusCode::NOT_FOUND),
    }

    Ok(Json(ThreadRepliesResponse {
        thread_id: message_id,
        reply_count: replies.len() as u64,
        replies,
    }))
}
