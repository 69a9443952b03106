use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::events::{GatewayEvent, PinAction};
use parley_types::topic::Topic;

use crate::auth::AppState;
use crate::ensure_participant;

pub async fn pin_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let mid = message_id.to_string();
    let changed = tokio::task::spawn_blocking(move || {
        // Only messages of this conversation are pinnable.
        match db.get_message(&mid)? {
            Some(msg) if msg.conversation_id == conversation_id => {
                db.pin_message(&cid, &mid, Utc::now()).map(Some)
            }
            _ => Ok(None),
        }
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::NOT_FOUND)?;

    if changed {
        broadcast_pin(&state, conversation_id, message_id, PinAction::Pin).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpin_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let mid = message_id.to_string();
    // Unpinning an absent pin is a no-op, not an error.
    let changed = tokio::task::spawn_blocking(move || db.unpin_message(&cid, &mid))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if changed {
        broadcast_pin(&state, conversation_id, message_id, PinAction::Unpin).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_pins(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let pinned = tokio::task::spawn_blocking(move || db.pinned_messages(&cid))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(pinned))
}

async fn broadcast_pin(state: &AppState, conversation_id: Uuid, message_id: Uuid, action: PinAction) {
    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::PinChanged {
                conversation_id,
                message_id,
                action,
            },
        )
        .await;
}
