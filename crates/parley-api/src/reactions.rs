use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use parley_types::api::{Claims, ToggleReactionRequest};
use parley_types::events::GatewayEvent;
use parley_types::topic::Topic;

use crate::auth::AppState;
use crate::ensure_participant;

/// Toggle and broadcast the resulting full reaction set, so subscribers
/// replace rather than merge and duplicate deliveries converge.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let reaction_id = Uuid::new_v4();
    let db = state.db.clone();
    let mid = message_id.to_string();
    let uid = claims.sub.to_string();
    let emoji = req.emoji.clone();

    let (added, reactions) = tokio::task::spawn_blocking(move || {
        let added = db.toggle_reaction(&reaction_id.to_string(), &mid, &uid, &emoji)?;
        let reactions = db.reactions_for_message(&mid)?;
        Ok::<_, anyhow::Error>((added, reactions))
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::ReactionChanged {
                conversation_id,
                message_id,
                reactions: reactions.clone(),
            },
        )
        .await;

    Ok(Json(serde_json::json!({ "added": added, "reactions": reactions })))
}
