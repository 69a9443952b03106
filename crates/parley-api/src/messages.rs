use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use parley_types::api::{Claims, EditMessageRequest, MessagePage, SendMessageRequest};
use parley_types::events::GatewayEvent;
use parley_types::models::Message;
use parley_types::topic::Topic;

use crate::auth::AppState;
use crate::ensure_participant;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass the `next_cursor` of the previous
    /// page to fetch older messages.
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    50
}

/// Persist the message, then hand it to the delivery pipeline. The fan-out
/// only ever sees committed rows; when the insert fails the client gets an
/// error and no event is published.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    ensure_participant(&state, conversation_id, claims.sub).await?;

    // A thread reply must point at a top-level message of this conversation.
    if let Some(thread_id) = req.thread_id {
        let db = state.db.clone();
        let tid = thread_id.to_string();
        let parent = tokio::task::spawn_blocking(move || db.get_message(&tid))
            .await
            .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::BAD_REQUEST)?;
        if parent.conversation_id != conversation_id || parent.thread_id.is_some() {
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let message_id = Uuid::new_v4();
    let created_at = Utc::now();

    // Run blocking DB insert off the async runtime
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let mid = message_id.to_string();
    let aid = claims.sub.to_string();
    let content = req.content.clone();
    let tid = req.thread_id.map(|t| t.to_string());
    tokio::task::spawn_blocking(move || {
        db.insert_message(&mid, &cid, &aid, &content, tid.as_deref(), created_at)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let message = Message {
        id: message_id,
        conversation_id,
        author_id: claims.sub,
        author_username: claims.username.clone(),
        content: req.content,
        thread_id: req.thread_id,
        is_edited: false,
        created_at,
        reactions: vec![],
        read_by: vec![],
    };

    state.gateway.delivery.deliver(message.clone(), None).await;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    // Run all blocking DB queries off the async runtime
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let limit = query.limit.min(200);
    let before = query.before;

    let messages = tokio::task::spawn_blocking(move || {
        db.find_messages_by_conversation(&cid, before, limit)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // A full page means there may be older messages behind the cursor.
    let next_cursor = if messages.len() as u32 == limit {
        messages.last().map(|m| m.created_at)
    } else {
        None
    };

    Ok(Json(MessagePage { messages, next_cursor }))
}

/// Author-only edit. The update is persisted first; subscribers then get
/// the new content pushed as an in-place edit.
pub async fn edit_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let mid = message_id.to_string();
    let aid = claims.sub.to_string();
    let content = req.content.clone();
    let edited = tokio::task::spawn_blocking(move || db.edit_message(&mid, &aid, &content))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if !edited {
        // Missing message and foreign author are indistinguishable here.
        return Err(StatusCode::FORBIDDEN);
    }

    let edited_at = Utc::now();
    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::MessageEdited {
                conversation_id,
                message_id,
                content: req.content,
                edited_at,
            },
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}
