use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use parley_types::api::{CastVoteRequest, Claims, CreatePollRequest, PollResponse};
use parley_types::events::GatewayEvent;
use parley_types::topic::Topic;

use crate::auth::AppState;
use crate::ensure_participant;

pub async fn create_poll(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePollRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.question.trim().is_empty() || req.options.len() < 2 || req.options.len() > 10 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if let Some(expires_at) = req.expires_at
        && expires_at <= Utc::now()
    {
        return Err(StatusCode::BAD_REQUEST);
    }
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let poll_id = Uuid::new_v4();
    let created_at = Utc::now();
    let options: Vec<(String, String)> = req
        .options
        .iter()
        .map(|label| (Uuid::new_v4().to_string(), label.clone()))
        .collect();

    let db = state.db.clone();
    let pid = poll_id.to_string();
    let cid = conversation_id.to_string();
    let aid = claims.sub.to_string();
    let question = req.question.clone();
    let opts = options.clone();
    let poll = tokio::task::spawn_blocking(move || {
        db.create_poll(&pid, &cid, &aid, &question, &opts, req.allow_multiple, req.expires_at, created_at)?;
        db.get_poll(&pid, created_at)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::VoteCreated { poll: poll.clone() },
        )
        .await;

    Ok((StatusCode::CREATED, Json(PollResponse { poll })))
}

pub async fn list_polls(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let polls = tokio::task::spawn_blocking(move || db.polls_for_conversation(&cid, Utc::now()))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(polls))
}

/// Vote on an open poll. Closed-poll and foreign-option votes are rejected
/// by the store; the updated tally fans out to the conversation.
pub async fn cast_vote(
    State(state): State<AppState>,
    Path((conversation_id, poll_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CastVoteRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let pid = poll_id.to_string();
    let oid = req.option_id.to_string();
    let uid = claims.sub.to_string();
    let poll = tokio::task::spawn_blocking(move || db.cast_vote(&pid, &oid, &uid, Utc::now()))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::CONFLICT)?;

    if poll.conversation_id != conversation_id {
        return Err(StatusCode::NOT_FOUND);
    }

    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::VoteUpdated { poll: poll.clone() },
        )
        .await;

    Ok(Json(PollResponse { poll }))
}

/// Author-only delete.
pub async fn delete_poll(
    State(state): State<AppState>,
    Path((conversation_id, poll_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let pid = poll_id.to_string();
    let uid = claims.sub;
    let deleted = tokio::task::spawn_blocking(move || {
        match db.get_poll(&pid, Utc::now())? {
            Some(p) if p.conversation_id == conversation_id && p.author_id == uid => {
                db.delete_poll(&pid)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }

    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::VoteDeleted { conversation_id, poll_id },
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}
