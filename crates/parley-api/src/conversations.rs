use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use parley_db::models::ConversationRow;
use parley_types::api::Claims;
use parley_types::events::{ConversationChange, GatewayEvent};
use parley_types::models::Conversation;
use parley_types::topic::Topic;

use crate::auth::AppState;
use crate::ensure_participant;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub name: String,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameConversationRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}

fn into_conversation(row: ConversationRow) -> Conversation {
    Conversation {
        id: row.id.parse().unwrap_or_default(),
        name: row.name,
        created_at: parley_db::queries::parse_timestamp(&row.created_at, &row.id),
    }
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let rows = tokio::task::spawn_blocking(move || db.find_conversations_for_identity(&uid))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let conversations: Vec<Conversation> = rows.into_iter().map(into_conversation).collect();
    Ok(Json(conversations))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.name.trim().is_empty() || req.name.len() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let id = Uuid::new_v4();
    // The creator is always a participant.
    let mut members: Vec<Uuid> = vec![claims.sub];
    for pid in &req.participant_ids {
        if *pid != claims.sub {
            members.push(*pid);
        }
    }

    let db = state.db.clone();
    let cid = id.to_string();
    let name = req.name.clone();
    let member_ids: Vec<String> = members.iter().map(Uuid::to_string).collect();
    tokio::task::spawn_blocking(move || db.create_conversation(&cid, &name, &member_ids))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let conversation = Conversation {
        id,
        name: req.name,
        created_at: Utc::now(),
    };

    // Members with live connections join the topic right away and learn
    // about the conversation; a member never has to reconnect to receive
    // messages sent moments after creation.
    for member in members {
        enrol_live_connections(&state, member, id).await;
        state
            .gateway
            .registry
            .send_to_identity(
                member,
                GatewayEvent::ConversationUpdated {
                    conversation: conversation.clone(),
                    change_type: ConversationChange::Created,
                },
            )
            .await;
    }

    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn enrol_live_connections(state: &AppState, member: Uuid, conversation_id: Uuid) {
    for (conn_id, sender) in state.gateway.registry.senders_for(member).await {
        state
            .gateway
            .router
            .join(conn_id, sender, Topic::Conversation(conversation_id))
            .await;
    }
}

pub async fn rename_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RenameConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.name.trim().is_empty() || req.name.len() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let name = req.name.clone();
    let row = tokio::task::spawn_blocking(move || {
        if !db.rename_conversation(&cid, &name)? {
            return Ok(None);
        }
        db.get_conversation(&cid)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::NOT_FOUND)?;

    let conversation = into_conversation(row);
    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::ConversationUpdated {
                conversation: conversation.clone(),
                change_type: ConversationChange::Renamed,
            },
        )
        .await;

    Ok(Json(conversation))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    ensure_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = req.user_id.to_string();
    let row = tokio::task::spawn_blocking(move || {
        if db.get_user_by_id(&uid)?.is_none() {
            return Ok(None);
        }
        db.add_participant(&cid, &uid)?;
        db.get_conversation(&cid)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::NOT_FOUND)?;

    let conversation = into_conversation(row);
    state
        .gateway
        .router
        .publish(
            Topic::Conversation(conversation_id),
            GatewayEvent::ConversationUpdated {
                conversation,
                change_type: ConversationChange::ParticipantsChanged,
            },
        )
        .await;

    // Live connections of the new member join the topic immediately;
    // otherwise they pick it up on the next connect.
    enrol_live_connections(&state, req.user_id, conversation_id).await;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parley_gateway::Gateway;

    use crate::auth::AppStateInner;

    fn claims_for(user_id: Uuid, username: &str) -> Claims {
        Claims {
            sub: user_id,
            username: username.into(),
            exp: usize::MAX,
        }
    }

    fn app_state() -> AppState {
        let db = Arc::new(parley_db::Database::open_in_memory().unwrap());
        let gateway = Gateway::new(db.clone());
        Arc::new(AppStateInner {
            db,
            gateway,
            jwt_secret: "test-secret".into(),
        })
    }

    fn response_status(resp: impl IntoResponse) -> StatusCode {
        resp.into_response().status()
    }

    #[tokio::test]
    async fn creation_enrols_live_members_into_the_new_topic() {
        let state = app_state();
        let creator = Uuid::new_v4();
        let invitee = Uuid::new_v4();
        state.db.create_user(&creator.to_string(), "ana", "hash").unwrap();
        state.db.create_user(&invitee.to_string(), "ben", "hash").unwrap();

        // The invitee is already connected when the conversation is made
        let mut conn = state.gateway.registry.register(invitee, "ben").await;

        let resp = create_conversation(
            State(state.clone()),
            Extension(claims_for(creator, "ana")),
            Json(CreateConversationRequest {
                name: "plans".into(),
                participant_ids: vec![invitee],
            }),
        )
        .await
        .unwrap();
        assert_eq!(response_status(resp), StatusCode::CREATED);

        // The live connection learns about the conversation immediately
        let conversation_id = match conn.receiver.try_recv().unwrap() {
            GatewayEvent::ConversationUpdated { conversation, change_type } => {
                assert_eq!(change_type, ConversationChange::Created);
                conversation.id
            }
            other => panic!("expected ConversationUpdated, got: {other:?}"),
        };

        // ... and receives messages published to the topic without
        // having to reconnect first
        state
            .gateway
            .router
            .publish(
                Topic::Conversation(conversation_id),
                GatewayEvent::TypingStart {
                    conversation_id,
                    user_id: creator,
                    username: "ana".into(),
                },
            )
            .await;
        assert!(matches!(
            conn.receiver.try_recv().unwrap(),
            GatewayEvent::TypingStart { .. }
        ));
    }

    #[tokio::test]
    async fn added_participant_is_enrolled_while_connected() {
        let state = app_state();
        let creator = Uuid::new_v4();
        let newcomer = Uuid::new_v4();
        state.db.create_user(&creator.to_string(), "ana", "hash").unwrap();
        state.db.create_user(&newcomer.to_string(), "ben", "hash").unwrap();

        let conversation_id = Uuid::new_v4();
        state
            .db
            .create_conversation(&conversation_id.to_string(), "plans", &[creator.to_string()])
            .unwrap();

        let mut conn = state.gateway.registry.register(newcomer, "ben").await;

        let resp = add_participant(
            State(state.clone()),
            Path(conversation_id),
            Extension(claims_for(creator, "ana")),
            Json(AddParticipantRequest { user_id: newcomer }),
        )
        .await
        .unwrap();
        assert_eq!(response_status(resp), StatusCode::NO_CONTENT);

        state
            .gateway
            .router
            .publish(
                Topic::Conversation(conversation_id),
                GatewayEvent::TypingStart {
                    conversation_id,
                    user_id: creator,
                    username: "ana".into(),
                },
            )
            .await;
        assert!(matches!(
            conn.receiver.try_recv().unwrap(),
            GatewayEvent::TypingStart { .. }
        ));
    }
}
