use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::middleware::require_auth;
use parley_api::{conversations, messages, pins, polls, reactions, receipts, threads};
use parley_gateway::{Gateway, connection};
use parley_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    gateway: Gateway,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(parley_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let gateway = Gateway::new(db.clone());
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        gateway: gateway.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        gateway,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations", post(conversations::create_conversation))
        .route("/conversations/{conversation_id}", patch(conversations::rename_conversation))
        .route("/conversations/{conversation_id}/participants", post(conversations::add_participant))
        .route("/conversations/{conversation_id}/messages", get(messages::get_messages))
        .route("/conversations/{conversation_id}/messages", post(messages::send_message))
        .route("/conversations/{conversation_id}/messages/{message_id}", patch(messages::edit_message))
        .route("/conversations/{conversation_id}/messages/{message_id}/reactions", post(reactions::toggle_reaction))
        .route("/conversations/{conversation_id}/messages/{message_id}/thread", get(threads::get_thread_replies))
        .route("/conversations/{conversation_id}/read", post(receipts::mark_read))
        .route("/conversations/{conversation_id}/pins", get(pins::list_pins))
        .route("/conversations/{conversation_id}/pins/{message_id}", post(pins::pin_message))
        .route("/conversations/{conversation_id}/pins/{message_id}", delete(pins::unpin_message))
        .route("/conversations/{conversation_id}/polls", get(polls::list_polls))
        .route("/conversations/{conversation_id}/polls", post(polls::create_poll))
        .route("/conversations/{conversation_id}/polls/{poll_id}/votes", post(polls::cast_vote))
        .route("/conversations/{conversation_id}/polls/{poll_id}", delete(polls::delete_poll))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct GatewayQuery {
    token: String,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token
/// rides in the query string and is validated before the upgrade.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token_data = match decode::<Claims>(
        &query.token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let claims = token_data.claims;
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.gateway, claims.sub, claims.username)
    })
    .into_response()
}
