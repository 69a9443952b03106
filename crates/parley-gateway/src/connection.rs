use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::topic::Topic;

use crate::Gateway;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The JWT was already
/// validated at the HTTP upgrade layer, so the connection starts at Ready.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, user_id: Uuid, username: String) {
    let (mut sender, receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let registered = gateway.registry.register(user_id, &username).await;
    let conn_id = registered.conn_id;
    let event_tx = registered.sender;
    let mut event_rx = registered.receiver;
    let first_connection = registered.first_connection;

    // The connection stays joined to every conversation the identity
    // participates in for its whole lifetime — a conversation list view
    // needs live updates for conversations that are not currently open.
    gateway.router.join(conn_id, event_tx.clone(), Topic::User(user_id)).await;

    let conversation_ids = {
        let db = gateway.db.clone();
        let uid = user_id.to_string();
        match tokio::task::spawn_blocking(move || db.find_conversations_for_identity(&uid)).await {
            Ok(Ok(rows)) => rows.into_iter().map(|c| c.id).collect::<Vec<_>>(),
            Ok(Err(e)) => {
                warn!("Failed to enumerate conversations for {}: {}", user_id, e);
                Vec::new()
            }
            Err(e) => {
                warn!("Conversation enumeration task failed for {}: {}", user_id, e);
                Vec::new()
            }
        }
    };

    for cid in &conversation_ids {
        match cid.parse::<Uuid>() {
            Ok(cid) => {
                gateway
                    .router
                    .join(conn_id, event_tx.clone(), Topic::Conversation(cid))
                    .await;
            }
            Err(e) => warn!("Corrupt conversation id '{}': {}", cid, e),
        }
    }

    // One-shot presence snapshot so the client sees who is already here
    // without waiting for the next presence transition.
    match gateway.presence.snapshot_for_conversations(conversation_ids).await {
        Ok(entries) => {
            let snapshot = GatewayEvent::PresenceSnapshot { entries };
            if send_event(&mut sender, &snapshot).await.is_err() {
                let went_offline = gateway.registry.unregister(user_id, conn_id).await;
                gateway.router.leave_all(conn_id).await;
                gateway.presence.disconnected(user_id, &username, went_offline).await;
                return;
            }
        }
        Err(e) => warn!("Presence snapshot failed for {}: {}", user_id, e),
    }

    gateway.presence.connected(user_id, &username, first_connection).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward registry/router events to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = event_rx.recv() => {
                    let Some(event) = result else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let gateway_recv = gateway.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut receiver = receiver;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&gateway_recv, conn_id, &event_tx, user_id, &username_recv, cmd).await;
                    }
                    Err(e) => {
                        // Malformed payloads are rejected here, at the
                        // router boundary, never forwarded downstream.
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            truncate_for_log(&text, 200)
                        );
                    }
                },
                WsMessage::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let went_offline = gateway.registry.unregister(user_id, conn_id).await;
    gateway.router.leave_all(conn_id).await;
    gateway.presence.disconnected(user_id, &username, went_offline).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Cap a client-supplied payload for logging without slicing through a
/// multi-byte character.
fn truncate_for_log(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(WsMessage::Text(text.into())).await
}

async fn handle_command(
    gateway: &Gateway,
    conn_id: Uuid,
    event_tx: &mpsc::UnboundedSender<GatewayEvent>,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::JoinTopic { topic } => match topic {
            Topic::User(id) if id == user_id => {
                gateway.router.join(conn_id, event_tx.clone(), topic).await;
            }
            Topic::User(id) => {
                warn!("{} ({}) tried to join foreign user topic {}", username, user_id, id);
            }
            Topic::Conversation(cid) => {
                let db = gateway.db.clone();
                let (c, u) = (cid.to_string(), user_id.to_string());
                let allowed = tokio::task::spawn_blocking(move || db.is_participant(&c, &u))
                    .await
                    .unwrap_or(Ok(false))
                    .unwrap_or(false);
                if allowed {
                    gateway.router.join(conn_id, event_tx.clone(), topic).await;
                } else {
                    warn!("{} ({}) denied join to conversation {}", username, user_id, cid);
                }
            }
        },

        GatewayCommand::LeaveTopic { topic } => {
            gateway.router.leave(conn_id, topic).await;
        }

        GatewayCommand::TypingStart { conversation_id } => {
            // The originator does not need its own typing echoed back;
            // it also owns the quiet-period timeout.
            gateway
                .router
                .publish_except(
                    Topic::Conversation(conversation_id),
                    conn_id,
                    GatewayEvent::TypingStart {
                        conversation_id,
                        user_id,
                        username: username.to_string(),
                    },
                )
                .await;
        }

        GatewayCommand::TypingStop { conversation_id } => {
            gateway
                .router
                .publish_except(
                    Topic::Conversation(conversation_id),
                    conn_id,
                    GatewayEvent::TypingStop {
                        conversation_id,
                        user_id,
                    },
                )
                .await;
        }

        GatewayCommand::MarkRead {
            conversation_id,
            message_ids,
        } => {
            let db = gateway.db.clone();
            let uid = user_id.to_string();
            let read_at = Utc::now();
            let ids = message_ids.clone();

            // Persist first; only newly recorded receipts are broadcast.
            // Duplicate marks are absorbed by the store.
            let newly_read = tokio::task::spawn_blocking(move || {
                let mut newly = Vec::new();
                for mid in &ids {
                    match db.mark_read(&mid.to_string(), &uid, read_at) {
                        Ok(true) => newly.push(*mid),
                        Ok(false) => {}
                        Err(e) => warn!("Failed to persist read receipt for {}: {}", mid, e),
                    }
                }
                newly
            })
            .await
            .unwrap_or_default();

            if !newly_read.is_empty() {
                gateway
                    .router
                    .publish(
                        Topic::Conversation(conversation_id),
                        GatewayEvent::ReadReceipt {
                            conversation_id,
                            message_ids: newly_read,
                            user_id,
                            read_at,
                        },
                    )
                    .await;
            }
        }
    }
}
