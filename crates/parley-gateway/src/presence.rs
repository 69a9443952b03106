use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{GatewayEvent, PresenceEntry};

use crate::registry::SessionRegistry;

/// Derives online/offline transitions from the session registry and fans
/// them out to every connection. The persisted flag is best-effort: a
/// failed write is logged and swallowed, never fatal to the connection.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    registry: SessionRegistry,
    db: Arc<Database>,
}

impl PresenceBroadcaster {
    pub fn new(registry: SessionRegistry, db: Arc<Database>) -> Self {
        Self { registry, db }
    }

    /// Called after a connection registers. Only the identity's first
    /// connection produces a presence transition.
    pub async fn connected(&self, identity: Uuid, username: &str, first_connection: bool) {
        if !first_connection {
            return;
        }
        let now = Utc::now();
        self.persist_flag(identity, true).await;
        self.registry
            .broadcast_all(GatewayEvent::PresenceChanged {
                user_id: identity,
                username: username.to_string(),
                online: true,
                last_seen_at: now,
            })
            .await;
    }

    /// Called after a connection unregisters. `went_offline` is the
    /// registry's verdict — true only when the last connection closed.
    pub async fn disconnected(&self, identity: Uuid, username: &str, went_offline: bool) {
        if !went_offline {
            return;
        }
        let now = Utc::now();
        self.persist_flag(identity, false).await;
        self.registry
            .broadcast_all(GatewayEvent::PresenceChanged {
                user_id: identity,
                username: username.to_string(),
                online: false,
                last_seen_at: now,
            })
            .await;
    }

    /// One-shot presence snapshot for the participants of a set of
    /// conversations, computed once at connect time so the client does not
    /// wait for the next presence transition.
    pub async fn snapshot_for_conversations(&self, conversation_ids: Vec<String>) -> Result<Vec<PresenceEntry>> {
        let db = self.db.clone();
        let users = tokio::task::spawn_blocking(move || -> Result<Vec<parley_db::models::UserRow>> {
            let mut seen = std::collections::HashSet::new();
            let mut users = Vec::new();
            for cid in &conversation_ids {
                for uid in db.conversation_participants(cid)? {
                    if seen.insert(uid.clone())
                        && let Some(user) = db.get_user_by_id(&uid)?
                    {
                        users.push(user);
                    }
                }
            }
            Ok(users)
        })
        .await??;

        let mut entries = Vec::with_capacity(users.len());
        for user in users {
            let Ok(user_id) = user.id.parse::<Uuid>() else {
                warn!("Corrupt user id '{}' in presence snapshot", user.id);
                continue;
            };
            entries.push(PresenceEntry {
                user_id,
                username: user.username,
                // The registry is authoritative for liveness; the persisted
                // flag only survives for last_seen_at.
                online: self.registry.is_online(user_id).await,
                last_seen_at: parley_db::queries::parse_timestamp(&user.last_seen_at, &user.id),
            });
        }
        Ok(entries)
    }

    async fn persist_flag(&self, identity: Uuid, online: bool) {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || {
            db.set_participant_online(&identity.to_string(), online, Utc::now())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to persist presence for {}: {}", identity, e),
            Err(e) => warn!("Presence persistence task failed for {}: {}", identity, e),
        }
    }
}
