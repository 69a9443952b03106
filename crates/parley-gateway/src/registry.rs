use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// Handed back by [`SessionRegistry::register`]: the connection's id, its
/// event receiver, a clonable sender for topic joins, and whether this is
/// the identity's first live connection.
pub struct RegisteredConnection {
    pub conn_id: Uuid,
    pub sender: mpsc::UnboundedSender<GatewayEvent>,
    pub receiver: mpsc::UnboundedReceiver<GatewayEvent>,
    pub first_connection: bool,
}

/// Maps authenticated identities to their live connections.
///
/// One identity may hold several concurrent connections (multi-tab,
/// multi-device); the offline transition fires only when the last one
/// closes. State is in-memory only — after a crash everything appears
/// offline until clients reconnect.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, IdentityEntry>>>,
}

struct IdentityEntry {
    username: String,
    senders: HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new connection for an identity.
    pub async fn register(&self, identity: Uuid, username: &str) -> RegisteredConnection {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut map = self.inner.write().await;
        let entry = map.entry(identity).or_insert_with(|| IdentityEntry {
            username: username.to_string(),
            senders: HashMap::new(),
        });
        let first_connection = entry.senders.is_empty();
        entry.senders.insert(conn_id, tx.clone());

        RegisteredConnection {
            conn_id,
            sender: tx,
            receiver: rx,
            first_connection,
        }
    }

    /// Remove a connection. Returns true when this was the identity's last
    /// connection — i.e. the identity just went offline.
    pub async fn unregister(&self, identity: Uuid, conn_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        let Some(entry) = map.get_mut(&identity) else {
            return false;
        };
        entry.senders.remove(&conn_id);
        if entry.senders.is_empty() {
            map.remove(&identity);
            true
        } else {
            false
        }
    }

    pub async fn is_online(&self, identity: Uuid) -> bool {
        self.inner.read().await.contains_key(&identity)
    }

    /// Live connection ids for an identity.
    pub async fn connections_for(&self, identity: Uuid) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .get(&identity)
            .map(|e| e.senders.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Live (connection id, sender) pairs for an identity, for callers
    /// that need to enrol existing connections into a new topic.
    pub async fn senders_for(
        &self,
        identity: Uuid,
    ) -> Vec<(Uuid, mpsc::UnboundedSender<GatewayEvent>)> {
        self.inner
            .read()
            .await
            .get(&identity)
            .map(|e| e.senders.iter().map(|(id, tx)| (*id, tx.clone())).collect())
            .unwrap_or_default()
    }

    /// Deliver a global event to every live connection. Closed receivers
    /// are skipped; send failures are absorbed.
    pub async fn broadcast_all(&self, event: GatewayEvent) {
        let map = self.inner.read().await;
        for entry in map.values() {
            for tx in entry.senders.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Deliver a targeted event to every connection of one identity.
    pub async fn send_to_identity(&self, identity: Uuid, event: GatewayEvent) {
        let map = self.inner.read().await;
        if let Some(entry) = map.get(&identity) {
            for tx in entry.senders.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Snapshot of online identities: (id, username).
    pub async fn online_identities(&self) -> Vec<(Uuid, String)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, e.username.clone()))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
