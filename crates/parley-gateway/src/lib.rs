pub mod connection;
pub mod delivery;
pub mod presence;
pub mod registry;
pub mod router;

use std::sync::Arc;

use parley_db::Database;

use crate::delivery::DeliveryPipeline;
use crate::presence::PresenceBroadcaster;
use crate::registry::SessionRegistry;
use crate::router::RoomRouter;

/// The server-side sync core: session registry, room router, presence
/// broadcaster and message delivery pipeline wired together around one
/// shared database handle.
#[derive(Clone)]
pub struct Gateway {
    pub registry: SessionRegistry,
    pub router: RoomRouter,
    pub presence: PresenceBroadcaster,
    pub delivery: DeliveryPipeline,
    pub db: Arc<Database>,
}

impl Gateway {
    pub fn new(db: Arc<Database>) -> Self {
        let registry = SessionRegistry::new();
        let router = RoomRouter::new();
        let presence = PresenceBroadcaster::new(registry.clone(), db.clone());
        let delivery = DeliveryPipeline::new(router.clone(), db.clone());
        Self {
            registry,
            router,
            presence,
            delivery,
            db,
        }
    }
}
