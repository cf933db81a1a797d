//! The space-reconciliation engine: in-memory state, the durable store, the
//! restore pipeline, and the broadcast fan-out that keeps UI clients in
//! sync, wired the way `citadel-tabs` wires its own `TabManager` plus
//! `send_safe_tab_manager` actor around it.

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock_table;
pub mod matching;
pub mod model;
pub mod restore_registry;
pub mod restore_transaction;
pub mod router;
pub mod storage;
pub mod update_queue;

pub use broadcast::BroadcastFabric;
pub use config::SpacesConfig;
pub use engine::StateEngine;
pub use error::{SpacesError, SpacesResult};
pub use model::{Space, TabKind, TabRecord};
pub use restore_registry::RestoreRegistry;
pub use restore_transaction::RestoreTransaction;
pub use router::MessageRouter;
pub use storage::{DurableStore, FileDurableStore};

use std::sync::Arc;

use spacekeeper_adapter::BrowserAdapter;

/// Bundles the pieces that `main.rs` (or a test harness) needs to stand up
/// a fully wired instance: the engine itself, its restore transaction
/// driver, and the broadcast fabric UI clients subscribe to.
pub struct Spaces {
    pub engine: Arc<StateEngine>,
    pub restore: RestoreTransaction,
    pub broadcast: Arc<BroadcastFabric>,
    pub router: MessageRouter,
}

impl Spaces {
    /// Assembles the engine, restore driver, broadcast fabric, and message
    /// router, then loads persisted state. Mirrors the order `TabManager`
    /// and its `SendSafeTabManager` wrapper are constructed in the teacher.
    pub async fn bootstrap(
        store: Arc<dyn DurableStore>,
        adapter: Arc<dyn BrowserAdapter>,
        config: SpacesConfig,
    ) -> SpacesResult<Self> {
        let broadcast = Arc::new(BroadcastFabric::new(&config));
        let engine = StateEngine::new(store, adapter.clone(), broadcast.clone(), config);
        engine.initialize().await?;

        let registry = engine.restore_registry();
        let restore = RestoreTransaction::new(engine.clone(), adapter.clone(), registry);
        let router = MessageRouter::new(engine.clone(), adapter, restore.clone(), broadcast.clone());

        Ok(Self {
            engine,
            restore,
            broadcast,
            router,
        })
    }
}
