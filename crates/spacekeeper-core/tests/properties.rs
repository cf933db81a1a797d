//! Property-based checks for the round-trip and idempotence laws from
//! spec §8. Each property runs an async scenario inside its own runtime,
//! since `proptest!` test bodies are synchronous.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use uuid::Uuid;

use spacekeeper_adapter::MockBrowserAdapter;
use spacekeeper_core::config::SpacesConfig;
use spacekeeper_core::engine::StateEngine;
use spacekeeper_core::model::Space;
use spacekeeper_core::storage::{DurableStore, FileDurableStore};
use spacekeeper_core::BroadcastFabric;

fn url_strategy() -> impl Strategy<Value = String> {
    "[a-z]{3,8}".prop_map(|s| format!("https://{s}.example"))
}

proptest! {
    /// Persist -> load round-trip: `load(save(x)) == x` for the fields
    /// that survive a write (`Space` itself, not the `WindowMapping` or
    /// tab rows, which have their own dedicated accessors).
    #[test]
    fn persist_load_round_trips_space(
        name in "[A-Za-z ]{0,20}",
        urls in prop::collection::vec(url_strategy(), 0..6),
        named in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = FileDurableStore::new(dir.path().join("state.json"));
            store.bootstrap().await.unwrap();

            let id = Uuid::new_v4();
            let mut space = Space::new_unnamed(id, Some("w1".into()), urls.clone(), 1_000, 1);
            space.name = name.clone();
            space.named = named;

            let mut spaces = HashMap::new();
            spaces.insert(id, space.clone());
            store.save_state(&spaces, &HashMap::new()).await.unwrap();

            let loaded = store.load_spaces().await.unwrap();
            let reloaded = loaded.get(&id).expect("space must round-trip");

            prop_assert_eq!(&reloaded.permanent_id, &space.permanent_id);
            prop_assert_eq!(&reloaded.name, &space.name);
            prop_assert_eq!(reloaded.named, space.named);
            prop_assert_eq!(&reloaded.urls, &space.urls);
            Ok(())
        })?;
    }

    /// Idempotence: reconciling twice in a row against an unchanged set of
    /// windows yields the same `spaces` content (including version) as
    /// reconciling once.
    #[test]
    fn reconcile_twice_matches_reconcile_once(
        urls in prop::collection::vec(url_strategy(), 1..4),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store: Arc<dyn DurableStore> = Arc::new(FileDurableStore::new(dir.path().join("state.json")));
            let adapter = Arc::new(MockBrowserAdapter::new());
            adapter.spawn_window("w1", urls.clone()).await;

            let broadcast = Arc::new(BroadcastFabric::new(&SpacesConfig::default()));
            let engine = StateEngine::new(store, adapter, broadcast, SpacesConfig::default());
            engine.initialize().await.unwrap();

            engine.synchronize_windows_and_spaces().await.unwrap();
            let (once_spaces, once_closed) = engine.get_all_spaces().await;

            engine.synchronize_windows_and_spaces().await.unwrap();
            let (twice_spaces, twice_closed) = engine.get_all_spaces().await;

            prop_assert_eq!(once_spaces.len(), twice_spaces.len());
            prop_assert_eq!(once_closed.len(), twice_closed.len());
            for (id, space) in &once_spaces {
                let again = twice_spaces.get(id).expect("space must survive a no-op reconcile");
                prop_assert_eq!(&space.urls, &again.urls);
                prop_assert_eq!(space.version, again.version);
            }
            Ok(())
        })?;
    }
}
