//! Dispatches typed UI requests to engine operations.
//!
//! Grounded on `send_safe_tab_manager`'s `TabManagerCommand` + exhaustive
//! `match` dispatch: one tagged enum (`UiRequest`), one handler, so adding
//! a request variant without handling it is a compile error rather than a
//! silently-ignored action string.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use spacekeeper_adapter::{BrowserAdapter, UiRequest, UiResponse};

use crate::broadcast::BroadcastFabric;
use crate::engine::StateEngine;
use crate::error::SpacesError;
use crate::restore_transaction::RestoreTransaction;

/// Handles one `UiRequest` at a time. Cheap to clone: every field is
/// already an `Arc` or has actor-backed interior sharing.
#[derive(Clone)]
pub struct MessageRouter {
    engine: Arc<StateEngine>,
    adapter: Arc<dyn BrowserAdapter>,
    restore: RestoreTransaction,
    broadcast: Arc<BroadcastFabric>,
}

impl MessageRouter {
    pub fn new(
        engine: Arc<StateEngine>,
        adapter: Arc<dyn BrowserAdapter>,
        restore: RestoreTransaction,
        broadcast: Arc<BroadcastFabric>,
    ) -> Self {
        Self {
            engine,
            adapter,
            restore,
            broadcast,
        }
    }

    /// Handles a request from `originator` (the UI client id it arrived
    /// on), returning the structured response that client gets directly.
    /// Other clients only learn of the outcome through the broadcast the
    /// underlying engine call already issues, plus `ErrorOccurred` on
    /// failure here.
    pub async fn dispatch(&self, originator: &str, request: UiRequest) -> UiResponse {
        let result = self.handle(request).await;
        match result {
            Ok(payload) => UiResponse::Ok { payload },
            Err(e) => {
                log::error!("request from {originator} failed: {e}");
                self.broadcast
                    .broadcast_incremental(
                        json!({"kind": "error_occurred", "message": e.to_string()}),
                        Some(originator),
                        false,
                    )
                    .await;
                UiResponse::Error {
                    kind: error_kind(&e),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn handle(&self, request: UiRequest) -> Result<serde_json::Value, SpacesError> {
        match request {
            UiRequest::GetAllSpaces => {
                let (spaces, closed_spaces) = self.engine.get_all_spaces().await;
                Ok(json!({"spaces": spaces, "closed_spaces": closed_spaces}))
            }
            UiRequest::RenameSpace { window_id, name } => {
                let permanent_id = self.engine.permanent_id_for_window(&window_id).await?;
                self.engine.set_space_name(permanent_id, &name).await?;
                Ok(json!({"permanent_id": permanent_id}))
            }
            UiRequest::CloseSpace { window_id } => {
                self.engine.close_space(&window_id).await?;
                let _ = self.adapter.close_window(&window_id).await;
                Ok(json!({"window_id": window_id}))
            }
            UiRequest::SwitchToSpace { window_id } => {
                self.adapter
                    .switch_to_window(&window_id)
                    .await
                    .map_err(|e| SpacesError::Storage(e.to_string()))?;
                Ok(json!({"window_id": window_id}))
            }
            UiRequest::RestoreSpace { permanent_id } => {
                let id = parse_uuid(&permanent_id)?;
                let window_id = self.restore.restore(id).await?;
                Ok(json!({"window_id": window_id}))
            }
            UiRequest::DeleteClosedSpace { permanent_id } => {
                let id = parse_uuid(&permanent_id)?;
                self.engine.delete_closed_space(id).await?;
                Ok(json!({"permanent_id": permanent_id}))
            }
            UiRequest::MoveTab { tab_id, target_window_id } => {
                // `tab_id` doubles as the tab's URL: the adapter has no
                // independent tab-id space to look the move up by.
                let windows = self
                    .adapter
                    .get_all_windows()
                    .await
                    .map_err(|e| SpacesError::Storage(e.to_string()))?;
                let source_window_id = windows
                    .iter()
                    .find(|w| w.tabs.iter().any(|t| t.url == tab_id))
                    .map(|w| w.id.clone())
                    .ok_or_else(|| SpacesError::NotFound(tab_id.clone()))?;

                self.adapter
                    .move_tab(&tab_id, &source_window_id, &target_window_id)
                    .await
                    .map_err(|e| SpacesError::Storage(e.to_string()))?;

                self.engine.synchronize_windows_and_spaces().await?;
                Ok(json!({"tab_id": tab_id, "target_window_id": target_window_id}))
            }
        }
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, SpacesError> {
    Uuid::parse_str(raw).map_err(|_| SpacesError::Invalid(format!("not a valid permanent id: {raw}")))
}

fn error_kind(error: &SpacesError) -> String {
    match error {
        SpacesError::Storage(_) => "storage".into(),
        SpacesError::LockTimeout { .. } => "lock_timeout".into(),
        SpacesError::NotFound(_) => "not_found".into(),
        SpacesError::Invalid(_) => "invalid_request".into(),
        SpacesError::RestoreFailed { .. } => "restore_failed".into(),
        SpacesError::Conflict(_) => "conflict".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpacesConfig;
    use crate::storage::FileDurableStore;
    use spacekeeper_adapter::MockBrowserAdapter;

    async fn router_with_one_space() -> (MessageRouter, String) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn crate::storage::DurableStore> =
            Arc::new(FileDurableStore::new(dir.path().join("state.json")));
        let adapter = Arc::new(MockBrowserAdapter::new());
        let broadcast = Arc::new(BroadcastFabric::new(&SpacesConfig::default()));
        let engine = StateEngine::new(store, adapter.clone(), broadcast.clone(), SpacesConfig::default());
        engine.initialize().await.unwrap();

        let window_id = adapter.spawn_window("1", vec!["https://a".into()]).await;
        engine.create_space(window_id.clone(), None, None).await.unwrap();

        let registry = engine.restore_registry();
        let restore = RestoreTransaction::new(engine.clone(), adapter.clone(), registry);
        let router = MessageRouter::new(engine, adapter, restore, broadcast);
        (router, window_id)
    }

    #[tokio::test]
    async fn get_all_spaces_returns_created_space() {
        let (router, _window_id) = router_with_one_space().await;
        let response = router.dispatch("client-1", UiRequest::GetAllSpaces).await;
        match response {
            UiResponse::Ok { payload } => {
                assert_eq!(payload["spaces"].as_object().unwrap().len(), 1);
            }
            UiResponse::Error { .. } => panic!("expected Ok response"),
        }
    }

    #[tokio::test]
    async fn rename_space_round_trips_through_get_all_spaces() {
        let (router, window_id) = router_with_one_space().await;
        let rename = router
            .dispatch(
                "client-1",
                UiRequest::RenameSpace {
                    window_id,
                    name: "Research".into(),
                },
            )
            .await;
        assert!(matches!(rename, UiResponse::Ok { .. }));

        let all = router.dispatch("client-1", UiRequest::GetAllSpaces).await;
        let UiResponse::Ok { payload } = all else { panic!("expected Ok") };
        let names: Vec<String> = payload["spaces"]
            .as_object()
            .unwrap()
            .values()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Research"]);
    }

    #[tokio::test]
    async fn unknown_window_rename_surfaces_not_found() {
        let (router, _window_id) = router_with_one_space().await;
        let response = router
            .dispatch(
                "client-1",
                UiRequest::RenameSpace {
                    window_id: "does-not-exist".into(),
                    name: "X".into(),
                },
            )
            .await;
        match response {
            UiResponse::Error { kind, .. } => assert_eq!(kind, "not_found"),
            UiResponse::Ok { .. } => panic!("expected error response"),
        }
    }

    #[tokio::test]
    async fn delete_closed_space_requires_valid_uuid() {
        let (router, _window_id) = router_with_one_space().await;
        let response = router
            .dispatch(
                "client-1",
                UiRequest::DeleteClosedSpace {
                    permanent_id: "not-a-uuid".into(),
                },
            )
            .await;
        match response {
            UiResponse::Error { kind, .. } => assert_eq!(kind, "invalid_request"),
            UiResponse::Ok { .. } => panic!("expected error response"),
        }
    }
}
