//! File-backed `DurableStore`.
//!
//! Grounded on `dingaiminGIT-vmark`'s `hot_exit::storage::write_session_atomic`:
//! every write serializes the full state, writes it to a `NamedTempFile` in
//! the same directory (same filesystem, so the following rename is atomic),
//! flushes and `sync_all`s it, then persists it over the real path. Readers
//! either see the old file or the new one, never a partial write.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{SpacesError, SpacesResult};
use crate::model::{Space, TabKind, TabRecord};

use super::legacy::LegacyLayout;
use super::{DurableStore, OnDiskState, SCHEMA_VERSION};

pub struct FileDurableStore {
    path: PathBuf,
    state: RwLock<OnDiskState>,
}

impl FileDurableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(OnDiskState::default()),
        }
    }

    async fn write_to_disk(&self, state: &OnDiskState) -> SpacesResult<()> {
        let json = serde_json::to_string_pretty(state)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
            .await
            .map_err(|e| SpacesError::Storage(format!("write task panicked: {e}")))??;
        Ok(())
    }

    async fn read_from_disk(&self) -> SpacesResult<Option<OnDiskState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let state: OnDiskState = serde_json::from_str(&raw)?;
        Ok(Some(state))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> SpacesResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SpacesError::Storage(format!("failed to persist state file: {e}")))?;
    Ok(())
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn bootstrap(&self) -> SpacesResult<()> {
        if let Some(loaded) = self.read_from_disk().await? {
            *self.state.write().await = loaded;
            return Ok(());
        }

        let legacy_path = self
            .path
            .parent()
            .map(|p| p.join("legacy.json"))
            .unwrap_or_else(|| PathBuf::from("legacy.json"));

        let migrated = if legacy_path.exists() {
            let raw = tokio::fs::read_to_string(&legacy_path).await?;
            let legacy: LegacyLayout = serde_json::from_str(&raw)?;
            legacy.migrate()
        } else {
            OnDiskState {
                schema_version: SCHEMA_VERSION,
                ..Default::default()
            }
        };

        self.write_to_disk(&migrated).await?;
        *self.state.write().await = migrated;
        Ok(())
    }

    async fn load_spaces(&self) -> SpacesResult<HashMap<Uuid, Space>> {
        Ok(self.state.read().await.spaces.clone())
    }

    async fn load_closed_spaces(&self) -> SpacesResult<HashMap<Uuid, Space>> {
        let guard = self.state.read().await;
        let mut closed = guard.closed_spaces.clone();
        for (id, space) in closed.iter_mut() {
            let rows = guard.tabs_for(*id, TabKind::Closed);
            if !rows.is_empty() {
                space.urls = TabRecord::to_urls(rows);
            }
        }
        Ok(closed)
    }

    async fn save_state(
        &self,
        spaces: &HashMap<Uuid, Space>,
        closed_spaces: &HashMap<Uuid, Space>,
    ) -> SpacesResult<()> {
        let mut guard = self.state.write().await;
        guard.spaces = spaces.clone();
        guard.closed_spaces = closed_spaces.clone();
        guard.schema_version = SCHEMA_VERSION;
        self.write_to_disk(&guard).await
    }

    async fn save_spaces(&self, spaces: &HashMap<Uuid, Space>) -> SpacesResult<()> {
        let mut guard = self.state.write().await;
        guard.spaces = spaces.clone();
        self.write_to_disk(&guard).await
    }

    async fn save_closed_spaces(&self, closed_spaces: &HashMap<Uuid, Space>) -> SpacesResult<()> {
        let mut guard = self.state.write().await;
        guard.closed_spaces = closed_spaces.clone();
        self.write_to_disk(&guard).await
    }

    async fn save_tabs_for_space(&self, space_id: Uuid, kind: TabKind, urls: &[String]) -> SpacesResult<()> {
        let now = crate::model::now_ms();
        let rows = TabRecord::from_urls(space_id, kind, urls, now);
        let mut guard = self.state.write().await;
        guard.replace_tabs_for(space_id, kind, rows);
        self.write_to_disk(&guard).await
    }

    async fn load_tabs_for_space(&self, space_id: Uuid, kind: TabKind) -> SpacesResult<Vec<TabRecord>> {
        Ok(self.state.read().await.tabs_for(space_id, kind))
    }

    async fn delete_tabs_for_space(&self, space_id: Uuid, kind: TabKind) -> SpacesResult<()> {
        let mut guard = self.state.write().await;
        guard.delete_tabs_for(space_id, kind);
        self.write_to_disk(&guard).await
    }

    async fn permanent_id_for_window(&self, window_id: &str) -> SpacesResult<Uuid> {
        {
            let guard = self.state.read().await;
            if let Some(id) = guard.permanent_id_map.get(window_id) {
                return Ok(*id);
            }
        }
        let new_id = Uuid::new_v4();
        let mut guard = self.state.write().await;
        // Re-check after acquiring the write lock in case of a racing caller.
        if let Some(id) = guard.permanent_id_map.get(window_id) {
            return Ok(*id);
        }
        guard.permanent_id_map.insert(window_id.to_string(), new_id);
        self.write_to_disk(&guard).await?;
        Ok(new_id)
    }

    async fn update_permanent_id_mapping(&self, window_id: &str, permanent_id: Uuid) -> SpacesResult<()> {
        let mut guard = self.state.write().await;
        guard.permanent_id_map.insert(window_id.to_string(), permanent_id);
        self.write_to_disk(&guard).await
    }
}

pub fn open(path: impl Into<PathBuf>) -> Arc<dyn DurableStore> {
    Arc::new(FileDurableStore::new(path))
}
