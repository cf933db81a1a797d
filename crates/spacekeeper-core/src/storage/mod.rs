//! Durable persistence of the two space collections plus the window-id to
//! permanent-id mapping, and bootstrapping from a legacy on-disk layout.

mod file_store;
mod legacy;

pub use file_store::FileDurableStore;
pub(crate) use legacy::LegacyLayout;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SpacesResult;
use crate::model::{Space, TabKind, TabRecord};

/// Schema version of [`OnDiskState`]. Bumped whenever the persisted shape
/// changes in a way that needs a migration step in `legacy`.
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// The entire persisted state, written and read as one unit so
/// `save_state` can give readers an all-or-nothing view across both
/// collections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct OnDiskState {
    pub schema_version: u32,
    pub spaces: HashMap<Uuid, Space>,
    pub closed_spaces: HashMap<Uuid, Space>,
    pub tabs: Vec<TabRecord>,
    /// `window_id -> permanent_id`, survives rekeying independent of the
    /// in-memory `WindowMapping` the engine rebuilds every reconciliation.
    pub permanent_id_map: HashMap<String, Uuid>,
}

impl OnDiskState {
    pub fn tabs_for(&self, space_id: Uuid, kind: TabKind) -> Vec<TabRecord> {
        let mut rows: Vec<TabRecord> = self
            .tabs
            .iter()
            .filter(|t| t.space_id == space_id && t.kind == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.index);
        rows
    }

    pub fn replace_tabs_for(&mut self, space_id: Uuid, kind: TabKind, rows: Vec<TabRecord>) {
        self.tabs.retain(|t| !(t.space_id == space_id && t.kind == kind));
        self.tabs.extend(rows);
    }

    pub fn delete_tabs_for(&mut self, space_id: Uuid, kind: TabKind) {
        self.tabs.retain(|t| !(t.space_id == space_id && t.kind == kind));
    }
}

/// The full on-disk representation of one collection write. `save_state`
/// must write both maps in a single transaction so a concurrent reader
/// never observes one half updated and the other stale.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Runs once at startup: migrates a legacy layout if the store is
    /// otherwise empty. Idempotent.
    async fn bootstrap(&self) -> SpacesResult<()>;

    async fn load_spaces(&self) -> SpacesResult<HashMap<Uuid, Space>>;
    async fn load_closed_spaces(&self) -> SpacesResult<HashMap<Uuid, Space>>;

    async fn save_state(
        &self,
        spaces: &HashMap<Uuid, Space>,
        closed_spaces: &HashMap<Uuid, Space>,
    ) -> SpacesResult<()>;

    async fn save_spaces(&self, spaces: &HashMap<Uuid, Space>) -> SpacesResult<()>;
    async fn save_closed_spaces(&self, closed_spaces: &HashMap<Uuid, Space>) -> SpacesResult<()>;

    async fn save_tabs_for_space(&self, space_id: Uuid, kind: TabKind, urls: &[String]) -> SpacesResult<()>;
    async fn load_tabs_for_space(&self, space_id: Uuid, kind: TabKind) -> SpacesResult<Vec<TabRecord>>;
    async fn delete_tabs_for_space(&self, space_id: Uuid, kind: TabKind) -> SpacesResult<()>;

    /// Returns the existing permanent id bound to `window_id`, allocating
    /// and persisting a fresh one if none exists yet.
    async fn permanent_id_for_window(&self, window_id: &str) -> SpacesResult<Uuid>;

    async fn update_permanent_id_mapping(&self, window_id: &str, permanent_id: Uuid) -> SpacesResult<()>;
}
