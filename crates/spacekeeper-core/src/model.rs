//! Core data model: `Space`, `TabRecord`, `RestoreSnapshot`.
//!
//! Follows the teacher's state-struct convention (`TabState` in
//! `citadel-tabs`, `Bookmark` in `citadel-browser`): plain serde structs,
//! `Uuid` identity, millisecond timestamps, mutated only through the
//! owning manager (here, `StateEngine`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which on-disk tab collection a `TabRecord` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabKind {
    Active,
    Closed,
}

/// A persistent, possibly-named collection of URLs representing a browser
/// window. See spec §3 for the full invariant list; this type only holds
/// data, all invariant enforcement lives in `engine::StateEngine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Space {
    pub permanent_id: Uuid,
    pub name: String,
    pub named: bool,
    pub urls: Vec<String>,
    pub window_id: Option<String>,
    pub is_active: bool,
    pub version: u64,
    pub created_at: i64,
    pub last_modified: i64,
    pub last_used: i64,
    pub last_sync: i64,
}

impl Space {
    /// A brand-new, unnamed space bound to `window_id`.
    pub fn new_unnamed(permanent_id: Uuid, window_id: Option<String>, urls: Vec<String>, now_ms: i64, ordinal: u64) -> Self {
        Self {
            permanent_id,
            name: default_name(ordinal),
            named: false,
            urls,
            is_active: window_id.is_some(),
            window_id,
            version: 1,
            created_at: now_ms,
            last_modified: now_ms,
            last_used: now_ms,
            last_sync: now_ms,
        }
    }

    pub fn bump_version(&mut self, now_ms: i64) {
        self.version += 1;
        self.last_modified = now_ms;
    }
}

/// The default label for a space the user has not named yet.
pub fn default_name(ordinal: u64) -> String {
    format!("Space {ordinal}")
}

/// Reconstructs the ordered URL list for a closed space from its tab rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabRecord {
    pub id: Uuid,
    pub space_id: Uuid,
    pub kind: TabKind,
    pub url: String,
    pub index: u32,
    pub created_at: i64,
}

impl TabRecord {
    pub fn from_urls(space_id: Uuid, kind: TabKind, urls: &[String], now_ms: i64) -> Vec<Self> {
        urls.iter()
            .enumerate()
            .map(|(index, url)| TabRecord {
                id: Uuid::new_v4(),
                space_id,
                kind,
                url: url.clone(),
                index: index as u32,
                created_at: now_ms,
            })
            .collect()
    }

    /// Project a sorted set of tab rows back to an ordered URL list.
    pub fn to_urls(mut rows: Vec<TabRecord>) -> Vec<String> {
        rows.sort_by_key(|r| r.index);
        rows.into_iter().map(|r| r.url).collect()
    }
}

/// Captured when a restoration is requested; held by `RestoreRegistry`
/// until claimed by the matching window-created event, or cancelled/timed
/// out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSnapshot {
    pub closed_space_id: Uuid,
    pub permanent_id: Uuid,
    pub original_name: String,
    pub named: bool,
    pub urls: Vec<String>,
    pub expected_kind: TabKind,
    pub requested_at: i64,
    /// Set once `claim_pending_window`/`attach_window` binds a live window.
    pub window_id: Option<String>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
