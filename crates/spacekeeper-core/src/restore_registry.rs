//! Tracks restorations in flight between the moment a restore is requested
//! and the moment the resulting window is confirmed populated.
//!
//! Grounded on `dingaiminGIT-vmark`'s `hot_exit::coordinator::PendingRestoreState`:
//! a keyed map of intents, each with an expected/completed marker and a
//! staleness deadline, guarded by an async lock since lookups race with
//! window-created events arriving off the adapter.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::matching::{best_match, Candidate};
use crate::model::{now_ms, RestoreSnapshot, TabKind};

pub struct RestoreRegistry {
    inner: RwLock<HashMap<Uuid, RestoreSnapshot>>,
    restoring_windows: RwLock<std::collections::HashSet<String>>,
    gate_ms: i64,
    threshold_named: f64,
    threshold_unnamed: f64,
}

impl RestoreRegistry {
    pub fn new(restore_gate_ms: u64, threshold_named: f64, threshold_unnamed: f64) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            restoring_windows: RwLock::new(std::collections::HashSet::new()),
            gate_ms: restore_gate_ms as i64,
            threshold_named,
            threshold_unnamed,
        }
    }

    /// Records an intent keyed by `closed_space_id`.
    pub async fn register_pending(
        &self,
        closed_space_id: Uuid,
        permanent_id: Uuid,
        original_name: String,
        named: bool,
        urls: Vec<String>,
        expected_kind: TabKind,
    ) -> RestoreSnapshot {
        let snapshot = RestoreSnapshot {
            closed_space_id,
            permanent_id,
            original_name,
            named,
            urls,
            expected_kind,
            requested_at: now_ms(),
            window_id: None,
        };
        self.inner.write().await.insert(closed_space_id, snapshot.clone());
        snapshot
    }

    /// Matches a freshly-observed window against the set of pending
    /// restorations by the URL-overlap heuristic. On match, binds the
    /// window id to the snapshot and marks the window as restoring.
    pub async fn claim_pending_window(&self, window_id: &str, current_urls: &[String]) -> Option<RestoreSnapshot> {
        let mut pending = self.inner.write().await;

        // Tie-break key per spec's Strategy B: lexicographic permanent_id,
        // not the (non-unique, user-visible) name.
        let keys: Vec<(Uuid, String)> = pending
            .values()
            .filter(|s| s.window_id.is_none())
            .map(|s| (s.closed_space_id, s.permanent_id.to_string()))
            .collect();

        let candidates: Vec<Candidate<Uuid>> = keys
            .iter()
            .map(|(closed_space_id, key)| {
                let s = pending.get(closed_space_id).expect("key collected above");
                Candidate {
                    key,
                    urls: &s.urls,
                    threshold: if s.named { self.threshold_named } else { self.threshold_unnamed },
                    item: *closed_space_id,
                }
            })
            .collect();

        let matched_id = best_match(current_urls, candidates).map(|(id, _score)| id)?;
        let snapshot = pending.get_mut(&matched_id)?;
        snapshot.window_id = Some(window_id.to_string());
        let result = snapshot.clone();
        drop(pending);

        self.restoring_windows.write().await.insert(window_id.to_string());
        Some(result)
    }

    /// Explicit binding from the transaction driver, used when the core
    /// itself initiated window creation rather than discovering it later.
    pub async fn attach_window(&self, closed_space_id: Uuid, window_id: String) {
        let mut pending = self.inner.write().await;
        if let Some(snapshot) = pending.get_mut(&closed_space_id) {
            snapshot.window_id = Some(window_id.clone());
        }
        drop(pending);
        self.restoring_windows.write().await.insert(window_id);
    }

    /// Called once the restored space has passed post-restore validation.
    /// Removes the snapshot and clears its restoring-window marker.
    pub async fn finalize(&self, closed_space_id: Uuid) {
        let removed = self.inner.write().await.remove(&closed_space_id);
        if let Some(snapshot) = removed {
            if let Some(window_id) = snapshot.window_id {
                self.restoring_windows.write().await.remove(&window_id);
            }
        }
    }

    /// Called when a restoration could not be completed. Releases the
    /// window-id gate without requiring the caller to know it.
    pub async fn fail(&self, closed_space_id: Uuid) {
        self.finalize(closed_space_id).await;
    }

    /// Expires entries older than the configured gate and releases their
    /// window markers. Returns the ids of expired entries for logging.
    pub async fn cleanup_stale(&self) -> Vec<Uuid> {
        let now = now_ms();
        let mut pending = self.inner.write().await;
        let stale: Vec<Uuid> = pending
            .iter()
            .filter(|(_, s)| now - s.requested_at > self.gate_ms)
            .map(|(id, _)| *id)
            .collect();

        let mut windows = self.restoring_windows.write().await;
        for id in &stale {
            if let Some(snapshot) = pending.remove(id) {
                if let Some(window_id) = snapshot.window_id {
                    windows.remove(&window_id);
                }
            }
        }
        stale
    }

    pub async fn is_window_restoring(&self, window_id: &str) -> bool {
        self.restoring_windows.read().await.contains(window_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_matches_on_url_overlap_above_threshold() {
        let registry = RestoreRegistry::new(30_000, 0.30, 0.50);
        let closed_id = Uuid::new_v4();
        registry
            .register_pending(
                closed_id,
                Uuid::new_v4(),
                "Work".into(),
                true,
                vec!["https://a".into(), "https://b".into()],
                TabKind::Closed,
            )
            .await;

        let claimed = registry
            .claim_pending_window("win-1", &["https://a".to_string()])
            .await;
        assert!(claimed.is_some());
        assert!(registry.is_window_restoring("win-1").await);
    }

    #[tokio::test]
    async fn claim_returns_none_below_threshold() {
        let registry = RestoreRegistry::new(30_000, 0.30, 0.50);
        registry
            .register_pending(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "Personal".into(),
                false,
                vec!["https://a".into(), "https://b".into(), "https://c".into()],
                TabKind::Closed,
            )
            .await;

        let claimed = registry.claim_pending_window("win-1", &["https://z".to_string()]).await;
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn finalize_removes_entry_and_window_marker() {
        let registry = RestoreRegistry::new(30_000, 0.30, 0.50);
        let closed_id = Uuid::new_v4();
        registry
            .register_pending(closed_id, Uuid::new_v4(), "Work".into(), true, vec![], TabKind::Closed)
            .await;
        registry.attach_window(closed_id, "win-2".into()).await;
        assert!(registry.is_window_restoring("win-2").await);

        registry.finalize(closed_id).await;
        assert!(!registry.is_window_restoring("win-2").await);
        assert_eq!(registry.pending_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_stale_expires_old_entries() {
        let registry = RestoreRegistry::new(0, 0.30, 0.50);
        let closed_id = Uuid::new_v4();
        registry
            .register_pending(closed_id, Uuid::new_v4(), "Work".into(), true, vec![], TabKind::Closed)
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let expired = registry.cleanup_stale().await;
        assert_eq!(expired, vec![closed_id]);
        assert_eq!(registry.pending_count().await, 0);
    }
}
