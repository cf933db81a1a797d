//! The state engine: in-memory `spaces`/`closed_spaces` maps, the window
//! mapping, and the reconciliation algorithm that keeps them honest against
//! an ephemeral set of browser windows.
//!
//! Grounded on `citadel-tabs`'s `TabManager` (`crates/tabs/src/lib.rs`) for
//! the owns-all-state-behind-one-type shape, generalized from a single
//! container's tabs to the two-collection space registry this system needs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use spacekeeper_adapter::BrowserAdapter;

use crate::config::SpacesConfig;
use crate::error::{SpacesError, SpacesResult};
use crate::lock_table::LockTable;
use crate::matching::{best_match, overlap_ratio, Candidate};
use crate::model::{now_ms, Space, TabKind, TabRecord};
use crate::restore_registry::RestoreRegistry;
use crate::storage::DurableStore;
use crate::update_queue::{Priority, StateUpdate, UpdateQueue};

/// Metadata for a space that was just restored, exempting it from
/// demotion until its window's tabs materialize (spec's restoration gate).
#[derive(Debug, Clone)]
struct Gate {
    window_id: String,
    #[allow(dead_code)]
    original_name: String,
    restored_at: i64,
}

/// Tiny read-through cache keyed by `"spaces"`, `"closed_spaces"`, or
/// `"space:<id>"`. Every mutation explicitly invalidates the keys it
/// touches rather than waiting out the TTL.
struct Cache {
    ttl_ms: i64,
    entries: RwLock<HashMap<String, (i64, serde_json::Value)>>,
}

impl Cache {
    fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms: ttl_ms as i64,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        let (stamped_at, value) = entries.get(key)?;
        if now_ms() - stamped_at > self.ttl_ms {
            None
        } else {
            Some(value.clone())
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value) {
        self.entries.write().await.insert(key.to_string(), (now_ms(), value));
    }

    async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

/// Owns every in-memory map and drives create/close/restore/rename/reconcile.
pub struct StateEngine {
    store: Arc<dyn DurableStore>,
    adapter: Arc<dyn BrowserAdapter>,
    locks: LockTable,
    registry: Arc<RestoreRegistry>,
    queue: UpdateQueue,
    config: SpacesConfig,

    spaces: Arc<RwLock<HashMap<Uuid, Space>>>,
    closed_spaces: Arc<RwLock<HashMap<Uuid, Space>>>,
    window_mapping: RwLock<HashMap<String, Uuid>>,
    gates: RwLock<HashMap<Uuid, Gate>>,
    cache: Cache,

    init_lock: Mutex<()>,
    initialized: std::sync::atomic::AtomicBool,
}

/// Bridges the update queue to the broadcast fabric. Holds its own handles
/// onto the two space maps (shared with `StateEngine`, not copies) so a
/// client that has drifted past `incremental_update_threshold` can be
/// handed a full snapshot instead of another incremental diff, per spec
/// §4.4's mode switch.
struct BroadcastSink {
    fabric: Arc<crate::broadcast::BroadcastFabric>,
    spaces: Arc<RwLock<HashMap<Uuid, Space>>>,
    closed_spaces: Arc<RwLock<HashMap<Uuid, Space>>>,
}

impl BroadcastSink {
    async fn full_state_snapshot(&self) -> serde_json::Value {
        let spaces = self.spaces.read().await.clone();
        let closed_spaces = self.closed_spaces.read().await.clone();
        json!({"spaces": spaces, "closed_spaces": closed_spaces})
    }
}

#[async_trait::async_trait]
impl crate::update_queue::BatchSink for BroadcastSink {
    async fn commit_batch(&self, updates: Vec<StateUpdate>) -> SpacesResult<()> {
        for update in updates {
            self.fabric
                .broadcast_incremental(
                    json!({"kind": update.kind, "id": update.id, "payload": update.payload}),
                    None,
                    true,
                )
                .await;
        }

        for client_id in self.fabric.client_ids().await {
            if self.fabric.needs_full_resync(&client_id).await {
                let state = self.full_state_snapshot().await;
                self.fabric.broadcast_full(state, Some(&client_id)).await;
            }
        }
        Ok(())
    }
}

impl StateEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        adapter: Arc<dyn BrowserAdapter>,
        broadcast: Arc<crate::broadcast::BroadcastFabric>,
        config: SpacesConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(RestoreRegistry::new(
            config.restore_gate_ms,
            config.url_match_threshold_named,
            config.url_match_threshold_unnamed,
        ));
        let spaces = Arc::new(RwLock::new(HashMap::new()));
        let closed_spaces = Arc::new(RwLock::new(HashMap::new()));
        let sink = Arc::new(BroadcastSink {
            fabric: broadcast,
            spaces: spaces.clone(),
            closed_spaces: closed_spaces.clone(),
        });
        let queue = UpdateQueue::new(sink, config.clone());

        Arc::new(Self {
            store,
            adapter,
            locks: LockTable::new(),
            registry,
            queue,
            cache: Cache::new(config.cache_ttl_ms),
            config,
            spaces,
            closed_spaces,
            window_mapping: RwLock::new(HashMap::new()),
            gates: RwLock::new(HashMap::new()),
            init_lock: Mutex::new(()),
            initialized: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn restore_registry(&self) -> Arc<RestoreRegistry> {
        self.registry.clone()
    }

    /// Loads state from storage, forcing every loaded space inactive: no
    /// external window id is trusted across restarts. Concurrent callers
    /// share a single initialization pass.
    pub async fn initialize(&self) -> SpacesResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        self.store.bootstrap().await?;
        let mut loaded_spaces = self.store.load_spaces().await?;
        let loaded_closed = self.store.load_closed_spaces().await?;

        for space in loaded_spaces.values_mut() {
            space.is_active = false;
            space.window_id = None;
        }

        self.store.save_state(&loaded_spaces, &loaded_closed).await?;

        *self.spaces.write().await = loaded_spaces;
        *self.closed_spaces.write().await = loaded_closed;
        self.window_mapping.write().await.clear();

        self.initialized.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    pub async fn get_all_spaces(&self) -> (HashMap<Uuid, Space>, HashMap<Uuid, Space>) {
        (self.spaces.read().await.clone(), self.closed_spaces.read().await.clone())
    }

    pub async fn get_closed_space(&self, permanent_id: Uuid) -> SpacesResult<Space> {
        self.closed_spaces
            .read()
            .await
            .get(&permanent_id)
            .cloned()
            .ok_or_else(|| SpacesError::NotFound(permanent_id.to_string()))
    }

    /// Resolves a live window id to the permanent id of the space it is
    /// currently bound to, for router handlers that only know the window.
    pub async fn permanent_id_for_window(&self, window_id: &str) -> SpacesResult<Uuid> {
        self.window_mapping
            .read()
            .await
            .get(window_id)
            .copied()
            .ok_or_else(|| SpacesError::NotFound(window_id.to_string()))
    }

    /// Removes a closed space permanently (the user discarded it from the
    /// closed-spaces list, distinct from a live `close_space`).
    pub async fn delete_closed_space(&self, permanent_id: Uuid) -> SpacesResult<()> {
        let _lock = self.locks.acquire(permanent_id.to_string(), self.config.lock_timeout_ms).await?;

        if !self.closed_spaces.read().await.contains_key(&permanent_id) {
            return Err(SpacesError::NotFound(permanent_id.to_string()));
        }

        self.store.delete_tabs_for_space(permanent_id, TabKind::Closed).await?;
        let mut prospective = self.closed_spaces.read().await.clone();
        prospective.remove(&permanent_id);
        self.store.save_closed_spaces(&prospective).await?;

        *self.closed_spaces.write().await = prospective;
        self.invalidate_after_mutation(permanent_id).await;
        self.enqueue_broadcast(
            "closed_space_deleted",
            permanent_id,
            Priority::Normal,
            json!({"permanent_id": permanent_id}),
        )
        .await;
        Ok(())
    }

    /// First sighting of a window: allocate a space for it, unless it is
    /// mid-restoration or already mapped.
    pub async fn create_space(&self, window_id: String, name: Option<String>, named: Option<bool>) -> SpacesResult<()> {
        if self.registry.is_window_restoring(&window_id).await {
            return Ok(());
        }

        let _lock = self.locks.acquire(window_id.clone(), self.config.lock_timeout_ms).await?;

        if self.window_mapping.read().await.contains_key(&window_id) {
            return Ok(());
        }

        let permanent_id = self.store.permanent_id_for_window(&window_id).await?;
        let urls = self.fetch_window_urls_with_retry(&window_id).await;

        let ordinal = {
            let spaces = self.spaces.read().await;
            let closed = self.closed_spaces.read().await;
            (spaces.len() + closed.len() + 1) as u64
        };

        let mut space = Space::new_unnamed(permanent_id, Some(window_id.clone()), urls.clone(), now_ms(), ordinal);
        if let Some(requested_name) = name {
            space.name = requested_name;
            space.named = true;
        }
        if let Some(is_named) = named {
            space.named = is_named;
        }

        let mut prospective = self.spaces.read().await.clone();
        prospective.insert(permanent_id, space.clone());
        self.store.save_spaces(&prospective).await?;
        self.store.save_tabs_for_space(permanent_id, TabKind::Active, &urls).await?;

        *self.spaces.write().await = prospective;
        self.window_mapping.write().await.insert(window_id, permanent_id);

        self.invalidate_after_mutation(permanent_id).await;
        self.enqueue_broadcast("space_created", permanent_id, Priority::Normal, json!(space))
            .await;
        Ok(())
    }

    /// `named=false` spaces are discarded entirely on close (garbage
    /// collection of transient browsing); `named=true` spaces move to
    /// `closed_spaces` under the same identity.
    pub async fn close_space(&self, window_id: &str) -> SpacesResult<()> {
        let permanent_id = match self.window_mapping.read().await.get(window_id).copied() {
            Some(id) => id,
            None => return Ok(()),
        };

        let _lock = self.locks.acquire(permanent_id.to_string(), self.config.lock_timeout_ms).await?;

        let Some(mut space) = self.spaces.read().await.get(&permanent_id).cloned() else {
            return Ok(());
        };

        if !space.named {
            self.store.delete_tabs_for_space(permanent_id, TabKind::Active).await?;
            let mut prospective = self.spaces.read().await.clone();
            prospective.remove(&permanent_id);
            self.store.save_spaces(&prospective).await?;

            *self.spaces.write().await = prospective;
            self.window_mapping.write().await.remove(window_id);

            self.invalidate_after_mutation(permanent_id).await;
            self.enqueue_broadcast(
                "space_closed",
                permanent_id,
                Priority::Normal,
                json!({"permanent_id": permanent_id, "discarded": true}),
            )
            .await;
            return Ok(());
        }

        let urls = match self.adapter.get_tabs(window_id).await {
            Ok(tabs) => {
                let visible: Vec<String> = tabs
                    .into_iter()
                    .map(|t| t.url)
                    .filter(|u| !u.is_empty() && !u.starts_with("chrome://"))
                    .collect();
                if visible.is_empty() {
                    space.urls.clone()
                } else {
                    visible
                }
            }
            Err(_) => space.urls.clone(),
        };

        space.urls = urls.clone();
        space.window_id = None;
        space.is_active = false;
        space.bump_version(now_ms());
        space.last_sync = now_ms();

        self.store.save_tabs_for_space(permanent_id, TabKind::Closed, &urls).await?;
        self.store.delete_tabs_for_space(permanent_id, TabKind::Active).await?;

        let mut prospective_active = self.spaces.read().await.clone();
        prospective_active.remove(&permanent_id);
        let mut prospective_closed = self.closed_spaces.read().await.clone();
        prospective_closed.insert(permanent_id, space.clone());
        self.store.save_state(&prospective_active, &prospective_closed).await?;

        *self.spaces.write().await = prospective_active;
        *self.closed_spaces.write().await = prospective_closed;
        self.window_mapping.write().await.remove(window_id);

        self.invalidate_after_mutation(permanent_id).await;
        self.enqueue_broadcast("space_closed", permanent_id, Priority::High, json!(space))
            .await;
        Ok(())
    }

    /// Moves a closed space back to active, bound to `new_window_id`, and
    /// installs the restoration gate so the next reconciliation pass does
    /// not immediately demote it again.
    pub async fn restore_space(&self, permanent_id: Uuid, new_window_id: Option<String>) -> SpacesResult<()> {
        let _lock = self.locks.acquire(permanent_id.to_string(), self.config.lock_timeout_ms).await?;

        let was_closed = self.closed_spaces.read().await.contains_key(&permanent_id);
        let mut space = if was_closed {
            self.closed_spaces.read().await.get(&permanent_id).cloned().expect("checked above")
        } else {
            let spaces = self.spaces.read().await;
            match spaces.get(&permanent_id) {
                Some(s) if s.is_active => return Ok(()),
                Some(s) => s.clone(),
                None => return Err(SpacesError::NotFound(permanent_id.to_string())),
            }
        };

        let closed_rows = self.store.load_tabs_for_space(permanent_id, TabKind::Closed).await?;
        if !closed_rows.is_empty() {
            space.urls = TabRecord::to_urls(closed_rows);
        }

        space.window_id = new_window_id.clone();
        space.is_active = true;
        space.bump_version(now_ms());
        space.last_sync = now_ms();

        self.store.save_tabs_for_space(permanent_id, TabKind::Active, &space.urls).await?;
        self.store.delete_tabs_for_space(permanent_id, TabKind::Closed).await?;

        let mut prospective_active = self.spaces.read().await.clone();
        prospective_active.insert(permanent_id, space.clone());
        let mut prospective_closed = self.closed_spaces.read().await.clone();
        prospective_closed.remove(&permanent_id);
        self.store.save_state(&prospective_active, &prospective_closed).await?;

        *self.spaces.write().await = prospective_active;
        *self.closed_spaces.write().await = prospective_closed;
        if let Some(window_id) = &new_window_id {
            self.window_mapping.write().await.insert(window_id.clone(), permanent_id);
        }

        self.invalidate_after_mutation(permanent_id).await;

        if let Some(window_id) = new_window_id {
            self.gates.write().await.insert(
                permanent_id,
                Gate {
                    window_id,
                    original_name: space.name.clone(),
                    restored_at: now_ms(),
                },
            );
        }

        self.enqueue_broadcast("space_restored", permanent_id, Priority::High, json!(space))
            .await;
        Ok(())
    }

    /// Used by `RestoreTransaction` to move a space's identity onto a
    /// freshly-created window. Both ids are locked in sorted order to
    /// avoid ABBA deadlock with any other multi-id operation.
    pub async fn rekey_space(&self, old_id: Uuid, new_window_id: String) -> SpacesResult<()> {
        let ids = vec![old_id.to_string(), new_window_id.clone()];
        let _locks = self.locks.acquire_multiple(&ids, self.config.lock_timeout_ms).await?;

        let was_closed = self.closed_spaces.read().await.contains_key(&old_id);
        let mut space = if was_closed {
            self.closed_spaces.read().await.get(&old_id).cloned().expect("checked above")
        } else {
            self.spaces
                .read()
                .await
                .get(&old_id)
                .cloned()
                .ok_or_else(|| SpacesError::NotFound(old_id.to_string()))?
        };

        let closed_rows = self.store.load_tabs_for_space(old_id, TabKind::Closed).await?;
        if !closed_rows.is_empty() {
            space.urls = TabRecord::to_urls(closed_rows);
        }

        space.window_id = Some(new_window_id.clone());
        space.is_active = true;
        space.bump_version(now_ms());

        self.store.update_permanent_id_mapping(&new_window_id, old_id).await?;
        self.store.save_tabs_for_space(old_id, TabKind::Active, &space.urls).await?;
        self.store.delete_tabs_for_space(old_id, TabKind::Closed).await?;

        let mut prospective_active = self.spaces.read().await.clone();
        prospective_active.insert(old_id, space.clone());
        let mut prospective_closed = self.closed_spaces.read().await.clone();
        prospective_closed.remove(&old_id);
        self.store.save_state(&prospective_active, &prospective_closed).await?;

        *self.spaces.write().await = prospective_active;
        *self.closed_spaces.write().await = prospective_closed;
        self.window_mapping.write().await.insert(new_window_id.clone(), old_id);

        self.invalidate_after_mutation(old_id).await;

        self.gates.write().await.insert(
            old_id,
            Gate {
                window_id: new_window_id,
                original_name: space.name.clone(),
                restored_at: now_ms(),
            },
        );

        self.enqueue_broadcast("space_rekeyed", old_id, Priority::High, json!(space))
            .await;
        Ok(())
    }

    /// Trims/collapses whitespace, rejects empty or over-length names, and
    /// makes `named` monotonic true.
    pub async fn set_space_name(&self, permanent_id: Uuid, name: &str) -> SpacesResult<()> {
        let trimmed = collapse_whitespace(name);
        if trimmed.is_empty() {
            return Err(SpacesError::Invalid("space name must not be empty".into()));
        }
        if trimmed.chars().count() > self.config.space_name_max_length {
            return Err(SpacesError::Invalid(format!(
                "space name exceeds {} characters",
                self.config.space_name_max_length
            )));
        }

        let _lock = self.locks.acquire(permanent_id.to_string(), self.config.lock_timeout_ms).await?;

        let mut in_active = self.spaces.read().await.contains_key(&permanent_id);
        let mut in_closed = self.closed_spaces.read().await.contains_key(&permanent_id);
        if !in_active && !in_closed {
            self.synchronize_windows_and_spaces().await?;
            in_active = self.spaces.read().await.contains_key(&permanent_id);
            in_closed = self.closed_spaces.read().await.contains_key(&permanent_id);
            if !in_active && !in_closed {
                return Err(SpacesError::NotFound(permanent_id.to_string()));
            }
        }

        if in_active {
            let mut prospective = self.spaces.read().await.clone();
            if let Some(space) = prospective.get_mut(&permanent_id) {
                space.name = trimmed.clone();
                space.named = true;
                space.bump_version(now_ms());
            }
            self.store.save_spaces(&prospective).await?;
            *self.spaces.write().await = prospective;
        } else {
            let mut prospective = self.closed_spaces.read().await.clone();
            if let Some(space) = prospective.get_mut(&permanent_id) {
                space.name = trimmed.clone();
                space.named = true;
                space.bump_version(now_ms());
            }
            self.store.save_closed_spaces(&prospective).await?;
            *self.closed_spaces.write().await = prospective;
        }

        self.invalidate_after_mutation(permanent_id).await;
        self.enqueue_broadcast(
            "space_renamed",
            permanent_id,
            Priority::High,
            json!({"permanent_id": permanent_id, "name": trimmed}),
        )
        .await;
        Ok(())
    }

    /// The reconciler: matches observed windows to spaces, creates spaces
    /// for unmatched windows, and demotes or discards spaces whose window
    /// disappeared.
    pub async fn synchronize_windows_and_spaces(&self) -> SpacesResult<()> {
        self.registry.cleanup_stale().await;

        let windows = self
            .adapter
            .get_all_windows()
            .await
            .map_err(|e| SpacesError::Storage(e.to_string()))?;

        let mut working_spaces = self.spaces.read().await.clone();
        let mut working_closed = self.closed_spaces.read().await.clone();

        if windows.is_empty() && !working_spaces.is_empty() {
            // Known race during host-process wake-up; caller retries.
            return Ok(());
        }

        let now = now_ms();
        let mut new_window_mapping: HashMap<String, Uuid> = HashMap::new();
        let mut touched: HashSet<Uuid> = HashSet::new();

        for window in &windows {
            if self.registry.is_window_restoring(&window.id).await {
                continue;
            }
            let current_urls = window.visible_urls();

            let identity_match = working_spaces
                .iter()
                .find(|(id, s)| !touched.contains(*id) && s.window_id.as_deref() == Some(window.id.as_str()))
                .map(|(id, _)| *id);

            let matched_id = match identity_match {
                Some(id) => Some(id),
                None => {
                    let id_strings: HashMap<Uuid, String> = working_spaces.keys().map(|id| (*id, id.to_string())).collect();
                    let candidates: Vec<Candidate<Uuid>> = working_spaces
                        .iter()
                        .filter(|(id, _)| !touched.contains(*id))
                        .map(|(id, s)| Candidate {
                            key: id_strings.get(id).unwrap().as_str(),
                            urls: &s.urls,
                            threshold: if s.named {
                                self.config.url_match_threshold_named
                            } else {
                                self.config.url_match_threshold_unnamed
                            },
                            item: *id,
                        })
                        .collect();
                    best_match(&current_urls, candidates).map(|(id, _)| id)
                }
            };

            if let Some(matched_id) = matched_id {
                touched.insert(matched_id);
                working_closed.remove(&matched_id);

                let space = working_spaces.get_mut(&matched_id).expect("matched id must exist");
                let urls_changed = !current_urls.is_empty() && space.urls != current_urls;
                let window_changed = space.window_id.as_deref() != Some(window.id.as_str());
                let reactivated = !space.is_active;

                if !current_urls.is_empty() {
                    space.urls = current_urls.clone();
                }
                space.window_id = Some(window.id.clone());
                space.is_active = true;
                space.last_sync = now;
                if urls_changed || window_changed || reactivated {
                    space.bump_version(now);
                }

                new_window_mapping.insert(window.id.clone(), matched_id);

                if !current_urls.is_empty() {
                    if let Some(gate) = self.gates.read().await.get(&matched_id) {
                        if gate.window_id == window.id {
                            self.gates.write().await.remove(&matched_id);
                            self.registry.finalize(matched_id).await;
                        }
                    }
                }
            } else {
                let permanent_id = self
                    .store
                    .permanent_id_for_window(&window.id)
                    .await
                    .unwrap_or_else(|_| Uuid::new_v4());
                let ordinal = (working_spaces.len() + working_closed.len() + 1) as u64;
                let space = Space::new_unnamed(permanent_id, Some(window.id.clone()), current_urls.clone(), now, ordinal);
                working_spaces.insert(permanent_id, space);
                touched.insert(permanent_id);
                new_window_mapping.insert(window.id.clone(), permanent_id);
            }
        }

        let orphan_ids: Vec<Uuid> = working_spaces
            .keys()
            .filter(|id| !touched.contains(*id))
            .copied()
            .collect();

        for id in orphan_ids {
            let gate_active = self
                .gates
                .read()
                .await
                .get(&id)
                .map(|g| now - g.restored_at <= self.config.restore_gate_ms as i64)
                .unwrap_or(false);
            if gate_active {
                continue;
            }

            let space = working_spaces.remove(&id).expect("orphan id must exist");
            if space.named {
                let mut demoted = space;
                demoted.window_id = None;
                demoted.is_active = false;
                demoted.bump_version(now);
                working_closed.insert(id, demoted);
            }
            self.gates.write().await.remove(&id);
        }

        *self.spaces.write().await = working_spaces.clone();
        *self.closed_spaces.write().await = working_closed.clone();
        *self.window_mapping.write().await = new_window_mapping;

        self.persist_both().await?;
        self.cache.invalidate("spaces").await;
        self.cache.invalidate("closed_spaces").await;
        self.enqueue_broadcast(
            "synchronized",
            Uuid::nil(),
            Priority::Normal,
            json!({"spaces": working_spaces.len(), "closed_spaces": working_closed.len()}),
        )
        .await;
        Ok(())
    }

    /// Marks every active space inactive, persists, and issues a final
    /// broadcast. No reconciliation follows.
    pub async fn handle_shutdown(&self) -> SpacesResult<()> {
        let now = now_ms();
        {
            let mut spaces = self.spaces.write().await;
            for space in spaces.values_mut() {
                space.is_active = false;
                space.window_id = None;
                space.bump_version(now);
            }
        }
        self.persist_both().await?;
        self.queue.flush().await?;
        self.enqueue_broadcast("shutdown", Uuid::nil(), Priority::Critical, json!({"shutdown": true}))
            .await;
        Ok(())
    }

    /// Per spec's window-ownership validation rule, used when confirming
    /// whether an observed window genuinely belongs to a given space
    /// (e.g. event-driven single-window reconciliation).
    pub fn owns_window(&self, space: &Space, window_visible_urls: &[String], window_only_internal: bool) -> bool {
        if window_visible_urls.is_empty() && space.urls.is_empty() {
            return space.window_id.is_some();
        }
        if window_only_internal && space.urls.is_empty() {
            return true;
        }
        let threshold = if space.named {
            self.config.url_match_threshold_named
        } else {
            self.config.url_match_threshold_unnamed
        };
        overlap_ratio(window_visible_urls, &space.urls) >= threshold
    }

    /// Event-driven counterpart to the full reconciler for a single window
    /// the adapter just reported as created. Tries the `RestoreRegistry`
    /// first (it may be a window the user opened that happens to match a
    /// pending restoration) before falling through to `create_space`.
    pub async fn handle_window_created(&self, window_id: &str) -> SpacesResult<()> {
        if self.registry.is_window_restoring(window_id).await {
            return Ok(());
        }
        let urls = self.fetch_window_urls_with_retry(window_id).await;
        if let Some(snapshot) = self.registry.claim_pending_window(window_id, &urls).await {
            self.restore_space(snapshot.permanent_id, Some(window_id.to_string())).await?;
            self.registry.finalize(snapshot.closed_space_id).await;
            return Ok(());
        }
        self.create_space(window_id.to_string(), None, None).await
    }

    /// Event-driven counterpart to `close_space` for a window the adapter
    /// reported as removed.
    pub async fn handle_window_removed(&self, window_id: &str) -> SpacesResult<()> {
        self.close_space(window_id).await
    }

    async fn fetch_window_urls_with_retry(&self, window_id: &str) -> Vec<String> {
        for attempt in 0..2 {
            if let Ok(tabs) = self.adapter.get_tabs(window_id).await {
                let urls: Vec<String> = tabs.into_iter().map(|t| t.url).collect();
                if !urls.is_empty() || attempt == 1 {
                    return urls;
                }
            } else if attempt == 1 {
                return Vec::new();
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Vec::new()
    }

    async fn persist_both(&self) -> SpacesResult<()> {
        let spaces = self.spaces.read().await;
        let closed = self.closed_spaces.read().await;
        self.store.save_state(&spaces, &closed).await
    }

    async fn invalidate_after_mutation(&self, permanent_id: Uuid) {
        self.cache.invalidate("spaces").await;
        self.cache.invalidate("closed_spaces").await;
        self.cache.invalidate(&format!("space:{permanent_id}")).await;
    }

    async fn enqueue_broadcast(&self, kind: &str, id: Uuid, priority: Priority, payload: serde_json::Value) {
        self.queue.enqueue(StateUpdate::new(id.to_string(), kind, payload, priority));
    }
}

/// Trims outer whitespace and collapses internal runs of whitespace to a
/// single space.
fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacekeeper_adapter::MockBrowserAdapter;
    use crate::storage::FileDurableStore;

    async fn new_engine() -> (Arc<StateEngine>, Arc<MockBrowserAdapter>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(FileDurableStore::new(dir.path().join("state.json")));
        let adapter = Arc::new(MockBrowserAdapter::new());
        let broadcast = Arc::new(crate::broadcast::BroadcastFabric::new(&SpacesConfig::default()));
        let engine = StateEngine::new(store, adapter.clone(), broadcast, SpacesConfig::default());
        engine.initialize().await.unwrap();
        (engine, adapter, dir)
    }

    #[tokio::test]
    async fn named_space_survives_shutdown_and_restart() {
        let (engine, adapter, dir) = new_engine().await;
        let window_id = adapter.spawn_window("w1", vec!["https://a".into()]).await;
        engine.create_space(window_id.clone(), None, None).await.unwrap();

        let permanent_id = *engine.window_mapping.read().await.get(&window_id).unwrap();
        engine.set_space_name(permanent_id, "Alpha").await.unwrap();
        engine.handle_shutdown().await.unwrap();

        let store: Arc<dyn DurableStore> = Arc::new(FileDurableStore::new(dir.path().join("state.json")));
        let broadcast = Arc::new(crate::broadcast::BroadcastFabric::new(&SpacesConfig::default()));
        let restarted = StateEngine::new(store, adapter, broadcast, SpacesConfig::default());
        restarted.initialize().await.unwrap();

        let (spaces, _) = restarted.get_all_spaces().await;
        let space = spaces.get(&permanent_id).unwrap();
        assert_eq!(space.name, "Alpha");
        assert!(space.named);
        assert!(!space.is_active);
        assert!(space.window_id.is_none());
    }

    #[tokio::test]
    async fn unnamed_space_is_discarded_on_close() {
        let (engine, adapter, _dir) = new_engine().await;
        let window_id = adapter.spawn_window("w1", vec!["https://a".into()]).await;
        engine.create_space(window_id.clone(), None, None).await.unwrap();
        let permanent_id = *engine.window_mapping.read().await.get(&window_id).unwrap();

        engine.close_space(&window_id).await.unwrap();

        let (spaces, closed) = engine.get_all_spaces().await;
        assert!(!spaces.contains_key(&permanent_id));
        assert!(!closed.contains_key(&permanent_id));
    }

    #[tokio::test]
    async fn restore_preserves_name_and_urls() {
        let (engine, _adapter, _dir) = new_engine().await;
        let permanent_id = Uuid::new_v4();
        let urls = vec!["https://a".to_string(), "https://b".to_string()];
        let mut space = Space::new_unnamed(permanent_id, None, urls.clone(), now_ms(), 1);
        space.name = "Work".into();
        space.named = true;
        engine.closed_spaces.write().await.insert(permanent_id, space);
        engine
            .store
            .save_tabs_for_space(permanent_id, TabKind::Closed, &urls)
            .await
            .unwrap();

        engine.restore_space(permanent_id, Some("w-new".into())).await.unwrap();

        let (spaces, closed) = engine.get_all_spaces().await;
        let restored = spaces.get(&permanent_id).unwrap();
        assert_eq!(restored.name, "Work");
        assert!(restored.named);
        assert_eq!(restored.urls, urls);
        assert_eq!(restored.window_id.as_deref(), Some("w-new"));
        assert!(!closed.contains_key(&permanent_id));
    }

    #[tokio::test]
    async fn window_id_reuse_does_not_revive_closed_space() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(FileDurableStore::new(dir.path().join("state.json")));
        let adapter = Arc::new(MockBrowserAdapter::new());
        adapter.spawn_window("17", vec!["https://y".into()]).await;
        let broadcast = Arc::new(crate::broadcast::BroadcastFabric::new(&SpacesConfig::default()));
        let engine = StateEngine::new(store, adapter, broadcast, SpacesConfig::default());
        engine.initialize().await.unwrap();

        let closed_id = Uuid::new_v4();
        let mut closed_space = Space::new_unnamed(closed_id, None, vec!["https://x".into()], now_ms(), 1);
        closed_space.name = "Old".into();
        closed_space.named = true;
        engine.closed_spaces.write().await.insert(closed_id, closed_space);

        engine.synchronize_windows_and_spaces().await.unwrap();

        let (spaces, closed) = engine.get_all_spaces().await;
        assert!(closed.contains_key(&closed_id));
        assert_eq!(spaces.len(), 1);
        let (new_id, new_space) = spaces.iter().next().unwrap();
        assert_ne!(*new_id, closed_id);
        assert!(!new_space.named);
    }

    #[tokio::test]
    async fn restoration_gate_prevents_demotion_before_tabs_populate() {
        let (engine, adapter, _dir) = new_engine().await;
        let closed_id = Uuid::new_v4();
        let mut space = Space::new_unnamed(closed_id, None, vec!["https://a".into()], now_ms(), 1);
        space.name = "Gated".into();
        space.named = true;
        engine.closed_spaces.write().await.insert(closed_id, space);

        let window_id = adapter.spawn_window("w-gate", vec![]).await;
        engine.restore_space(closed_id, Some(window_id.clone())).await.unwrap();

        engine.synchronize_windows_and_spaces().await.unwrap();

        let (spaces, closed) = engine.get_all_spaces().await;
        assert!(spaces.get(&closed_id).map(|s| s.is_active).unwrap_or(false));
        assert!(!closed.contains_key(&closed_id));
    }

    #[tokio::test]
    async fn rename_trims_and_rejects_empty() {
        let (engine, adapter, _dir) = new_engine().await;
        let window_id = adapter.spawn_window("w1", vec!["https://a".into()]).await;
        engine.create_space(window_id.clone(), None, None).await.unwrap();
        let permanent_id = *engine.window_mapping.read().await.get(&window_id).unwrap();

        engine.set_space_name(permanent_id, "  Work   Stuff  ").await.unwrap();
        let (spaces, _) = engine.get_all_spaces().await;
        assert_eq!(spaces.get(&permanent_id).unwrap().name, "Work Stuff");

        let err = engine.set_space_name(permanent_id, "   ").await;
        assert!(matches!(err, Err(SpacesError::Invalid(_))));
    }
}
