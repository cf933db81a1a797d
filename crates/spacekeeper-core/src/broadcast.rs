//! Fan-out of state changes to connected UI clients.
//!
//! Grounded on `citadel_zkvm::Channel`: each registered client gets a pair
//! of independent mpsc ends and its own bookkeeping struct, owned by a
//! table behind an `RwLock` rather than one giant lock over all state.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use spacekeeper_adapter::BroadcastPayload;

use crate::config::SpacesConfig;

struct ClientChannel {
    sender: mpsc::UnboundedSender<BroadcastPayload>,
    /// Version of full state this client last received, for incremental
    /// diffing. Reset to `None` whenever a `Full` snapshot is sent.
    last_full_version: Option<u64>,
    changes_since_full: u32,
}

struct Namespace {
    clients: HashMap<String, ClientChannel>,
    version: u64,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
            version: 0,
        }
    }
}

/// Broadcasts state changes to every registered client, switching between
/// incremental and full snapshots per spec §4.4.
pub struct BroadcastFabric {
    namespace: RwLock<Namespace>,
    incremental_update_threshold: u32,
}

impl BroadcastFabric {
    pub fn new(config: &SpacesConfig) -> Self {
        Self {
            namespace: RwLock::new(Namespace::default()),
            incremental_update_threshold: config.incremental_update_threshold,
        }
    }

    /// Registers a client, returning the receiving end of its channel.
    /// `client_id` is typically the UI window id that opened the connection.
    pub async fn register(&self, client_id: impl Into<String>) -> mpsc::UnboundedReceiver<BroadcastPayload> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut ns = self.namespace.write().await;
        ns.clients.insert(
            client_id.into(),
            ClientChannel {
                sender,
                last_full_version: None,
                changes_since_full: 0,
            },
        );
        receiver
    }

    pub async fn unregister(&self, client_id: &str) {
        self.namespace.write().await.clients.remove(client_id);
    }

    /// Broadcast a change. `originator` is excluded unless `include_originator`
    /// is set, mirroring the UI convention that the initiator already knows
    /// the result of its own action.
    pub async fn broadcast_incremental(&self, changes: Value, originator: Option<&str>, include_originator: bool) {
        let mut ns = self.namespace.write().await;
        ns.version += 1;
        let base_version = ns.version;

        let mut dead = Vec::new();
        for (client_id, client) in ns.clients.iter_mut() {
            if !include_originator {
                if let Some(origin) = originator {
                    if client_id == origin {
                        continue;
                    }
                }
            }

            client.changes_since_full += 1;
            let payload = BroadcastPayload::Incremental {
                changes: changes.clone(),
                base_version,
            };
            if client.sender.send(payload).is_err() {
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            ns.clients.remove(&client_id);
        }
    }

    /// Send a full snapshot to one client (on registration, or once it has
    /// drifted past the incremental-update threshold) or to everyone.
    pub async fn broadcast_full(&self, state: Value, only: Option<&str>) {
        let mut ns = self.namespace.write().await;
        let version = ns.version;

        let mut dead = Vec::new();
        for (client_id, client) in ns.clients.iter_mut() {
            if let Some(target) = only {
                if client_id != target {
                    continue;
                }
            }
            client.last_full_version = Some(version);
            client.changes_since_full = 0;
            if client
                .sender
                .send(BroadcastPayload::Full { state: state.clone() })
                .is_err()
            {
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            ns.clients.remove(&client_id);
        }
    }

    /// True once a client has drifted far enough behind that it should get
    /// a full resync instead of another incremental diff.
    pub async fn needs_full_resync(&self, client_id: &str) -> bool {
        let ns = self.namespace.read().await;
        ns.clients
            .get(client_id)
            .map(|c| c.changes_since_full >= self.incremental_update_threshold)
            .unwrap_or(false)
    }

    /// Ids of every currently registered client, for callers that need to
    /// check each one's resync status individually via `needs_full_resync`.
    pub async fn client_ids(&self) -> Vec<String> {
        self.namespace.read().await.clients.keys().cloned().collect()
    }

    pub async fn client_count(&self) -> usize {
        self.namespace.read().await.clients.len()
    }
}

pub fn fabric(config: &SpacesConfig) -> Arc<BroadcastFabric> {
    Arc::new(BroadcastFabric::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_client_receives_incremental_broadcast() {
        let fabric = BroadcastFabric::new(&SpacesConfig::default());
        let mut rx = fabric.register("client-a").await;

        fabric
            .broadcast_incremental(serde_json::json!({"renamed": "space-1"}), None, true)
            .await;

        let payload = rx.recv().await.unwrap();
        assert!(matches!(payload, BroadcastPayload::Incremental { .. }));
    }

    #[tokio::test]
    async fn originator_is_excluded_by_default() {
        let fabric = BroadcastFabric::new(&SpacesConfig::default());
        let mut origin_rx = fabric.register("origin").await;
        let mut other_rx = fabric.register("other").await;

        fabric
            .broadcast_incremental(serde_json::json!({}), Some("origin"), false)
            .await;

        assert!(other_rx.try_recv().is_ok());
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn threshold_triggers_full_resync_need() {
        let mut config = SpacesConfig::default();
        config.incremental_update_threshold = 2;
        let fabric = BroadcastFabric::new(&config);
        let _rx = fabric.register("client-a").await;

        for _ in 0..2 {
            fabric.broadcast_incremental(serde_json::json!({}), None, true).await;
        }
        assert!(fabric.needs_full_resync("client-a").await);

        fabric.broadcast_full(serde_json::json!({}), Some("client-a")).await;
        assert!(!fabric.needs_full_resync("client-a").await);
    }

    #[tokio::test]
    async fn dead_client_is_evicted_on_send_failure() {
        let fabric = BroadcastFabric::new(&SpacesConfig::default());
        let rx = fabric.register("client-a").await;
        drop(rx);

        fabric.broadcast_incremental(serde_json::json!({}), None, true).await;
        assert_eq!(fabric.client_count().await, 0);
    }
}
