//! Interfaces for the two external collaborators the core engine is built
//! against: the browser-event adapter and the UI client. Neither is
//! implemented here beyond a mock adapter used by tests and the demo
//! binary — the real OS/browser integration is out of scope.

mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use mock::MockBrowserAdapter;

/// Ephemeral browser window handle, as minted by the real browser process.
pub type WindowId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub id: WindowId,
    pub tabs: Vec<TabSnapshot>,
}

impl WindowSnapshot {
    /// Non-empty, non-internal (`chrome://`) URLs, in tab order.
    pub fn visible_urls(&self) -> Vec<String> {
        self.tabs
            .iter()
            .map(|t| t.url.clone())
            .filter(|u| !u.is_empty() && !u.starts_with("chrome://"))
            .collect()
    }

    pub fn has_only_internal_urls(&self) -> bool {
        !self.tabs.is_empty() && self.visible_urls().is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateWindowOpts {
    pub focused: bool,
    pub state: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("window not found: {0}")]
    WindowNotFound(WindowId),
    #[error("adapter operation failed: {0}")]
    Failed(String),
}

/// The browser-adapter event stream named in the external-interfaces
/// section: `window_created`, `window_removed`, `window_focus_changed`,
/// `tab_created`, `tab_updated`. The core only ever subscribes to this
/// stream; it never emits into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterEvent {
    WindowCreated { window: WindowSnapshot },
    WindowRemoved { window_id: WindowId },
    WindowFocusChanged { window_id: WindowId },
    TabCreated { window_id: WindowId, tab: TabSnapshot },
    TabUpdated { window_id: WindowId, tab: TabSnapshot },
}

/// Everything the core engine needs from the hosting browser process.
///
/// A real implementation lives outside this workspace (it talks to actual
/// OS windows); this trait is the seam the engine is written against.
#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    async fn get_all_windows(&self) -> Result<Vec<WindowSnapshot>, AdapterError>;

    async fn create_window(
        &self,
        urls: Vec<String>,
        opts: CreateWindowOpts,
    ) -> Result<WindowSnapshot, AdapterError>;

    async fn close_window(&self, id: &str) -> Result<(), AdapterError>;

    async fn switch_to_window(&self, id: &str) -> Result<(), AdapterError>;

    async fn get_tabs(&self, window_id: &str) -> Result<Vec<TabSnapshot>, AdapterError>;

    /// Moves a single tab, identified by its current URL, from one window
    /// to another. Used by the `move_tab` request; the core re-reconciles
    /// afterward rather than tracking the move itself.
    async fn move_tab(&self, tab_url: &str, source_window_id: &str, target_window_id: &str) -> Result<(), AdapterError>;

    /// A fresh receiver onto the adapter's event stream. Every subscriber
    /// gets every event from the point of subscription on (broadcast, not
    /// point-to-point), matching how multiple UI clients and the core's own
    /// event-driven reconciliation both need to observe the same window
    /// lifecycle independently.
    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent>;
}

/// Payload shape for the `state-sync` duplex channel exposed to UI clients.
/// `Incremental` carries only the changes since `base_version`; `Full`
/// carries the entire snapshot so a client can reset after a version skew.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastPayload {
    Incremental {
        changes: serde_json::Value,
        base_version: u64,
    },
    Full {
        state: serde_json::Value,
    },
}

/// A UI-originated request, per the MessageRouter table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UiRequest {
    GetAllSpaces,
    RenameSpace { window_id: WindowId, name: String },
    CloseSpace { window_id: WindowId },
    SwitchToSpace { window_id: WindowId },
    RestoreSpace { permanent_id: String },
    DeleteClosedSpace { permanent_id: String },
    MoveTab { tab_id: String, target_window_id: WindowId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UiResponse {
    Ok { payload: serde_json::Value },
    Error { kind: String, message: String },
}
