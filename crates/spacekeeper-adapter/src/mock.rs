use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::{AdapterError, AdapterEvent, BrowserAdapter, CreateWindowOpts, TabSnapshot, WindowId, WindowSnapshot};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-memory stand-in for the real browser process, used by tests and the
/// demo binary. Windows are addressed by a monotonically increasing id so
/// tests can exercise window-id reuse deterministically.
#[derive(Clone)]
pub struct MockBrowserAdapter {
    windows: Arc<RwLock<HashMap<WindowId, Vec<TabSnapshot>>>>,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<AdapterEvent>,
}

impl Default for MockBrowserAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowserAdapter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    /// Simulate a window appearing without going through `create_window`
    /// (e.g. a window the user opened directly, or a reused window id).
    pub async fn spawn_window(&self, id: impl Into<WindowId>, urls: Vec<String>) -> WindowId {
        let id = id.into();
        let tabs: Vec<TabSnapshot> = urls.into_iter().map(|url| TabSnapshot { url }).collect();
        self.windows.write().await.insert(id.clone(), tabs.clone());
        let _ = self.events.send(AdapterEvent::WindowCreated {
            window: WindowSnapshot { id: id.clone(), tabs },
        });
        id
    }

    pub async fn set_tabs(&self, window_id: &str, urls: Vec<String>) {
        if let Some(tabs) = self.windows.write().await.get_mut(window_id) {
            *tabs = urls.into_iter().map(|url| TabSnapshot { url }).collect();
            if let Some(tab) = tabs.last().cloned() {
                let _ = self.events.send(AdapterEvent::TabUpdated {
                    window_id: window_id.to_string(),
                    tab,
                });
            }
        }
    }

    pub async fn remove_window(&self, window_id: &str) {
        if self.windows.write().await.remove(window_id).is_some() {
            let _ = self.events.send(AdapterEvent::WindowRemoved {
                window_id: window_id.to_string(),
            });
        }
    }
}

#[async_trait]
impl BrowserAdapter for MockBrowserAdapter {
    async fn get_all_windows(&self) -> Result<Vec<WindowSnapshot>, AdapterError> {
        let windows = self.windows.read().await;
        Ok(windows
            .iter()
            .map(|(id, tabs)| WindowSnapshot {
                id: id.clone(),
                tabs: tabs.clone(),
            })
            .collect())
    }

    async fn create_window(
        &self,
        urls: Vec<String>,
        _opts: CreateWindowOpts,
    ) -> Result<WindowSnapshot, AdapterError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let tabs: Vec<TabSnapshot> = urls.into_iter().map(|url| TabSnapshot { url }).collect();
        self.windows.write().await.insert(id.clone(), tabs.clone());
        let window = WindowSnapshot { id, tabs };
        let _ = self.events.send(AdapterEvent::WindowCreated { window: window.clone() });
        Ok(window)
    }

    async fn close_window(&self, id: &str) -> Result<(), AdapterError> {
        self.windows
            .write()
            .await
            .remove(id)
            .map(|_| {
                let _ = self.events.send(AdapterEvent::WindowRemoved { window_id: id.to_string() });
            })
            .ok_or_else(|| AdapterError::WindowNotFound(id.to_string()))
    }

    async fn switch_to_window(&self, id: &str) -> Result<(), AdapterError> {
        if self.windows.read().await.contains_key(id) {
            let _ = self.events.send(AdapterEvent::WindowFocusChanged { window_id: id.to_string() });
            Ok(())
        } else {
            Err(AdapterError::WindowNotFound(id.to_string()))
        }
    }

    async fn get_tabs(&self, window_id: &str) -> Result<Vec<TabSnapshot>, AdapterError> {
        self.windows
            .read()
            .await
            .get(window_id)
            .cloned()
            .ok_or_else(|| AdapterError::WindowNotFound(window_id.to_string()))
    }

    async fn move_tab(&self, tab_url: &str, source_window_id: &str, target_window_id: &str) -> Result<(), AdapterError> {
        let mut windows = self.windows.write().await;
        if !windows.contains_key(target_window_id) {
            return Err(AdapterError::WindowNotFound(target_window_id.to_string()));
        }
        let source = windows
            .get_mut(source_window_id)
            .ok_or_else(|| AdapterError::WindowNotFound(source_window_id.to_string()))?;
        let position = source
            .iter()
            .position(|t| t.url == tab_url)
            .ok_or_else(|| AdapterError::Failed(format!("tab not found in source window: {tab_url}")))?;
        let tab = source.remove(position);

        let target = windows.get_mut(target_window_id).expect("checked above");
        target.push(tab.clone());
        drop(windows);

        let _ = self.events.send(AdapterEvent::TabCreated {
            window_id: target_window_id.to_string(),
            tab,
        });
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}
