//! Drives a single restoration end-to-end: create window, rekey space,
//! install the restoration gate.
//!
//! Grounded on `dingaiminGIT-vmark`'s `hot_exit::restore_session_multi_window`:
//! a serialized, retryable, multi-step protocol with explicit compensation
//! on failure, rather than a plain async function — restoration touches
//! both the browser adapter and the engine and must not interleave with a
//! second restore of the same id.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use spacekeeper_adapter::{BrowserAdapter, CreateWindowOpts};

use crate::engine::StateEngine;
use crate::error::{SpacesError, SpacesResult};
use crate::restore_registry::RestoreRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Init,
    CreatingWindow,
    Rekeying,
    Completed,
    Failed,
}

struct RestoreJob {
    closed_space_id: Uuid,
    respond_to: oneshot::Sender<SpacesResult<String>>,
}

/// A FIFO-serialized restoration driver. Cloning shares the same worker
/// task and queue; restorations of different ids still run one at a time,
/// matching the "serial queue" wording exactly.
#[derive(Clone)]
pub struct RestoreTransaction {
    sender: mpsc::UnboundedSender<RestoreJob>,
}

impl RestoreTransaction {
    pub fn new(engine: Arc<StateEngine>, adapter: Arc<dyn BrowserAdapter>, registry: Arc<RestoreRegistry>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<RestoreJob>();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let result = run_restore(&engine, adapter.as_ref(), &registry, job.closed_space_id).await;
                let _ = job.respond_to.send(result);
            }
        });
        Self { sender }
    }

    /// Queue a restoration and wait for it to finish (success or failure).
    /// Concurrent callers for different ids still serialize through the
    /// same worker, per spec.
    pub async fn restore(&self, closed_space_id: Uuid) -> SpacesResult<String> {
        let (respond_to, done) = oneshot::channel();
        self.sender
            .send(RestoreJob {
                closed_space_id,
                respond_to,
            })
            .map_err(|_| SpacesError::Storage("restore transaction worker is gone".into()))?;
        done.await
            .map_err(|_| SpacesError::Storage("restore transaction worker is gone".into()))?
    }
}

async fn run_restore(
    engine: &StateEngine,
    adapter: &dyn BrowserAdapter,
    registry: &RestoreRegistry,
    closed_space_id: Uuid,
) -> SpacesResult<String> {
    let mut state = RestoreState::Init;

    let space = fetch_closed_space_with_retry(engine, closed_space_id).await?;

    let snapshot = registry
        .register_pending(
            closed_space_id,
            space.permanent_id,
            space.name.clone(),
            space.named,
            space.urls.clone(),
            crate::model::TabKind::Closed,
        )
        .await;

    state = RestoreState::CreatingWindow;
    let window_id = match create_window_with_fallback(adapter, &space.urls, closed_space_id).await {
        Ok(id) => id,
        Err(e) => {
            registry.fail(closed_space_id).await;
            return Err(compensate_failure(state, e));
        }
    };

    registry.attach_window(closed_space_id, window_id.clone()).await;

    state = RestoreState::Rekeying;
    if let Err(e) = engine.rekey_space(closed_space_id, window_id.clone()).await {
        let _ = adapter.close_window(&window_id).await;
        registry.fail(closed_space_id).await;
        return Err(compensate_failure(state, e));
    }

    let _ = snapshot;
    state = RestoreState::Completed;
    debug_assert_eq!(state, RestoreState::Completed);
    Ok(window_id)
}

fn compensate_failure(state: RestoreState, e: SpacesError) -> SpacesError {
    log::warn!("restore transaction failed in state {state:?}: {e}");
    e
}

async fn fetch_closed_space_with_retry(engine: &StateEngine, closed_space_id: Uuid) -> SpacesResult<crate::model::Space> {
    const ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for attempt in 0..ATTEMPTS {
        match engine.get_closed_space(closed_space_id).await {
            Ok(space) => return Ok(space),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < ATTEMPTS {
                    tokio::time::sleep(std::time::Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| SpacesError::NotFound(closed_space_id.to_string())))
}

async fn create_window_with_fallback(
    adapter: &dyn BrowserAdapter,
    urls: &[String],
    closed_space_id: Uuid,
) -> SpacesResult<String> {
    let opts = CreateWindowOpts {
        focused: true,
        state: None,
    };
    match adapter.create_window(urls.to_vec(), opts.clone()).await {
        Ok(window) => Ok(window.id),
        Err(_) if !urls.is_empty() => {
            let degraded = vec![urls[0].clone()];
            adapter
                .create_window(degraded, opts)
                .await
                .map(|window| window.id)
                .map_err(|e| SpacesError::RestoreFailed {
                    closed_space_id: closed_space_id.to_string(),
                    reason: e.to_string(),
                })
        }
        Err(e) => Err(SpacesError::RestoreFailed {
            closed_space_id: closed_space_id.to_string(),
            reason: e.to_string(),
        }),
    }
}
