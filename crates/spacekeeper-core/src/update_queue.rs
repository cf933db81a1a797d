//! Batches state mutations before they reach durable storage.
//!
//! Grounded on the same actor shape as `lock_table`: a background task owns
//! the pending batch and is driven by a command channel. Priority mirrors
//! `TabManagerCommand` dispatch in the teacher: most updates are coalesced
//! behind a debounce timer, `Critical` updates force an immediate flush.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::SpacesConfig;
use crate::error::SpacesResult;
use crate::model::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub timestamp: i64,
    pub priority: Priority,
}

impl StateUpdate {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Value, priority: Priority) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
            timestamp: now_ms(),
            priority,
        }
    }
}

/// Applies a flushed batch to durable storage. Implemented by
/// `engine::StateEngine`; kept as a trait here so the queue has no
/// dependency on the engine's concrete type.
#[async_trait::async_trait]
pub trait BatchSink: Send + Sync {
    async fn commit_batch(&self, updates: Vec<StateUpdate>) -> SpacesResult<()>;
}

enum QueueCommand {
    Push(StateUpdate),
    Flush(oneshot::Sender<SpacesResult<()>>),
}

pub struct UpdateQueue {
    sender: mpsc::UnboundedSender<QueueCommand>,
}

impl UpdateQueue {
    /// Two timers mirror the two distinct windows in spec §4.3: a short
    /// `batch_window` collects/merges same-id pushes into one batch, then a
    /// longer `storage_debounce` delays the actual commit so several
    /// back-to-back batch windows coalesce into a single storage write.
    pub fn new(sink: std::sync::Arc<dyn BatchSink>, config: SpacesConfig) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueueCommand>();
        tokio::spawn(async move {
            let mut pending: VecDeque<StateUpdate> = VecDeque::new();
            let batch_window = Duration::from_millis(config.batch_window_ms);
            let storage_debounce = Duration::from_millis(config.storage_debounce_ms);

            let mut batch_timer = Box::pin(tokio::time::sleep(batch_window));
            let mut batch_armed = false;
            let mut storage_timer = Box::pin(tokio::time::sleep(storage_debounce));
            let mut storage_armed = false;

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            None => break,
                            Some(QueueCommand::Push(update)) => {
                                let critical = update.priority == Priority::Critical;
                                merge_or_push(&mut pending, update);

                                if critical || pending.len() >= config.max_queue_size {
                                    let batch = drain_sorted(&mut pending);
                                    batch_armed = false;
                                    if commit_or_restore(&sink, &mut pending, batch).await.is_ok() {
                                        storage_armed = false;
                                    } else if !storage_armed {
                                        storage_timer.as_mut().reset(tokio::time::Instant::now() + storage_debounce);
                                        storage_armed = true;
                                    }
                                } else if !batch_armed {
                                    batch_timer.as_mut().reset(tokio::time::Instant::now() + batch_window);
                                    batch_armed = true;
                                }
                            }
                            Some(QueueCommand::Flush(respond_to)) => {
                                let batch = drain_sorted(&mut pending);
                                batch_armed = false;
                                let result = commit_or_restore(&sink, &mut pending, batch).await;
                                storage_armed = result.is_err() && !pending.is_empty();
                                if storage_armed {
                                    storage_timer.as_mut().reset(tokio::time::Instant::now() + storage_debounce);
                                }
                                let _ = respond_to.send(result);
                            }
                        }
                    }
                    _ = &mut batch_timer, if batch_armed => {
                        // The batch window closed: hand the now-stable batch
                        // off to the storage debounce, which does not reset
                        // if already running, so bursts of closed batches
                        // still land in one storage write.
                        batch_armed = false;
                        if !pending.is_empty() && !storage_armed {
                            storage_timer.as_mut().reset(tokio::time::Instant::now() + storage_debounce);
                            storage_armed = true;
                        }
                    }
                    _ = &mut storage_timer, if storage_armed => {
                        storage_armed = false;
                        if !pending.is_empty() {
                            let batch = drain_sorted(&mut pending);
                            if commit_or_restore(&sink, &mut pending, batch).await.is_err() {
                                storage_timer.as_mut().reset(tokio::time::Instant::now() + storage_debounce);
                                storage_armed = true;
                            }
                        }
                    }
                }
            }
        });
        Self { sender }
    }

    pub fn enqueue(&self, update: StateUpdate) {
        let _ = self.sender.send(QueueCommand::Push(update));
    }

    /// Force an immediate flush of the current batch and wait for the
    /// storage commit to complete. Used on shutdown.
    pub async fn flush(&self) -> SpacesResult<()> {
        let (respond_to, done) = oneshot::channel();
        self.sender
            .send(QueueCommand::Flush(respond_to))
            .map_err(|_| crate::error::SpacesError::Storage("update queue task is gone".into()))?;
        done.await
            .map_err(|_| crate::error::SpacesError::Storage("update queue task is gone".into()))?
    }
}

/// Commits `batch`, putting it back at the front of `pending` on failure so
/// the updates are retried rather than lost (spec's rollback-on-failure
/// requirement).
async fn commit_or_restore(
    sink: &std::sync::Arc<dyn BatchSink>,
    pending: &mut VecDeque<StateUpdate>,
    batch: Vec<StateUpdate>,
) -> SpacesResult<()> {
    match sink.commit_batch(batch.clone()).await {
        Ok(()) => Ok(()),
        Err(e) => {
            restore_to_front(pending, batch);
            Err(e)
        }
    }
}

/// Reinserts a drained batch at the front of `pending`, in its original
/// order, ahead of anything pushed while the commit was in flight.
fn restore_to_front(pending: &mut VecDeque<StateUpdate>, batch: Vec<StateUpdate>) {
    for update in batch.into_iter().rev() {
        pending.push_front(update);
    }
}

/// Drains the pending batch ordered highest-priority-first, ties broken by
/// ascending timestamp, matching `process_queue`'s processing order.
fn drain_sorted(pending: &mut VecDeque<StateUpdate>) -> Vec<StateUpdate> {
    let mut batch: Vec<StateUpdate> = std::mem::take(pending).into();
    batch.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.timestamp.cmp(&b.timestamp)));
    batch
}

/// Two updates addressing the same id within the same undispatched batch
/// collapse into one: the newer payload wins, but the original timestamp
/// and the higher of the two priorities are kept.
fn merge_or_push(pending: &mut VecDeque<StateUpdate>, update: StateUpdate) {
    if let Some(existing) = pending.iter_mut().find(|u| u.id == update.id && u.kind == update.kind) {
        let original_timestamp = existing.timestamp;
        let priority = existing.priority.max(update.priority);
        *existing = StateUpdate {
            priority,
            timestamp: original_timestamp,
            ..update
        };
    } else {
        pending.push_back(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct RecordingSink {
        batches: Arc<Mutex<Vec<Vec<StateUpdate>>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BatchSink for RecordingSink {
        async fn commit_batch(&self, updates: Vec<StateUpdate>) -> SpacesResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().await.push(updates);
            Ok(())
        }
    }

    #[tokio::test]
    async fn critical_update_flushes_immediately() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink {
            batches: batches.clone(),
            calls: calls.clone(),
        });
        let mut config = SpacesConfig::default();
        config.storage_debounce_ms = 60_000;
        let queue = UpdateQueue::new(sink, config);

        queue.enqueue(StateUpdate::new("space-1", "rename", Value::Null, Priority::Critical));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn normal_updates_debounce_into_one_batch() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink {
            batches: batches.clone(),
            calls: calls.clone(),
        });
        let mut config = SpacesConfig::default();
        config.batch_window_ms = 20;
        config.storage_debounce_ms = 20;
        let queue = UpdateQueue::new(sink, config);

        queue.enqueue(StateUpdate::new("space-1", "rename", Value::Null, Priority::Normal));
        queue.enqueue(StateUpdate::new("space-2", "rename", Value::Null, Priority::Normal));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batches.lock().await[0].len(), 2);
    }

    #[tokio::test]
    async fn repeated_updates_to_same_id_merge() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink {
            batches: batches.clone(),
            calls,
        });
        let mut config = SpacesConfig::default();
        config.batch_window_ms = 20;
        config.storage_debounce_ms = 20;
        let queue = UpdateQueue::new(sink, config);

        queue.enqueue(StateUpdate::new("space-1", "rename", serde_json::json!("a"), Priority::Normal));
        queue.enqueue(StateUpdate::new("space-1", "rename", serde_json::json!("b"), Priority::Normal));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let batch = &batches.lock().await[0];
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, serde_json::json!("b"));
    }

    #[tokio::test]
    async fn storage_debounce_coalesces_successive_batch_windows() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink {
            batches: batches.clone(),
            calls: calls.clone(),
        });
        let mut config = SpacesConfig::default();
        config.batch_window_ms = 15;
        config.storage_debounce_ms = 40;
        let queue = UpdateQueue::new(sink, config);

        queue.enqueue(StateUpdate::new("space-1", "rename", Value::Null, Priority::Normal));
        // Past the 15ms batch window but still well inside the 40ms storage
        // debounce it hands off to: this must not produce a second commit.
        tokio::time::sleep(Duration::from_millis(25)).await;
        queue.enqueue(StateUpdate::new("space-2", "rename", Value::Null, Priority::Normal));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batches.lock().await[0].len(), 2);
    }

    #[tokio::test]
    async fn explicit_flush_drains_pending_batch() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink {
            batches: batches.clone(),
            calls,
        });
        let mut config = SpacesConfig::default();
        config.storage_debounce_ms = 60_000;
        let queue = UpdateQueue::new(sink, config);

        queue.enqueue(StateUpdate::new("space-1", "rename", Value::Null, Priority::Normal));
        queue.flush().await.unwrap();

        assert_eq!(batches.lock().await.len(), 1);
    }
}
