//! A named, FIFO mutex table.
//!
//! Shaped like `SendSafeTabManager` in the teacher pack: a background task
//! owns all mutable state and is reached through an `mpsc` command channel,
//! so the table itself is `Clone + Send + Sync` without any `unsafe impl`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{SpacesError, SpacesResult};

enum LockCommand {
    Acquire {
        id: String,
        respond_to: oneshot::Sender<()>,
    },
    Release {
        id: String,
    },
}

#[derive(Default)]
struct LockState {
    held: std::collections::HashSet<String>,
    waiters: HashMap<String, VecDeque<oneshot::Sender<()>>>,
}

impl LockState {
    fn handle_acquire(&mut self, id: String, respond_to: oneshot::Sender<()>) {
        if self.held.contains(&id) {
            self.waiters.entry(id).or_default().push_back(respond_to);
        } else if respond_to.send(()).is_ok() {
            self.held.insert(id);
        }
        // If the receiver was already dropped (caller's timeout already
        // fired), the id is left free rather than held forever with no
        // `ReleaseHandle` ever constructed to release it.
    }

    fn handle_release(&mut self, id: String) {
        let queue = self.waiters.get_mut(&id);
        let next = queue.and_then(|q| {
            // Skip waiters who already timed out and dropped their receiver.
            while let Some(sender) = q.pop_front() {
                if sender.send(()).is_ok() {
                    return Some(());
                }
            }
            None
        });

        if next.is_none() {
            self.held.remove(&id);
        }
        if self.waiters.get(&id).map_or(false, |q| q.is_empty()) {
            self.waiters.remove(&id);
        }
    }
}

/// Cloneable handle to the lock table's background task.
#[derive(Clone)]
pub struct LockTable {
    sender: mpsc::UnboundedSender<LockCommand>,
}

impl LockTable {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<LockCommand>();
        tokio::spawn(async move {
            let mut state = LockState::default();
            while let Some(cmd) = receiver.recv().await {
                match cmd {
                    LockCommand::Acquire { id, respond_to } => state.handle_acquire(id, respond_to),
                    LockCommand::Release { id } => state.handle_release(id),
                }
            }
        });
        Self { sender }
    }

    /// Acquire the named lock, waiting FIFO behind any earlier caller.
    pub async fn acquire(&self, id: impl Into<String>, timeout_ms: u64) -> SpacesResult<ReleaseHandle> {
        let id = id.into();
        let (respond_to, grant) = oneshot::channel();

        self.sender
            .send(LockCommand::Acquire {
                id: id.clone(),
                respond_to,
            })
            .map_err(|_| SpacesError::Storage("lock table task is gone".into()))?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), grant).await {
            Ok(Ok(())) => Ok(ReleaseHandle::new(id, self.sender.clone())),
            Ok(Err(_)) => Err(SpacesError::Storage("lock table task is gone".into())),
            Err(_) => Err(SpacesError::LockTimeout { id, timeout_ms }),
        }
    }

    /// Acquire every id, always in sorted order, to prevent ABBA deadlock.
    /// On partial failure, every already-acquired lock is released before
    /// the error returns.
    pub async fn acquire_multiple(
        &self,
        ids: &[String],
        timeout_ms: u64,
    ) -> SpacesResult<Vec<ReleaseHandle>> {
        let mut sorted: Vec<String> = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut handles = Vec::with_capacity(sorted.len());
        for id in sorted {
            match self.acquire(id, timeout_ms).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Release order doesn't matter for correctness (they are
                    // disjoint ids), but reverse mirrors acquisition order.
                    while let Some(handle) = handles.pop() {
                        drop(handle);
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its lock when dropped, on any exit path (including panics
/// unwinding through the holder). Calling `release()` explicitly is
/// equivalent and only runs once, since it consumes `self`.
pub struct ReleaseHandle {
    id: String,
    sender: mpsc::UnboundedSender<LockCommand>,
    released: bool,
}

impl ReleaseHandle {
    fn new(id: String, sender: mpsc::UnboundedSender<LockCommand>) -> Self {
        Self {
            id,
            sender,
            released: false,
        }
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.sender.send(LockCommand::Release { id: self.id.clone() });
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn exclusive_access_is_serialized() {
        let table = LockTable::new();
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            tasks.push(tokio::spawn(async move {
                let _handle = table.acquire("space-1", 1_000).await.unwrap();
                let cur = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(cur, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_does_not_deadlock_later_waiters() {
        let table = LockTable::new();
        let holder = table.acquire("space-1", 1_000).await.unwrap();

        let err = table.acquire("space-1", 20).await;
        assert!(matches!(err, Err(SpacesError::LockTimeout { .. })));

        drop(holder);
        // A later acquire must still succeed once the lock is free.
        let handle = table.acquire("space-1", 1_000).await.unwrap();
        drop(handle);
    }

    #[tokio::test]
    async fn acquire_multiple_sorts_ids() {
        let table = LockTable::new();
        let ids = vec!["b".to_string(), "a".to_string()];
        let handles = table.acquire_multiple(&ids, 1_000).await.unwrap();
        assert_eq!(handles.len(), 2);
    }

    #[tokio::test]
    async fn acquire_multiple_releases_on_partial_failure() {
        let table = LockTable::new();
        let _held_a = table.acquire("a", 1_000).await.unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        let err = table.acquire_multiple(&ids, 20).await;
        assert!(err.is_err());

        // "b" must have been released even though "a" failed.
        let handle_b = table.acquire("b", 1_000).await.unwrap();
        drop(handle_b);
    }
}
