//! Supervisor - インスタンスごとのタスクを 1 本だけ動かす
//!
//! - 同じ InstanceId のタスクは重複して起動しない（monitor / cancellation の冪等性）
//! - panic は JoinError として記録し、他のインスタンスには波及させない
//! - TaskTracker で追跡し、shutdown 時にまとめて待てる

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::domain::InstanceId;

#[derive(Clone)]
pub(crate) struct Supervisor {
    kind: &'static str,
    tracker: TaskTracker,
    active: Arc<Mutex<HashSet<InstanceId>>>,
}

impl Supervisor {
    pub(crate) fn new(kind: &'static str, tracker: TaskTracker) -> Self {
        Self {
            kind,
            tracker,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Spawns `task` for `id` unless one is already running. Returns whether it was spawned.
    pub(crate) async fn spawn_unique<F>(&self, id: InstanceId, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.active.lock().await.insert(id) {
            debug!(kind = self.kind, instance = %id, "already running");
            return false;
        }

        let inner = tokio::spawn(task);
        let active = Arc::clone(&self.active);
        let kind = self.kind;
        self.tracker.spawn(async move {
            match inner.await {
                Ok(()) => debug!(kind, instance = %id, "supervised task finished"),
                Err(err) if err.is_panic() => {
                    error!(kind, instance = %id, "supervised task panicked")
                }
                Err(err) => warn!(kind, instance = %id, error = %err, "supervised task aborted"),
            }
            active.lock().await.remove(&id);
        });
        true
    }

    #[cfg(test)]
    pub(crate) async fn is_active(&self, id: InstanceId) -> bool {
        self.active.lock().await.contains(&id)
    }

    pub(crate) async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}
