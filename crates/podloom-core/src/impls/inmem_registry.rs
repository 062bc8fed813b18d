//! In-memory TaskRegistry implementation.
//!
//! 単一の `Mutex` で全行を守るので、受付判定と挿入、compare-and-set が
//! 自然に原子的になります。開発・テスト用です。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    EngineError, InstanceId, TaskInstance, TaskSettings, TaskStatus, TemplateId,
    TransitionError, TransitionUpdate, UserId,
};
use crate::ports::{DeletionRequest, TaskRegistry};

#[derive(Default)]
struct RegistryState {
    /// ULID 順 = 作成順
    rows: BTreeMap<InstanceId, TaskInstance>,
}

impl RegistryState {
    /// Distinct users holding a non-terminal instance of the template.
    ///
    /// DELETING rows still count until they are removed.
    fn holders(&self, settings_id: TemplateId) -> HashSet<&UserId> {
        self.rows
            .values()
            .filter(|row| row.settings_id == settings_id && !row.status.is_terminal())
            .map(|row| &row.user)
            .collect()
    }

    fn filtered(&self, pred: impl Fn(&TaskInstance) -> bool) -> Vec<TaskInstance> {
        self.rows.values().filter(|row| pred(row)).cloned().collect()
    }
}

/// In-memory registry.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts rows without admission control (restoring persisted state).
    pub async fn restore(&self, rows: Vec<TaskInstance>) {
        let mut state = self.state.lock().await;
        for row in rows {
            state.rows.insert(row.id, row);
        }
    }
}

#[async_trait]
impl TaskRegistry for InMemoryRegistry {
    async fn admit_and_insert(
        &self,
        settings: &TaskSettings,
        user: &UserId,
        rows: Vec<TaskInstance>,
    ) -> Result<Vec<InstanceId>, EngineError> {
        let mut state = self.state.lock().await;

        let (already_holds, holders) = {
            let holders = state.holders(settings.id);
            (holders.contains(user), holders.len())
        };
        if !already_holds && holders >= settings.max_sharing_users as usize {
            return Err(EngineError::AdmissionDenied {
                template: settings.name.clone(),
                holders,
                limit: settings.max_sharing_users,
            });
        }

        let ids = rows.iter().map(|row| row.id).collect();
        for row in rows {
            state.rows.insert(row.id, row);
        }
        Ok(ids)
    }

    async fn get(&self, id: InstanceId) -> Option<TaskInstance> {
        self.state.lock().await.rows.get(&id).cloned()
    }

    async fn list_by_user(&self, user: &UserId) -> Vec<TaskInstance> {
        self.state.lock().await.filtered(|row| &row.user == user)
    }

    async fn list_all(&self) -> Vec<TaskInstance> {
        self.state.lock().await.filtered(|_| true)
    }

    async fn list_by_settings(&self, settings_id: TemplateId) -> Vec<TaskInstance> {
        self.state
            .lock()
            .await
            .filtered(|row| row.settings_id == settings_id)
    }

    async fn list_non_terminal(&self) -> Vec<TaskInstance> {
        self.state.lock().await.filtered(|row| !row.is_terminal())
    }

    async fn transition(
        &self,
        id: InstanceId,
        expected: TaskStatus,
        to: TaskStatus,
        update: TransitionUpdate,
    ) -> Result<TaskInstance, TransitionError> {
        let mut state = self.state.lock().await;
        let row = state
            .rows
            .get_mut(&id)
            .ok_or(TransitionError::NotFound(id))?;

        if row.status != expected {
            return Err(TransitionError::Conflict {
                id,
                expected,
                actual: row.status,
            });
        }
        if !expected.can_transition(to) {
            return Err(TransitionError::Invalid {
                id,
                from: expected,
                to,
            });
        }

        row.status = to;
        if let Some(code) = update.exit_code {
            row.exit_code = Some(code);
        }
        if let Some(at) = update.started_at {
            row.started_at = Some(at);
        }
        if to.is_terminal() && row.log.is_none() {
            row.log = update.log;
        }
        Ok(row.clone())
    }

    async fn request_deletion(&self, id: InstanceId) -> Result<DeletionRequest, TransitionError> {
        let mut state = self.state.lock().await;
        let row = state
            .rows
            .get_mut(&id)
            .ok_or(TransitionError::NotFound(id))?;

        Ok(match row.status {
            TaskStatus::Deleting => DeletionRequest::AlreadyDeleting,
            status if status.is_terminal() => DeletionRequest::Terminal { status },
            previous => {
                row.status = TaskStatus::Deleting;
                DeletionRequest::Marked { previous }
            }
        })
    }

    async fn record_final_log(&self, id: InstanceId, log: String) -> bool {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(&id) {
            Some(row) if row.status == TaskStatus::Deleting => {
                row.log = Some(log);
                true
            }
            _ => false,
        }
    }

    async fn remove(&self, id: InstanceId) -> bool {
        self.state.lock().await.rows.remove(&id).is_some()
    }
}
