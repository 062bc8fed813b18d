//! TaskRegistry port - タスクインスタンスの正本
//!
//! registry はエンジン内で唯一の共有可変リソースです。
//!
//! # 設計原則
//! - すべての状態遷移は 1 行に対する compare-and-set（`transition`）
//! - 受付判定（sharing quota）と行の挿入は 1 つの原子的操作（`admit_and_insert`）
//! - 呼び出し側に許される外部からの変更は `request_deletion` のみ

use async_trait::async_trait;

use crate::domain::{
    EngineError, InstanceId, TaskInstance, TaskSettings, TaskStatus, TemplateId,
    TransitionError, TransitionUpdate, UserId,
};

/// Result of a deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionRequest {
    /// Row moved to DELETING from the given status.
    Marked { previous: TaskStatus },
    /// A previous request already marked it.
    AlreadyDeleting,
    /// Row is terminal; only cleanup remains.
    Terminal { status: TaskStatus },
}

#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Checks the sharing quota of `settings` and inserts `rows` in one step.
    ///
    /// A user that already holds an active instance of the template is admitted
    /// regardless of the quota. Fails with `EngineError::AdmissionDenied` otherwise.
    async fn admit_and_insert(
        &self,
        settings: &TaskSettings,
        user: &UserId,
        rows: Vec<TaskInstance>,
    ) -> Result<Vec<InstanceId>, EngineError>;

    async fn get(&self, id: InstanceId) -> Option<TaskInstance>;

    async fn list_by_user(&self, user: &UserId) -> Vec<TaskInstance>;

    async fn list_all(&self) -> Vec<TaskInstance>;

    async fn list_by_settings(&self, settings_id: TemplateId) -> Vec<TaskInstance>;

    /// Rows that still need a monitor or a cancellation pass.
    async fn list_non_terminal(&self) -> Vec<TaskInstance>;

    /// Compare-and-set: applies only when the row is currently `expected`
    /// and `expected -> to` is a valid transition.
    ///
    /// `update.log` is persisted only on a terminal transition.
    async fn transition(
        &self,
        id: InstanceId,
        expected: TaskStatus,
        to: TaskStatus,
        update: TransitionUpdate,
    ) -> Result<TaskInstance, TransitionError>;

    async fn request_deletion(&self, id: InstanceId) -> Result<DeletionRequest, TransitionError>;

    /// Overwrites the log snapshot of a DELETING row before removal.
    async fn record_final_log(&self, id: InstanceId, log: String) -> bool;

    /// Returns whether a row was removed.
    async fn remove(&self, id: InstanceId) -> bool;
}
