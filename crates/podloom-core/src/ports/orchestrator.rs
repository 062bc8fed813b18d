//! Orchestrator port - コンテナ基盤の抽象化
//!
//! エンジンが消費する最小の契約です。コンテナは `app=<instance id>` の
//! selector label で引き直すので、ハンドルを registry に保存する必要はありません。
//!
//! # 実装
//! - **FakeOrchestrator**: テスト・ローカル用（impls::fake_orchestrator）
//! - **DockerOrchestrator**: bollard 経由（impls::docker, feature = "docker"）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::{EngineError, InstanceId, LaunchSpec, TaskStatus};

/// Selector label attached to every container of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn for_instance(key: &str, id: InstanceId) -> Self {
        Self::new(key, id.to_string())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Opaque container reference returned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle(pub String);

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the orchestrator reports about a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerPhase {
    /// Accepted, not yet placed on a node.
    Accepted,
    /// Placed; image pull or init in progress.
    Placed,
    Running,
    Exited { code: i64 },
    /// Killed by the kernel for exceeding its memory limit.
    OomKilled,
    Unknown,
}

impl ContainerPhase {
    /// Non-terminal status this phase corresponds to, if any.
    pub fn launch_status(self) -> Option<TaskStatus> {
        match self {
            ContainerPhase::Accepted => Some(TaskStatus::Waiting),
            ContainerPhase::Placed => Some(TaskStatus::Pending),
            ContainerPhase::Running => Some(TaskStatus::Running),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub handle: ContainerHandle,
    pub phase: ContainerPhase,
    /// Current memory usage, when the orchestrator reports it.
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Target container no longer exists.
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("orchestrator call timed out")]
    Timeout,

    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    /// Request refused (bad image, invalid spec); retrying will not help.
    #[error("orchestrator rejected request: {0}")]
    Rejected(String),
}

impl OrchestratorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Timeout | OrchestratorError::Unavailable(_)
        )
    }
}

impl From<OrchestratorError> for EngineError {
    fn from(err: OrchestratorError) -> Self {
        EngineError::OrchestratorUnavailable(err.to_string())
    }
}

/// Orchestrator はコンテナの起動・一覧・ログ取得・停止を提供
///
/// すべての呼び出しは一時的に失敗し得ます。リトライは呼び出し側（app::retry）の責務です。
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        label: &Label,
    ) -> Result<ContainerHandle, OrchestratorError>;

    async fn list(&self, label: &Label) -> Result<Vec<ContainerState>, OrchestratorError>;

    /// Fails with `NotFound` when the container is gone and `Timeout` when the call itself stalls.
    async fn logs(&self, handle: &ContainerHandle) -> Result<String, OrchestratorError>;

    /// Force-stops and deletes every container carrying `label`.
    async fn terminate(&self, label: &Label) -> Result<(), OrchestratorError>;

    /// Deletes exited containers carrying `label`.
    async fn remove(&self, label: &Label) -> Result<(), OrchestratorError>;
}
