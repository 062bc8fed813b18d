//! Task instance: one row per scheduled execution of a template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{InstanceId, TemplateId, UserId};
use super::settings::LaunchSpec;
use super::status::TaskStatus;

/// Registry row for one task instance.
///
/// 状態の変更は `TaskRegistry::transition`（compare-and-set）経由でのみ行います。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: InstanceId,
    pub user: UserId,
    pub settings_id: TemplateId,
    pub status: TaskStatus,
    pub exit_code: Option<i64>,
    /// Persisted log snapshot, written once at the first terminal transition.
    pub log: Option<String>,
    pub create_time: DateTime<Utc>,
    /// Set on entry to RUNNING.
    pub started_at: Option<DateTime<Utc>>,
    pub launch_spec: LaunchSpec,
}

impl TaskInstance {
    pub fn scheduled(
        id: InstanceId,
        user: UserId,
        settings_id: TemplateId,
        launch_spec: LaunchSpec,
        create_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user,
            settings_id,
            status: TaskStatus::Scheduled,
            exit_code: None,
            log: None,
            create_time,
            started_at: None,
            launch_spec,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionUpdate {
    pub exit_code: Option<i64>,
    /// Ignored unless the target status is terminal.
    pub log: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl TransitionUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn finished(exit_code: Option<i64>, log: impl Into<String>) -> Self {
        Self {
            exit_code,
            log: Some(log.into()),
            started_at: None,
        }
    }
}
