//! Task instance status and its transition table.
//!
//! 数値コードの大小で状態を比べるのではなく、明示的な遷移表で判定します。
//! 旧 API の数値コードは `code()` / `from_code()` でだけ扱います。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Row created, container launch requested.
    Scheduled,
    /// Accepted by the orchestrator, not yet placed.
    Waiting,
    /// Placed; image pulling or init in progress.
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Time limit exceeded.
    Tle,
    /// Memory limit exceeded.
    Mle,
    /// Deletion requested; resolves to row removal.
    Deleting,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Scheduled,
        TaskStatus::Waiting,
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Tle,
        TaskStatus::Mle,
        TaskStatus::Deleting,
    ];

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Tle | TaskStatus::Mle
        )
    }

    /// Counts against the sharing quota and is watched by a monitor.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != TaskStatus::Deleting
    }

    /// Pre-running phases, in the order a container goes through them.
    fn launch_rank(self) -> Option<u8> {
        match self {
            TaskStatus::Scheduled => Some(0),
            TaskStatus::Waiting => Some(1),
            TaskStatus::Pending => Some(2),
            TaskStatus::Running => Some(3),
            _ => None,
        }
    }

    /// Transition table.
    ///
    /// - SCHEDULED → WAITING → PENDING → RUNNING (forward skips allowed)
    /// - RUNNING → SUCCEEDED / FAILED / TLE / MLE
    /// - pre-running → FAILED (launch failure, probe exhaustion)
    /// - any non-terminal → DELETING
    pub fn can_transition(self, to: TaskStatus) -> bool {
        if self.is_terminal() || self == TaskStatus::Deleting {
            return false;
        }
        if to == TaskStatus::Deleting {
            return true;
        }
        match (self.launch_rank(), to.launch_rank()) {
            (Some(from), Some(next)) => next > from,
            (Some(_), None) => match to {
                TaskStatus::Failed => true,
                TaskStatus::Succeeded | TaskStatus::Tle | TaskStatus::Mle => {
                    self == TaskStatus::Running
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Numeric code used by the legacy admin surface.
    pub fn code(self) -> u8 {
        match self {
            TaskStatus::Scheduled => 0,
            TaskStatus::Running => 1,
            TaskStatus::Succeeded => 2,
            TaskStatus::Failed => 3,
            TaskStatus::Deleting => 4,
            TaskStatus::Pending => 5,
            TaskStatus::Tle => 6,
            TaskStatus::Waiting => 7,
            TaskStatus::Mle => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Tle => "TLE",
            TaskStatus::Mle => "MLE",
            TaskStatus::Deleting => "DELETING",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Scheduled, TaskStatus::Waiting, true)]
    #[case(TaskStatus::Scheduled, TaskStatus::Running, true)]
    #[case(TaskStatus::Waiting, TaskStatus::Pending, true)]
    #[case(TaskStatus::Pending, TaskStatus::Running, true)]
    #[case(TaskStatus::Pending, TaskStatus::Waiting, false)]
    #[case(TaskStatus::Running, TaskStatus::Pending, false)]
    #[case(TaskStatus::Running, TaskStatus::Succeeded, true)]
    #[case(TaskStatus::Running, TaskStatus::Failed, true)]
    #[case(TaskStatus::Running, TaskStatus::Tle, true)]
    #[case(TaskStatus::Running, TaskStatus::Mle, true)]
    #[case(TaskStatus::Pending, TaskStatus::Tle, false)]
    #[case(TaskStatus::Scheduled, TaskStatus::Succeeded, false)]
    #[case(TaskStatus::Scheduled, TaskStatus::Failed, true)]
    #[case(TaskStatus::Waiting, TaskStatus::Deleting, true)]
    #[case(TaskStatus::Running, TaskStatus::Running, false)]
    #[case(TaskStatus::Deleting, TaskStatus::Failed, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition(to), ok, "{from} -> {to}");
    }

    #[test]
    fn terminal_states_never_move() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn legacy_codes_cover_every_status() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TaskStatus::from_code(9), None);
        assert_eq!(TaskStatus::Tle.code(), 6);
    }

    #[test]
    fn serializes_in_upper_case() {
        let json = serde_json::to_string(&TaskStatus::Tle).unwrap();
        assert_eq!(json, "\"TLE\"");
    }
}
