//! Status - ステータス集計ビュー

use serde::{Deserialize, Serialize};

use crate::domain::{TaskInstance, TaskStatus};

/// Number of instances per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub scheduled: usize,
    pub waiting: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub tle: usize,
    pub mle: usize,
    pub deleting: usize,
}

impl StatusCounts {
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a TaskInstance>) -> Self {
        let mut counts = Self::default();
        for row in rows {
            counts.add(row.status);
        }
        counts
    }

    fn add(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Scheduled => &mut self.scheduled,
            TaskStatus::Waiting => &mut self.waiting,
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Succeeded => &mut self.succeeded,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Tle => &mut self.tle,
            TaskStatus::Mle => &mut self.mle,
            TaskStatus::Deleting => &mut self.deleting,
        };
        *slot += 1;
    }

    /// Instances that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.scheduled + self.waiting + self.pending + self.running + self.deleting
    }

    pub fn total(&self) -> usize {
        self.in_flight() + self.succeeded + self.failed + self.tle + self.mle
    }
}
