//! Immutable per-iteration results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Outcome of a single iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// Agent ran to completion (the task itself may or may not be done).
    Completed,
    /// Agent exited non-zero or its output could not be parsed.
    Failed,
    /// Agent was interrupted from outside.
    Interrupted,
    /// Task was skipped by the error policy.
    Skipped,
}

/// Record of one pass of (select task, invoke agent, record outcome).
///
/// Immutable once appended to the engine history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationResult {
    /// 1-based iteration number.
    pub iteration: u32,
    /// How the iteration ended.
    pub status: IterationStatus,
    /// The task that was worked on.
    pub task: Task,
    /// Whether the tracker reported the task complete afterwards.
    pub task_completed: bool,
    /// Wall-clock duration of the agent run.
    pub duration_ms: u64,
    /// Failure detail, when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the iteration started.
    pub started_at: DateTime<Utc>,
    /// When the iteration ended.
    pub ended_at: DateTime<Utc>,
}

impl IterationResult {
    /// Whether this result counts as a failure for the error policy.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self.status, IterationStatus::Failed)
    }
}
