//! Engine state snapshot types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::iteration::IterationResult;
use crate::task::Task;

/// Engine-level status, distinct from the persisted session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// No loop running.
    Idle,
    /// Iteration loop active.
    Running,
    /// Loop parked between iterations, waiting for resume.
    Paused,
    /// Stop requested; loop is winding down.
    Stopping,
}

/// Why the iteration loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No pending tasks remained.
    NoTasks,
    /// `maxIterations` was reached.
    MaxIterations,
    /// The error policy aborted the loop.
    Error,
    /// An operator stopped the engine.
    Stopped,
}

/// The single mutable engine state. Readers receive cloned snapshots;
/// only the iteration loop writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    /// Current engine status.
    pub status: EngineStatus,
    /// 1-based count of iterations started so far.
    pub current_iteration: u32,
    /// Task being worked on, if an iteration is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Task>,
    /// Stdout captured for the current iteration.
    pub current_output: String,
    /// Stderr captured for the current iteration.
    pub current_stderr: String,
    /// Completed iteration records, oldest first.
    pub iterations: Vec<IterationResult>,
    /// Number of tasks the tracker has reported complete.
    pub tasks_completed: u32,
    /// Total tasks known to the tracker.
    pub total_tasks: u32,
    /// Iteration budget; 0 means unbounded.
    pub max_iterations: u32,
    /// When the engine was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Identifier of the agent adapter currently executing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agent: Option<String>,
    /// Opaque rate-limit bookkeeping carried across saves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_state: Option<Value>,
}

impl EngineState {
    /// Fresh idle state with the given iteration budget.
    #[must_use]
    pub fn new(max_iterations: u32) -> Self {
        Self {
            status: EngineStatus::Idle,
            current_iteration: 0,
            current_task: None,
            current_output: String::new(),
            current_stderr: String::new(),
            iterations: Vec::new(),
            tasks_completed: 0,
            total_tasks: 0,
            max_iterations,
            started_at: None,
            active_agent: None,
            rate_limit_state: None,
        }
    }

    /// Whether another iteration fits in the budget.
    #[must_use]
    pub const fn within_budget(&self) -> bool {
        self.max_iterations == 0 || self.current_iteration < self.max_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_is_unbounded() {
        let mut state = EngineState::new(0);
        state.current_iteration = 10_000;
        assert!(state.within_budget());
    }

    #[test]
    fn budget_is_exclusive_of_next_iteration() {
        let mut state = EngineState::new(2);
        state.current_iteration = 1;
        assert!(state.within_budget());
        state.current_iteration = 2;
        assert!(!state.within_budget());
    }

    #[test]
    fn state_serializes_camel_case() {
        let state = EngineState::new(5);
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"currentIteration\":0"));
        assert!(json.contains("\"maxIterations\":5"));
        assert!(json.contains("\"status\":\"idle\""));
    }
}
