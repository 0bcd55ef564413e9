//! Iteration error-handling policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Consecutive failures tolerated per task before `Retry` falls back
/// to skipping.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What to do when an iteration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Terminate the loop.
    Abort,
    /// Re-select the same task, up to `max_retries` consecutive
    /// failures, then skip it.
    Retry,
    /// Take the task out of rotation immediately.
    Skip,
    /// Record the failure and move on; the task stays eligible.
    Continue,
}

/// Error policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    pub strategy: ErrorStrategy,
    pub max_retries: u32,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::Retry,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// What the policy decided for one failed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Terminate the loop with an error.
    Abort,
    /// Leave the task eligible and try again.
    RetryTask,
    /// Take the task out of rotation.
    SkipTask,
    /// Move on; the task stays eligible.
    ContinueLoop,
}

/// Tracks consecutive failures per task and applies the policy.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive: HashMap<String, u32>,
}

impl FailureTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `task_id` and decide what happens next.
    pub fn on_failure(&mut self, policy: ErrorPolicy, task_id: &str) -> PolicyDecision {
        match policy.strategy {
            ErrorStrategy::Abort => PolicyDecision::Abort,
            ErrorStrategy::Skip => PolicyDecision::SkipTask,
            ErrorStrategy::Continue => PolicyDecision::ContinueLoop,
            ErrorStrategy::Retry => {
                let count = self.consecutive.entry(task_id.to_string()).or_insert(0);
                *count += 1;
                if *count >= policy.max_retries {
                    PolicyDecision::SkipTask
                } else {
                    PolicyDecision::RetryTask
                }
            }
        }
    }

    /// Reset the consecutive-failure count after a success.
    pub fn on_success(&mut self, task_id: &str) {
        self.consecutive.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_falls_back_to_skip_after_max() {
        let policy = ErrorPolicy {
            strategy: ErrorStrategy::Retry,
            max_retries: 3,
        };
        let mut tracker = FailureTracker::new();
        assert_eq!(tracker.on_failure(policy, "a"), PolicyDecision::RetryTask);
        assert_eq!(tracker.on_failure(policy, "a"), PolicyDecision::RetryTask);
        assert_eq!(tracker.on_failure(policy, "a"), PolicyDecision::SkipTask);
    }

    #[test]
    fn success_resets_the_streak() {
        let policy = ErrorPolicy {
            strategy: ErrorStrategy::Retry,
            max_retries: 2,
        };
        let mut tracker = FailureTracker::new();
        assert_eq!(tracker.on_failure(policy, "a"), PolicyDecision::RetryTask);
        tracker.on_success("a");
        assert_eq!(tracker.on_failure(policy, "a"), PolicyDecision::RetryTask);
    }

    #[test]
    fn failures_are_tracked_per_task() {
        let policy = ErrorPolicy {
            strategy: ErrorStrategy::Retry,
            max_retries: 2,
        };
        let mut tracker = FailureTracker::new();
        assert_eq!(tracker.on_failure(policy, "a"), PolicyDecision::RetryTask);
        assert_eq!(tracker.on_failure(policy, "b"), PolicyDecision::RetryTask);
        assert_eq!(tracker.on_failure(policy, "a"), PolicyDecision::SkipTask);
    }

    #[test]
    fn non_retry_strategies_are_stateless() {
        let mut tracker = FailureTracker::new();
        let abort = ErrorPolicy { strategy: ErrorStrategy::Abort, max_retries: 3 };
        let skip = ErrorPolicy { strategy: ErrorStrategy::Skip, max_retries: 3 };
        let cont = ErrorPolicy { strategy: ErrorStrategy::Continue, max_retries: 3 };
        assert_eq!(tracker.on_failure(abort, "a"), PolicyDecision::Abort);
        assert_eq!(tracker.on_failure(skip, "a"), PolicyDecision::SkipTask);
        assert_eq!(tracker.on_failure(cont, "a"), PolicyDecision::ContinueLoop);
    }
}
