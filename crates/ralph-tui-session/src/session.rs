//! Persisted session schema and its pure mutators.
//!
//! Mutators touch only the in-memory value; writing to disk is the
//! store's job. Every mutator refreshes `updated_at`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ralph_tui_core::{IterationResult, Task, TaskStatus};

/// On-disk schema version.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Loop was running at last save.
    Running,
    /// Operator paused the loop.
    Paused,
    /// Engine or host went away mid-run.
    Interrupted,
    /// Run finished with all work done.
    Completed,
    /// Run ended on an error.
    Failed,
}

impl SessionStatus {
    /// Whether a session in this state can be picked back up.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Interrupted)
    }
}

/// Snapshot of one tracker task at save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            priority: task.priority,
        }
    }
}

/// Tracker-side context captured in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerState {
    /// Tracker plugin name.
    pub plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_path: Option<String>,
    /// Total tasks known at last save.
    pub total_tasks: u32,
    /// Task snapshots at last save.
    pub tasks: Vec<TaskSnapshot>,
}

/// Durable state for a single continuous run in one working directory.
///
/// Stored at `<cwd>/.ralph-tui-session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    /// Schema version; always [`SESSION_SCHEMA_VERSION`] when written.
    pub version: u32,
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub tasks_completed: u32,
    pub is_paused: bool,
    /// Agent plugin name.
    pub agent_plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tracker_state: TrackerState,
    /// Iteration history, oldest first.
    pub iterations: Vec<IterationResult>,
    /// Tasks the error policy took out of rotation.
    pub skipped_task_ids: Vec<String>,
    /// Working directory this session belongs to.
    pub cwd: PathBuf,
}

impl PersistedSession {
    /// Create a fresh running session.
    #[must_use]
    pub fn create(
        cwd: PathBuf,
        agent_plugin: impl Into<String>,
        model: Option<String>,
        max_iterations: u32,
        tracker_state: TrackerState,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: SESSION_SCHEMA_VERSION,
            session_id: Uuid::new_v4(),
            status: SessionStatus::Running,
            started_at: now,
            updated_at: now,
            paused_at: None,
            current_iteration: 0,
            max_iterations,
            tasks_completed: 0,
            is_paused: false,
            agent_plugin: agent_plugin.into(),
            model,
            tracker_state,
            iterations: Vec::new(),
            skipped_task_ids: Vec::new(),
            cwd,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record a finished iteration.
    pub fn update_after_iteration(&mut self, result: IterationResult) {
        self.current_iteration = result.iteration;
        if result.task_completed {
            self.tasks_completed += 1;
        }
        self.iterations.push(result);
        self.touch();
    }

    /// Refresh the tracker snapshot.
    pub fn update_tracker_tasks(&mut self, tasks: &[Task]) {
        self.tracker_state.total_tasks = tasks.len() as u32;
        self.tracker_state.tasks = tasks.iter().map(TaskSnapshot::from).collect();
        self.touch();
    }

    /// Mark the session paused.
    pub fn pause(&mut self) {
        self.status = SessionStatus::Paused;
        self.is_paused = true;
        self.paused_at = Some(Utc::now());
        self.touch();
    }

    /// Mark the session running again.
    pub fn resume(&mut self) {
        self.status = SessionStatus::Running;
        self.is_paused = false;
        self.paused_at = None;
        self.touch();
    }

    /// Mark the session finished.
    pub fn complete(&mut self) {
        self.status = SessionStatus::Completed;
        self.is_paused = false;
        self.touch();
    }

    /// Mark the session failed.
    pub fn fail(&mut self) {
        self.status = SessionStatus::Failed;
        self.is_paused = false;
        self.touch();
    }

    /// Mark the session interrupted.
    pub fn mark_interrupted(&mut self) {
        self.status = SessionStatus::Interrupted;
        self.touch();
    }

    /// Take a task out of rotation. Deduplicates.
    pub fn add_skipped_task(&mut self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        if !self.skipped_task_ids.contains(&task_id) {
            self.skipped_task_ids.push(task_id);
            self.touch();
        }
    }

    /// Whether this session can be picked back up.
    #[must_use]
    pub const fn is_resumable(&self) -> bool {
        self.status.is_resumable()
    }
}
