//! Adapter traits for the two external collaborators: the agent and
//! the tracker.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::task::{Task, TaskStatus};

/// What the engine hands an agent for one iteration.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Fully rendered prompt for this iteration.
    pub prompt: String,
    /// The selected task.
    pub task: Task,
    /// 1-based iteration number.
    pub iteration: u32,
    /// Working directory for the agent process.
    pub cwd: PathBuf,
    /// Model override, when the adapter supports one.
    pub model: Option<String>,
}

/// A structured or raw event from a running agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A chunk of stdout.
    Stdout(String),
    /// A chunk of stderr.
    Stderr(String),
    /// A structured JSONL message the agent emitted.
    Jsonl(Value),
    /// The agent process ended.
    End(AgentEnd),
}

/// Terminal event for an agent run.
#[derive(Debug, Clone, Copy)]
pub struct AgentEnd {
    /// Process exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Whether the run ended because it was signalled.
    pub interrupted: bool,
}

impl AgentEnd {
    /// Whether the agent finished successfully.
    #[must_use]
    pub const fn success(&self) -> bool {
        !self.interrupted && matches!(self.exit_code, Some(0))
    }
}

/// Handle to one in-flight agent run.
///
/// The engine consumes `events` until [`AgentEvent::End`]; `interrupt`
/// delivers a one-shot SIGINT-equivalent to the agent.
#[derive(Debug)]
pub struct AgentHandle {
    events: mpsc::Receiver<AgentEvent>,
    interrupt_tx: Option<oneshot::Sender<()>>,
}

impl AgentHandle {
    /// Build a handle from its two channel halves.
    #[must_use]
    pub fn new(events: mpsc::Receiver<AgentEvent>, interrupt_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            interrupt_tx: Some(interrupt_tx),
        }
    }

    /// Next event from the agent; `None` once the event channel closes.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Signal the agent to stop. Returns false if the signal was
    /// already sent or the agent is gone.
    pub fn interrupt(&mut self) -> bool {
        match self.interrupt_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Agent adapter failure.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Command build error: {0}")]
    CommandBuild(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives an external process that performs code changes.
///
/// Implementations spawn the process, stream its output as
/// [`AgentEvent`]s, and honor interrupts. The engine never interprets
/// agent output beyond text and JSONL extraction.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Stable identifier recorded as `activeAgent` in engine state.
    fn id(&self) -> &str;

    /// Start one agent run.
    ///
    /// # Errors
    /// Returns an error when the process cannot be spawned.
    async fn execute(&self, request: ExecuteRequest) -> Result<AgentHandle, AgentError>;
}

/// Tracker adapter failure.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("Tracker backend error: {0}")]
    Backend(String),
}

/// Store of work items with statuses.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Plugin name recorded in the persisted session.
    fn plugin_name(&self) -> &str;

    /// Snapshot of all known tasks.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    async fn tasks(&self) -> Result<Vec<Task>, TrackerError>;

    /// Look up a single task by id.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    async fn task(&self, id: &str) -> Result<Option<Task>, TrackerError>;

    /// Update a task's status.
    ///
    /// # Errors
    /// Returns an error when the task is unknown or the write fails.
    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<(), TrackerError>;

    /// Re-read the backing store, when the backend caches.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    async fn refresh(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}
