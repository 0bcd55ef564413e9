//! Scripted agent and in-memory tracker for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use ralph_tui_core::{
    AgentAdapter, AgentEnd, AgentError, AgentEvent, AgentHandle, ExecuteRequest, Task, TaskStatus,
    Tracker, TrackerError,
};

/// One scripted agent run.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    /// Stdout chunks emitted before the run ends.
    pub stdout: Vec<String>,
    /// Stderr chunks emitted before the run ends.
    pub stderr: Vec<String>,
    /// Exit code reported at the end.
    pub exit_code: i32,
    /// Whether the run marks its task complete in the tracker.
    pub completes_task: bool,
    /// How long the run takes; interruptible.
    pub duration: Duration,
}

impl ScriptedRun {
    /// A run that succeeds and completes its task.
    #[must_use]
    pub fn success() -> Self {
        Self {
            stdout: vec!["done\n".to_string()],
            stderr: Vec::new(),
            exit_code: 0,
            completes_task: true,
            duration: Duration::ZERO,
        }
    }

    /// A run that succeeds without finishing the task.
    #[must_use]
    pub fn success_without_completion() -> Self {
        Self {
            completes_task: false,
            ..Self::success()
        }
    }

    /// A run that fails with the given exit code.
    #[must_use]
    pub fn failure(exit_code: i32) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: vec!["boom\n".to_string()],
            exit_code,
            completes_task: false,
            duration: Duration::ZERO,
        }
    }

    /// Make the run take a while, so it can be interrupted.
    #[must_use]
    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Agent that plays back scripted runs in order.
///
/// Panics in `execute` if the script runs dry; size the script to the
/// scenario. Each run marks its task complete through the shared
/// tracker when scripted to do so.
pub struct ScriptedAgent {
    runs: Mutex<std::vec::IntoIter<ScriptedRun>>,
    tracker: Arc<MemoryTracker>,
}

impl ScriptedAgent {
    /// Create a scripted agent bound to the tracker it updates.
    #[must_use]
    pub fn new(runs: Vec<ScriptedRun>, tracker: Arc<MemoryTracker>) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(runs.into_iter()),
            tracker,
        })
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAgent {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<AgentHandle, AgentError> {
        let run = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next()
            .expect("scripted agent ran out of runs");

        let (events_tx, events_rx) = mpsc::channel(64);
        let (interrupt_tx, interrupt_rx) = oneshot::channel::<()>();
        let tracker = Arc::clone(&self.tracker);
        let task_id = request.task.id.clone();

        tokio::spawn(async move {
            for chunk in &run.stdout {
                let _ = events_tx.send(AgentEvent::Stdout(chunk.clone())).await;
            }
            for chunk in &run.stderr {
                let _ = events_tx.send(AgentEvent::Stderr(chunk.clone())).await;
            }

            let interrupted = if run.duration.is_zero() {
                false
            } else {
                tokio::select! {
                    () = tokio::time::sleep(run.duration) => false,
                    _ = interrupt_rx => true,
                }
            };

            if !interrupted && run.exit_code == 0 && run.completes_task {
                tracker.set_status(&task_id, TaskStatus::Completed);
            }

            let _ = events_tx
                .send(AgentEvent::End(AgentEnd {
                    exit_code: Some(if interrupted { 130 } else { run.exit_code }),
                    interrupted,
                }))
                .await;
        });

        Ok(AgentHandle::new(events_rx, interrupt_tx))
    }
}

/// In-memory tracker.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    tasks: Mutex<Vec<Task>>,
    refresh_count: Mutex<u32>,
}

impl MemoryTracker {
    /// Tracker seeded with tasks.
    #[must_use]
    pub fn new(tasks: Vec<Task>) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(tasks),
            refresh_count: Mutex::new(0),
        })
    }

    /// Directly set a task's status.
    pub fn set_status(&self, id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            task.status = status;
        }
    }

    /// How many times `refresh` was called.
    #[must_use]
    pub fn refreshes(&self) -> u32 {
        *self.refresh_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Statuses by task id, for assertions.
    #[must_use]
    pub fn statuses(&self) -> HashMap<String, TaskStatus> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect()
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    fn plugin_name(&self) -> &str {
        "memory"
    }

    async fn tasks(&self) -> Result<Vec<Task>, TrackerError> {
        Ok(self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn task(&self, id: &str) -> Result<Option<Task>, TrackerError> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<(), TrackerError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        // A completed task never moves backwards.
        if task.status != TaskStatus::Completed || status == TaskStatus::Completed {
            task.status = status;
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<(), TrackerError> {
        *self.refresh_count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
