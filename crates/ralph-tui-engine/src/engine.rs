//! The engine handle and its public contract.
//!
//! The handle is cheap to clone and safe to share; all state mutation
//! happens on the loop task, control operations travel through the
//! command inbox, and readers take cloned snapshots.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::mpsc;

use ralph_tui_core::{
    AgentAdapter, EngineEvent, EngineState, EngineStatus, OutputStream, StopReason, Task, Tracker,
};
use ralph_tui_session::{PersistedSession, SessionRegistry, SessionStore, TrackerState};

use crate::command::{Command, CommandKind};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, EventSubscription};
use crate::output::{IterationOutput, IterationOutputs};
use crate::prompt::{render_prompt, DEFAULT_PROMPT_TEMPLATE};
use crate::runner::{run_loop, select_next_task};

/// Depth of the control-command inbox.
const COMMAND_INBOX_CAPACITY: usize = 32;

pub(crate) struct Lifecycle {
    /// Present while a loop task is alive.
    pub cmd_tx: Option<mpsc::Sender<Command>>,
    /// Why the last loop ended, once one has.
    pub terminated: Option<StopReason>,
}

pub(crate) struct EngineInner {
    pub agent: Arc<dyn AgentAdapter>,
    pub tracker: Arc<dyn Tracker>,
    pub store: SessionStore,
    pub registry: Option<SessionRegistry>,
    pub config: EngineConfig,
    pub state: RwLock<EngineState>,
    pub session: Mutex<PersistedSession>,
    pub events: EventBus,
    pub outputs: IterationOutputs,
    pub lifecycle: Mutex<Lifecycle>,
}

impl EngineInner {
    pub fn status(&self) -> EngineStatus {
        self.with_state(|s| s.status)
    }

    pub fn set_status(&self, status: EngineStatus) {
        self.with_state_mut(|s| s.status = status);
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut PersistedSession) -> R) -> R {
        f(&mut self.session.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Append an output chunk to the live transcript and fan it out.
    pub fn append_output(&self, stream: OutputStream, data: &str) {
        self.with_state_mut(|s| match stream {
            OutputStream::Stdout => s.current_output.push_str(data),
            OutputStream::Stderr => s.current_stderr.push_str(data),
        });
        self.events.emit(EngineEvent::AgentOutput {
            stream,
            data: data.to_string(),
        });
    }

    /// Save the session; persistence failures are logged and retried
    /// on the next save.
    pub fn persist_session(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.store.save(&mut session) {
            tracing::warn!(
                cwd = %session.cwd.display(),
                "failed to persist session, will retry on next save: {e}"
            );
        }
    }

    /// Mirror the session status into the registry.
    pub fn sync_registry(&self) {
        let Some(registry) = &self.registry else { return };
        let (id, status) = self.with_session(|s| (s.session_id, s.status));
        if let Err(e) = registry.update_status(id, status) {
            tracing::warn!("failed to update session registry: {e}");
        }
    }

    /// Grow the iteration budget.
    pub fn apply_add_iterations(&self, count: u32) -> Result<(), EngineError> {
        if count == 0 {
            return Err(EngineError::BadArg("count must be positive".to_string()));
        }
        self.with_state_mut(|s| s.max_iterations += count);
        self.with_session(|s| s.max_iterations += count);
        Ok(())
    }

    /// Shrink the iteration budget without ending the loop.
    pub fn apply_remove_iterations(&self, count: u32) -> Result<(), EngineError> {
        if count == 0 {
            return Err(EngineError::BadArg("count must be positive".to_string()));
        }
        let new_max = self.with_state(|s| {
            if s.max_iterations == 0 {
                return Err(EngineError::BadArg(
                    "iteration budget is unbounded".to_string(),
                ));
            }
            match s.max_iterations.checked_sub(count) {
                Some(new_max) if new_max >= s.current_iteration => Ok(new_max),
                _ => Err(EngineError::WouldEndLoop(count)),
            }
        })?;
        self.with_state_mut(|s| s.max_iterations = new_max);
        self.with_session(|s| s.max_iterations = new_max);
        Ok(())
    }

    /// Re-read the tracker and refresh the task totals.
    pub async fn refresh_tracker(&self) -> Result<(), EngineError> {
        self.tracker.refresh().await?;
        let tasks = self.tracker.tasks().await?;
        self.update_task_totals(&tasks);
        Ok(())
    }

    pub fn update_task_totals(&self, tasks: &[Task]) {
        self.with_state_mut(|s| s.total_tasks = tasks.len() as u32);
        self.with_session(|s| s.update_tracker_tasks(tasks));
    }
}

/// The execution engine.
///
/// Constructed with an agent, a tracker and a session; drives the
/// iteration loop on a dedicated task once started.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine with a fresh session for `config.cwd`.
    #[must_use]
    pub fn new(
        agent: Arc<dyn AgentAdapter>,
        tracker: Arc<dyn Tracker>,
        config: EngineConfig,
    ) -> Self {
        let session = PersistedSession::create(
            config.cwd.clone(),
            agent.id(),
            config.model.clone(),
            config.max_iterations,
            TrackerState {
                plugin: tracker.plugin_name().to_string(),
                epic_id: config.epic_id.clone(),
                prd_path: config.prd_path.clone(),
                total_tasks: 0,
                tasks: Vec::new(),
            },
        );
        Self::with_session(agent, tracker, config, session)
    }

    /// Create an engine resuming an existing session.
    ///
    /// Engine counters pick up where the session left off.
    #[must_use]
    pub fn with_session(
        agent: Arc<dyn AgentAdapter>,
        tracker: Arc<dyn Tracker>,
        config: EngineConfig,
        session: PersistedSession,
    ) -> Self {
        let mut state = EngineState::new(session.max_iterations);
        state.current_iteration = session.current_iteration;
        state.iterations = session.iterations.clone();
        state.tasks_completed = session.tasks_completed;
        state.total_tasks = session.tracker_state.total_tasks;

        Self {
            inner: Arc::new(EngineInner {
                agent,
                tracker,
                store: SessionStore::new(),
                registry: None,
                config,
                state: RwLock::new(state),
                session: Mutex::new(session),
                events: EventBus::default(),
                outputs: IterationOutputs::new(),
                lifecycle: Mutex::new(Lifecycle {
                    cmd_tx: None,
                    terminated: None,
                }),
            }),
        }
    }

    /// Attach a registry; the engine mirrors session status into it.
    #[must_use]
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_registry must be called before the engine is shared");
        inner.registry = Some(registry);
        self
    }

    /// Start the iteration loop.
    ///
    /// # Errors
    /// Returns [`EngineError::AlreadyRunning`] if a loop is alive.
    pub fn start(&self) -> Result<(), EngineError> {
        self.spawn_loop(false)
    }

    /// Resume the loop after it terminated, keeping all state.
    ///
    /// # Errors
    /// Returns [`EngineError::NotTerminated`] unless a previous loop
    /// has ended, [`EngineError::AlreadyRunning`] if one is alive.
    pub fn continue_run(&self) -> Result<(), EngineError> {
        self.spawn_loop(true)
    }

    fn spawn_loop(&self, require_terminated: bool) -> Result<(), EngineError> {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if lifecycle.cmd_tx.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        if require_terminated && lifecycle.terminated.is_none() {
            return Err(EngineError::NotTerminated);
        }
        let (tx, rx) = mpsc::channel(COMMAND_INBOX_CAPACITY);
        lifecycle.cmd_tx = Some(tx);
        lifecycle.terminated = None;
        drop(lifecycle);

        self.inner.with_state_mut(|s| {
            s.status = EngineStatus::Running;
            if s.started_at.is_none() {
                s.started_at = Some(Utc::now());
            }
        });
        tokio::spawn(run_loop(Arc::clone(&self.inner), rx));
        Ok(())
    }

    /// Request a pause; takes effect after the current iteration.
    ///
    /// # Errors
    /// Returns an error unless the engine is running.
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.send_command(CommandKind::Pause).await
    }

    /// Leave the paused state.
    ///
    /// # Errors
    /// Returns an error unless the engine is paused.
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.send_command(CommandKind::Resume).await
    }

    /// Wind the loop down; the in-flight agent is signalled.
    ///
    /// # Errors
    /// Returns an error unless the engine is running or paused.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.send_command(CommandKind::Stop).await
    }

    /// Signal the in-flight agent; the iteration is recorded as
    /// interrupted and the loop continues.
    ///
    /// # Errors
    /// Returns [`EngineError::NoActiveAgent`] if no agent is running.
    pub async fn interrupt(&self) -> Result<(), EngineError> {
        self.send_command(CommandKind::Interrupt).await
    }

    /// Re-read the tracker snapshot.
    ///
    /// # Errors
    /// Returns an error if the tracker cannot be read.
    pub async fn refresh_tasks(&self) -> Result<(), EngineError> {
        match self.send_command(CommandKind::RefreshTasks).await {
            Err(EngineError::InvalidState { .. }) => self.inner.refresh_tracker().await,
            other => other,
        }
    }

    /// Grow the iteration budget.
    ///
    /// # Errors
    /// Returns [`EngineError::BadArg`] when `count` is zero.
    pub async fn add_iterations(&self, count: u32) -> Result<(), EngineError> {
        if count == 0 {
            return Err(EngineError::BadArg("count must be positive".to_string()));
        }
        match self.send_command(CommandKind::AddIterations(count)).await {
            Err(EngineError::InvalidState { .. }) => {
                self.inner.apply_add_iterations(count)?;
                self.inner.persist_session();
                Ok(())
            }
            other => other,
        }
    }

    /// Shrink the iteration budget.
    ///
    /// # Errors
    /// Returns [`EngineError::WouldEndLoop`] when the result would
    /// fall below the current iteration, [`EngineError::BadArg`] when
    /// `count` is zero or the budget is unbounded.
    pub async fn remove_iterations(&self, count: u32) -> Result<(), EngineError> {
        if count == 0 {
            return Err(EngineError::BadArg("count must be positive".to_string()));
        }
        match self
            .send_command(CommandKind::RemoveIterations(count))
            .await
        {
            Err(EngineError::InvalidState { .. }) => {
                self.inner.apply_remove_iterations(count)?;
                self.inner.persist_session();
                Ok(())
            }
            other => other,
        }
    }

    /// Immutable snapshot of the engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.with_state(Clone::clone)
    }

    /// Snapshot of the persisted session.
    #[must_use]
    pub fn session(&self) -> PersistedSession {
        self.inner.with_session(|s| s.clone())
    }

    /// Subscribe to engine events.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Transcript of a finished iteration, if still retained.
    #[must_use]
    pub fn iteration_output(&self, iteration: u32) -> Option<IterationOutput> {
        self.inner.outputs.get(iteration)
    }

    /// Current task list from the tracker.
    ///
    /// # Errors
    /// Returns an error if the tracker cannot be read.
    pub async fn tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.inner.tracker.tasks().await?)
    }

    /// The task the loop would pick next and the prompt it would send.
    ///
    /// # Errors
    /// Returns an error if the tracker cannot be read.
    pub async fn prompt_preview(&self) -> Result<Option<(Task, String)>, EngineError> {
        let tasks = self.inner.tracker.tasks().await?;
        let skipped = self.inner.with_session(|s| s.skipped_task_ids.clone());
        let template = self
            .inner
            .config
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_PROMPT_TEMPLATE)
            .to_string();
        Ok(select_next_task(&tasks, &skipped).map(|task| {
            let prompt = render_prompt(&template, &task);
            (task, prompt)
        }))
    }

    /// Why the last loop ended, once one has.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .terminated
    }

    /// Persist the session and mark it interrupted, for host shutdown.
    pub fn mark_interrupted(&self) {
        self.inner.with_session(PersistedSession::mark_interrupted);
        self.inner.persist_session();
        self.inner.sync_registry();
    }

    async fn send_command(&self, kind: CommandKind) -> Result<(), EngineError> {
        let tx = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cmd_tx
            .clone();
        let Some(tx) = tx else {
            return Err(EngineError::InvalidState {
                op: kind.name(),
                status: self.inner.status(),
            });
        };

        let (command, reply) = Command::new(kind);
        if tx.send(command).await.is_err() {
            return Err(EngineError::InvalidState {
                op: kind.name(),
                status: self.inner.status(),
            });
        }
        reply.await.map_err(|_| EngineError::LoopGone)?
    }
}

/// Registry projection of a persisted session.
pub(crate) fn registry_entry(session: &PersistedSession) -> ralph_tui_session::RegistryEntry {
    ralph_tui_session::RegistryEntry {
        session_id: session.session_id,
        cwd: session.cwd.clone(),
        status: session.status,
        started_at: session.started_at,
        updated_at: session.updated_at,
        agent_plugin: session.agent_plugin.clone(),
        tracker_plugin: session.tracker_state.plugin.clone(),
        epic_id: session.tracker_state.epic_id.clone(),
        prd_path: session.tracker_state.prd_path.clone(),
        sandbox: None,
    }
}
