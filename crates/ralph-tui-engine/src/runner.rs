//! The iteration loop.
//!
//! Runs on a dedicated task. Control commands are consumed at two safe
//! points: between iterations, and while waiting on agent events via a
//! select over the agent channel and the command inbox.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use ralph_tui_core::{
    AgentEnd, AgentEvent, EngineEvent, EngineStatus, ExecuteRequest, IterationResult,
    IterationStatus, OutputStream, StopReason, Task, TaskStatus,
};

use crate::command::{Command, CommandKind};
use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::output::IterationOutput;
use crate::policy::{FailureTracker, PolicyDecision};
use crate::prompt::{render_prompt, DEFAULT_PROMPT_TEMPLATE};

/// Pick the next task: highest priority among pending, not skipped,
/// ties broken by id.
#[must_use]
pub fn select_next_task(tasks: &[Task], skipped: &[String]) -> Option<Task> {
    tasks
        .iter()
        .filter(|t| t.status.is_pending() && !skipped.iter().any(|s| s == &t.id))
        .max_by(|a, b| {
            let pa = a.priority.unwrap_or(i64::MIN);
            let pb = b.priority.unwrap_or(i64::MIN);
            pa.cmp(&pb).then_with(|| b.id.cmp(&a.id))
        })
        .cloned()
}

enum IterationFlow {
    Continue,
    Stop(StopReason),
}

enum ParkOutcome {
    Resumed,
    Stop(StopReason),
}

pub(crate) async fn run_loop(inner: Arc<EngineInner>, mut cmd_rx: mpsc::Receiver<Command>) {
    on_loop_start(&inner).await;
    let mut failures = FailureTracker::new();
    let reason = drive(&inner, &mut cmd_rx, &mut failures).await;
    on_loop_end(&inner, reason);
}

async fn on_loop_start(inner: &Arc<EngineInner>) {
    match inner.tracker.tasks().await {
        Ok(tasks) => inner.update_task_totals(&tasks),
        Err(e) => tracing::warn!("failed to read tracker at startup: {e}"),
    }
    inner.with_session(|s| {
        if s.is_paused || s.status != ralph_tui_session::SessionStatus::Running {
            s.resume();
        }
    });
    inner.persist_session();
    if let Some(registry) = &inner.registry {
        let entry = inner.with_session(|s| crate::engine::registry_entry(s));
        if let Err(e) = registry.register(entry) {
            tracing::warn!("failed to register session: {e}");
        }
    }
    inner.events.emit(EngineEvent::EngineStarted);
}

fn on_loop_end(inner: &Arc<EngineInner>, reason: StopReason) {
    inner.with_session(|s| match reason {
        StopReason::NoTasks => s.complete(),
        StopReason::Error => s.fail(),
        StopReason::MaxIterations | StopReason::Stopped => s.mark_interrupted(),
    });
    inner.persist_session();
    inner.sync_registry();
    inner.with_state_mut(|s| {
        s.status = EngineStatus::Idle;
        s.current_task = None;
        s.active_agent = None;
    });
    {
        let mut lifecycle = inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lifecycle.cmd_tx = None;
        lifecycle.terminated = Some(reason);
    }
    tracing::info!(?reason, "engine loop terminated");
    inner.events.emit(EngineEvent::EngineStopped { reason });
}

async fn drive(
    inner: &Arc<EngineInner>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    failures: &mut FailureTracker,
) -> StopReason {
    loop {
        // Safe point: apply every control message that arrived since
        // the last iteration.
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => {
                    if let Some(reason) = handle_idle_command(inner, cmd).await {
                        return reason;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return StopReason::Stopped,
            }
        }

        if inner.status() == EngineStatus::Paused {
            match park(inner, cmd_rx).await {
                ParkOutcome::Resumed => continue,
                ParkOutcome::Stop(reason) => return reason,
            }
        }

        let tasks = match inner.tracker.tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("tracker read failed, aborting loop: {e}");
                return StopReason::Error;
            }
        };
        inner.update_task_totals(&tasks);
        let skipped = inner.with_session(|s| s.skipped_task_ids.clone());
        let Some(task) = select_next_task(&tasks, &skipped) else {
            return StopReason::NoTasks;
        };

        if !inner.with_state(|s| s.within_budget()) {
            return StopReason::MaxIterations;
        }

        match run_iteration(inner, cmd_rx, failures, task).await {
            IterationFlow::Continue => {}
            IterationFlow::Stop(reason) => return reason,
        }

        let delay = inner.config.iteration_delay;
        if !delay.is_zero() && inner.status() == EngineStatus::Running {
            let deadline = tokio::time::Instant::now() + delay;
            loop {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => {
                            if let Some(reason) = handle_idle_command(inner, cmd).await {
                                return reason;
                            }
                            if inner.status() == EngineStatus::Paused {
                                break;
                            }
                        }
                        None => return StopReason::Stopped,
                    }
                }
            }
        }
    }
}

/// Handle a command while no agent is in flight and the loop is not
/// parked. Returns a stop reason when the loop must end.
async fn handle_idle_command(inner: &Arc<EngineInner>, mut cmd: Command) -> Option<StopReason> {
    match cmd.kind {
        CommandKind::Pause => {
            if inner.status() == EngineStatus::Running {
                enter_pause(inner);
                cmd.reply(Ok(()));
            } else {
                cmd.reply(Err(EngineError::InvalidState {
                    op: "pause",
                    status: inner.status(),
                }));
            }
            None
        }
        CommandKind::Resume => {
            cmd.reply(Err(EngineError::InvalidState {
                op: "resume",
                status: inner.status(),
            }));
            None
        }
        CommandKind::Stop => {
            inner.set_status(EngineStatus::Stopping);
            cmd.reply(Ok(()));
            Some(StopReason::Stopped)
        }
        CommandKind::Interrupt => {
            cmd.reply(Err(EngineError::NoActiveAgent));
            None
        }
        CommandKind::AddIterations(n) => {
            cmd.reply(inner.apply_add_iterations(n));
            None
        }
        CommandKind::RemoveIterations(n) => {
            cmd.reply(inner.apply_remove_iterations(n));
            None
        }
        CommandKind::RefreshTasks => {
            cmd.reply(inner.refresh_tracker().await);
            None
        }
    }
}

fn enter_pause(inner: &Arc<EngineInner>) {
    inner.set_status(EngineStatus::Paused);
    inner.with_session(ralph_tui_session::PersistedSession::pause);
    inner.persist_session();
    inner.sync_registry();
    inner.events.emit(EngineEvent::EnginePaused);
}

fn leave_pause(inner: &Arc<EngineInner>) {
    inner.set_status(EngineStatus::Running);
    inner.with_session(ralph_tui_session::PersistedSession::resume);
    inner.persist_session();
    inner.sync_registry();
    inner.events.emit(EngineEvent::EngineResumed);
}

/// Block on the inbox until resume or stop while parked.
async fn park(inner: &Arc<EngineInner>, cmd_rx: &mut mpsc::Receiver<Command>) -> ParkOutcome {
    loop {
        let Some(mut cmd) = cmd_rx.recv().await else {
            return ParkOutcome::Stop(StopReason::Stopped);
        };
        match cmd.kind {
            CommandKind::Resume => {
                leave_pause(inner);
                cmd.reply(Ok(()));
                return ParkOutcome::Resumed;
            }
            CommandKind::Stop => {
                inner.set_status(EngineStatus::Stopping);
                cmd.reply(Ok(()));
                return ParkOutcome::Stop(StopReason::Stopped);
            }
            CommandKind::Pause => cmd.reply(Err(EngineError::InvalidState {
                op: "pause",
                status: EngineStatus::Paused,
            })),
            CommandKind::Interrupt => cmd.reply(Err(EngineError::NoActiveAgent)),
            CommandKind::AddIterations(n) => cmd.reply(inner.apply_add_iterations(n)),
            CommandKind::RemoveIterations(n) => cmd.reply(inner.apply_remove_iterations(n)),
            CommandKind::RefreshTasks => cmd.reply(inner.refresh_tracker().await),
        }
    }
}

async fn run_iteration(
    inner: &Arc<EngineInner>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    failures: &mut FailureTracker,
    task: Task,
) -> IterationFlow {
    let agent_id = inner.agent.id().to_string();
    let iteration = inner.with_state_mut(|s| {
        s.current_iteration += 1;
        s.current_task = Some(task.clone());
        s.current_output.clear();
        s.current_stderr.clear();
        s.active_agent = Some(agent_id);
        s.current_iteration
    });

    inner.events.emit(EngineEvent::TaskSelected { task: task.clone() });
    inner.events.emit(EngineEvent::IterationStarted {
        iteration,
        task: task.clone(),
    });

    if let Err(e) = inner
        .tracker
        .update_status(&task.id, TaskStatus::InProgress)
        .await
    {
        tracing::warn!(task = %task.id, "failed to mark task in progress: {e}");
    }

    let template = inner
        .config
        .prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_PROMPT_TEMPLATE);
    let request = ExecuteRequest {
        prompt: render_prompt(template, &task),
        task: task.clone(),
        iteration,
        cwd: inner.config.cwd.clone(),
        model: inner.config.model.clone(),
    };

    let started_at = Utc::now();
    let started = Instant::now();
    let mut pending_pause = false;
    let mut stopping = false;
    let mut user_interrupted = false;

    let outcome: Result<AgentEnd, String> = match inner.agent.execute(request).await {
        Err(e) => Err(e.to_string()),
        Ok(mut handle) => {
            let mut inbox_open = true;
            let end = loop {
                tokio::select! {
                    event = handle.next_event() => match event {
                        Some(AgentEvent::Stdout(data)) => {
                            inner.append_output(OutputStream::Stdout, &data);
                        }
                        Some(AgentEvent::Stderr(data)) => {
                            inner.append_output(OutputStream::Stderr, &data);
                        }
                        Some(AgentEvent::Jsonl(msg)) => {
                            tracing::debug!(iteration, %msg, "agent jsonl message");
                        }
                        Some(AgentEvent::End(end)) => break end,
                        // Adapter went away without a terminal event.
                        None => break AgentEnd { exit_code: None, interrupted: false },
                    },
                    cmd = cmd_rx.recv(), if inbox_open => match cmd {
                        Some(mut cmd) => match cmd.kind {
                            CommandKind::Pause => {
                                if stopping {
                                    cmd.reply(Err(EngineError::InvalidState {
                                        op: "pause",
                                        status: EngineStatus::Stopping,
                                    }));
                                } else {
                                    pending_pause = true;
                                    cmd.reply(Ok(()));
                                }
                            }
                            CommandKind::Resume => {
                                if pending_pause {
                                    // Cancels a pause that has not taken effect yet.
                                    pending_pause = false;
                                    cmd.reply(Ok(()));
                                } else {
                                    cmd.reply(Err(EngineError::InvalidState {
                                        op: "resume",
                                        status: inner.status(),
                                    }));
                                }
                            }
                            CommandKind::Stop => {
                                if stopping {
                                    cmd.reply(Err(EngineError::InvalidState {
                                        op: "stop",
                                        status: EngineStatus::Stopping,
                                    }));
                                } else {
                                    stopping = true;
                                    inner.set_status(EngineStatus::Stopping);
                                    handle.interrupt();
                                    cmd.reply(Ok(()));
                                }
                            }
                            CommandKind::Interrupt => {
                                if stopping {
                                    cmd.reply(Err(EngineError::InvalidState {
                                        op: "interrupt",
                                        status: EngineStatus::Stopping,
                                    }));
                                } else {
                                    user_interrupted = true;
                                    handle.interrupt();
                                    cmd.reply(Ok(()));
                                }
                            }
                            CommandKind::AddIterations(n) => {
                                cmd.reply(inner.apply_add_iterations(n));
                            }
                            CommandKind::RemoveIterations(n) => {
                                cmd.reply(inner.apply_remove_iterations(n));
                            }
                            CommandKind::RefreshTasks => {
                                cmd.reply(inner.refresh_tracker().await);
                            }
                        },
                        None => {
                            // Engine handle dropped; wind down.
                            inbox_open = false;
                            stopping = true;
                            handle.interrupt();
                        }
                    }
                }
            };
            Ok(end)
        }
    };

    let ended_at = Utc::now();
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (status, error, task_completed) = match outcome {
        Err(spawn_error) => (IterationStatus::Failed, Some(spawn_error), false),
        Ok(end) if end.interrupted || user_interrupted || (stopping && !end.success()) => {
            (IterationStatus::Interrupted, None, false)
        }
        Ok(end) if end.success() => {
            let completed = matches!(
                inner.tracker.task(&task.id).await,
                Ok(Some(t)) if t.status == TaskStatus::Completed
            );
            (IterationStatus::Completed, None, completed)
        }
        Ok(end) => {
            let error = match end.exit_code {
                Some(code) => format!("agent exited with code {code}"),
                None => "agent terminated without an exit code".to_string(),
            };
            (IterationStatus::Failed, Some(error), false)
        }
    };

    let result = IterationResult {
        iteration,
        status,
        task: task.clone(),
        task_completed,
        duration_ms,
        error,
        started_at,
        ended_at,
    };

    // Settle the tracker-side status before recording.
    match status {
        IterationStatus::Completed if task_completed => {
            if let Err(e) = inner
                .tracker
                .update_status(&task.id, TaskStatus::Completed)
                .await
            {
                tracing::warn!(task = %task.id, "failed to mark task completed: {e}");
            }
            failures.on_success(&task.id);
            inner.events.emit(EngineEvent::TaskCompleted { task: task.clone() });
        }
        IterationStatus::Completed | IterationStatus::Interrupted => {
            // Task stays eligible for another pass.
            if let Err(e) = inner
                .tracker
                .update_status(&task.id, TaskStatus::Pending)
                .await
            {
                tracing::warn!(task = %task.id, "failed to reset task status: {e}");
            }
            if status == IterationStatus::Completed {
                failures.on_success(&task.id);
            }
        }
        IterationStatus::Failed | IterationStatus::Skipped => {}
    }

    let (output_text, stderr_text) = inner.with_state_mut(|s| {
        s.iterations.push(result.clone());
        if task_completed {
            s.tasks_completed += 1;
        }
        s.current_task = None;
        s.active_agent = None;
        (s.current_output.clone(), s.current_stderr.clone())
    });
    inner.outputs.record(IterationOutput {
        iteration,
        output: output_text,
        stderr: stderr_text,
    });
    inner.with_session(|s| s.update_after_iteration(result.clone()));
    inner.persist_session();
    inner.sync_registry();

    if result.status == IterationStatus::Failed {
        inner
            .events
            .emit(EngineEvent::IterationFailed { result: result.clone() });
    } else {
        inner
            .events
            .emit(EngineEvent::IterationCompleted { result: result.clone() });
    }

    if result.status == IterationStatus::Failed {
        match failures.on_failure(inner.config.error_policy, &task.id) {
            PolicyDecision::Abort => return IterationFlow::Stop(StopReason::Error),
            PolicyDecision::SkipTask => {
                tracing::info!(task = %task.id, "skipping task after failure");
                inner.with_session(|s| s.add_skipped_task(&task.id));
                if let Err(e) = inner
                    .tracker
                    .update_status(&task.id, TaskStatus::Failed)
                    .await
                {
                    tracing::warn!(task = %task.id, "failed to mark task failed: {e}");
                }
                inner.persist_session();
            }
            PolicyDecision::RetryTask | PolicyDecision::ContinueLoop => {
                if let Err(e) = inner
                    .tracker
                    .update_status(&task.id, TaskStatus::Pending)
                    .await
                {
                    tracing::warn!(task = %task.id, "failed to reset task status: {e}");
                }
            }
        }
    }

    if stopping {
        return IterationFlow::Stop(StopReason::Stopped);
    }
    if pending_pause {
        enter_pause(inner);
    }
    IterationFlow::Continue
}
