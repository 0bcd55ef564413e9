//! End-to-end tests of the iteration loop against scripted doubles.

use std::sync::Arc;
use std::time::Duration;

use ralph_tui_core::{EngineEvent, EngineStatus, IterationStatus, StopReason, Task, TaskStatus};
use ralph_tui_engine::testing::{MemoryTracker, ScriptedAgent, ScriptedRun};
use ralph_tui_engine::{BusEvent, Engine, EngineConfig, EngineError, ErrorPolicy, ErrorStrategy};
use ralph_tui_session::SessionStore;

const WAIT: Duration = Duration::from_secs(5);

fn two_tasks() -> Vec<Task> {
    vec![
        Task::new("a", "Task A").with_priority(2),
        Task::new("b", "Task B").with_priority(1),
    ]
}

fn build_engine(
    tasks: Vec<Task>,
    runs: Vec<ScriptedRun>,
    configure: impl FnOnce(EngineConfig) -> EngineConfig,
) -> (Engine, Arc<MemoryTracker>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let tracker = MemoryTracker::new(tasks);
    let agent = ScriptedAgent::new(runs, Arc::clone(&tracker));
    let config = configure(EngineConfig::new(dir.path().to_path_buf()));
    let engine = Engine::new(agent, Arc::clone(&tracker) as _, config);
    (engine, tracker, dir)
}

/// Drain events until the engine reports it stopped.
async fn wait_for_stop(sub: &mut ralph_tui_engine::EventSubscription) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        let item = tokio::time::timeout(WAIT, sub.next())
            .await
            .expect("timed out waiting for engine to stop")
            .expect("event bus closed before engine stopped");
        if let BusEvent::Event(event) = item {
            let stopped = matches!(event, EngineEvent::EngineStopped { .. });
            events.push(event);
            if stopped {
                return events;
            }
        }
    }
}

#[tokio::test]
async fn happy_path_completes_tasks_in_priority_order() {
    let (engine, tracker, dir) = build_engine(
        two_tasks(),
        vec![ScriptedRun::success(), ScriptedRun::success()],
        |c| c,
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();
    wait_for_stop(&mut sub).await;

    let state = engine.state();
    assert_eq!(state.status, EngineStatus::Idle);
    assert_eq!(state.iterations.len(), 2);
    assert_eq!(state.tasks_completed, 2);
    assert_eq!(state.iterations[0].task.id, "a");
    assert_eq!(state.iterations[1].task.id, "b");
    assert!(state.iterations.iter().all(|r| r.task_completed));
    assert_eq!(engine.stop_reason(), Some(StopReason::NoTasks));

    let statuses = tracker.statuses();
    assert_eq!(statuses["a"], TaskStatus::Completed);
    assert_eq!(statuses["b"], TaskStatus::Completed);

    // Session persisted with matching counters.
    let store = SessionStore::new();
    let session = store.load(dir.path()).unwrap().unwrap();
    assert_eq!(session.iterations.len() as u32, session.current_iteration);
    assert_eq!(session.tasks_completed, 2);
    assert!(session.updated_at >= session.started_at);
    assert_eq!(session.status, ralph_tui_session::SessionStatus::Completed);
    assert_eq!(session, engine.session());
}

#[tokio::test]
async fn pause_takes_effect_between_iterations() {
    let (engine, _tracker, _dir) = build_engine(
        two_tasks(),
        vec![
            ScriptedRun::success().lasting(Duration::from_millis(300)),
            ScriptedRun::success(),
        ],
        |c| c,
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();

    // Wait until iteration 1 is in flight, then request the pause.
    loop {
        match tokio::time::timeout(WAIT, sub.next()).await.unwrap().unwrap() {
            BusEvent::Event(EngineEvent::IterationStarted { iteration: 1, .. }) => break,
            _ => {}
        }
    }
    engine.pause().await.unwrap();

    // The in-flight iteration still completes, then the engine pauses.
    let mut saw_completed = false;
    loop {
        match tokio::time::timeout(WAIT, sub.next()).await.unwrap().unwrap() {
            BusEvent::Event(EngineEvent::IterationCompleted { result }) => {
                assert_eq!(result.iteration, 1);
                saw_completed = true;
            }
            BusEvent::Event(EngineEvent::EnginePaused) => {
                assert!(saw_completed, "engine:paused must follow iteration:completed");
                break;
            }
            BusEvent::Event(EngineEvent::IterationStarted { iteration, .. }) => {
                panic!("iteration {iteration} started while pausing");
            }
            _ => {}
        }
    }
    assert_eq!(engine.state().status, EngineStatus::Paused);

    engine.resume().await.unwrap();
    let events = wait_for_stop(&mut sub).await;
    assert!(events.contains(&EngineEvent::EngineResumed));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::IterationStarted { iteration: 2, .. })));
    assert_eq!(engine.state().tasks_completed, 2);
}

#[tokio::test]
async fn skip_policy_takes_failed_task_out_of_rotation() {
    let (engine, tracker, _dir) = build_engine(
        two_tasks(),
        vec![ScriptedRun::failure(1), ScriptedRun::success()],
        |c| {
            c.with_error_policy(ErrorPolicy {
                strategy: ErrorStrategy::Skip,
                max_retries: 3,
            })
        },
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();
    let events = wait_for_stop(&mut sub).await;

    let state = engine.state();
    assert_eq!(state.iterations.len(), 2);
    assert_eq!(state.iterations[0].status, IterationStatus::Failed);
    assert_eq!(state.iterations[0].task.id, "a");
    assert_eq!(
        state.iterations[0].error.as_deref(),
        Some("agent exited with code 1")
    );
    assert_eq!(state.iterations[1].status, IterationStatus::Completed);
    assert_eq!(state.iterations[1].task.id, "b");

    assert_eq!(engine.session().skipped_task_ids, vec!["a"]);
    assert_eq!(tracker.statuses()["a"], TaskStatus::Failed);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::IterationFailed { result } if result.iteration == 1)));
}

#[tokio::test]
async fn retry_policy_gives_up_after_max_consecutive_failures() {
    let (engine, _tracker, _dir) = build_engine(
        two_tasks(),
        vec![
            ScriptedRun::failure(1),
            ScriptedRun::failure(1),
            ScriptedRun::success(),
        ],
        |c| {
            c.with_error_policy(ErrorPolicy {
                strategy: ErrorStrategy::Retry,
                max_retries: 2,
            })
        },
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();
    wait_for_stop(&mut sub).await;

    let state = engine.state();
    assert_eq!(state.iterations.len(), 3);
    assert_eq!(state.iterations[0].task.id, "a");
    assert_eq!(state.iterations[1].task.id, "a");
    assert_eq!(state.iterations[2].task.id, "b");
    assert_eq!(engine.session().skipped_task_ids, vec!["a"]);
}

#[tokio::test]
async fn abort_policy_terminates_with_error() {
    let (engine, _tracker, dir) = build_engine(two_tasks(), vec![ScriptedRun::failure(2)], |c| {
        c.with_error_policy(ErrorPolicy {
            strategy: ErrorStrategy::Abort,
            max_retries: 3,
        })
    });
    let mut sub = engine.subscribe();
    engine.start().unwrap();
    wait_for_stop(&mut sub).await;

    assert_eq!(engine.stop_reason(), Some(StopReason::Error));
    let store = SessionStore::new();
    let session = store.load(dir.path()).unwrap().unwrap();
    assert_eq!(session.status, ralph_tui_session::SessionStatus::Failed);
}

#[tokio::test]
async fn continue_extends_a_terminated_run() {
    let (engine, _tracker, _dir) = build_engine(
        two_tasks(),
        vec![ScriptedRun::success(), ScriptedRun::success()],
        |c| c.with_max_iterations(1),
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();
    wait_for_stop(&mut sub).await;

    assert_eq!(engine.stop_reason(), Some(StopReason::MaxIterations));
    assert_eq!(engine.state().iterations.len(), 1);

    engine.add_iterations(1).await.unwrap();
    assert_eq!(engine.state().max_iterations, 2);

    let mut sub = engine.subscribe();
    engine.continue_run().unwrap();
    wait_for_stop(&mut sub).await;

    let state = engine.state();
    assert_eq!(state.iterations.len(), 2);
    assert_eq!(state.tasks_completed, 2);
    assert_eq!(engine.stop_reason(), Some(StopReason::NoTasks));
}

#[tokio::test]
async fn continue_requires_a_terminated_loop() {
    let (engine, _tracker, _dir) = build_engine(two_tasks(), vec![], |c| c);
    assert!(matches!(
        engine.continue_run(),
        Err(EngineError::NotTerminated)
    ));
}

#[tokio::test]
async fn control_operations_require_a_live_loop() {
    let (engine, _tracker, _dir) = build_engine(two_tasks(), vec![], |c| c);
    assert!(matches!(
        engine.pause().await,
        Err(EngineError::InvalidState { op: "pause", .. })
    ));
    assert!(matches!(
        engine.stop().await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn start_twice_reports_already_running() {
    let (engine, _tracker, _dir) = build_engine(
        two_tasks(),
        vec![
            ScriptedRun::success().lasting(Duration::from_millis(500)),
            ScriptedRun::success(),
        ],
        |c| c,
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
    wait_for_stop(&mut sub).await;
}

#[tokio::test]
async fn interrupt_records_iteration_and_loop_goes_on() {
    let (engine, _tracker, _dir) = build_engine(
        vec![Task::new("a", "Task A")],
        vec![
            ScriptedRun::success().lasting(Duration::from_secs(30)),
            ScriptedRun::success(),
        ],
        |c| c,
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();

    loop {
        match tokio::time::timeout(WAIT, sub.next()).await.unwrap().unwrap() {
            BusEvent::Event(EngineEvent::IterationStarted { iteration: 1, .. }) => break,
            _ => {}
        }
    }
    engine.interrupt().await.unwrap();
    wait_for_stop(&mut sub).await;

    let state = engine.state();
    assert_eq!(state.iterations[0].status, IterationStatus::Interrupted);
    assert!(!state.iterations[0].task_completed);
    // The same task ran again and completed on the second pass.
    assert_eq!(state.iterations[1].task.id, "a");
    assert_eq!(state.iterations[1].status, IterationStatus::Completed);
    assert_eq!(state.tasks_completed, 1);
}

#[tokio::test]
async fn stop_interrupts_agent_and_ends_loop() {
    let (engine, _tracker, dir) = build_engine(
        two_tasks(),
        vec![ScriptedRun::success().lasting(Duration::from_secs(30))],
        |c| c,
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();

    loop {
        match tokio::time::timeout(WAIT, sub.next()).await.unwrap().unwrap() {
            BusEvent::Event(EngineEvent::IterationStarted { .. }) => break,
            _ => {}
        }
    }
    engine.stop().await.unwrap();
    wait_for_stop(&mut sub).await;

    let state = engine.state();
    assert_eq!(state.status, EngineStatus::Idle);
    assert_eq!(state.iterations.len(), 1);
    assert_eq!(state.iterations[0].status, IterationStatus::Interrupted);
    assert_eq!(engine.stop_reason(), Some(StopReason::Stopped));

    let store = SessionStore::new();
    let session = store.load(dir.path()).unwrap().unwrap();
    assert!(session.is_resumable());
}

#[tokio::test]
async fn iteration_budget_arguments_are_validated() {
    let (engine, _tracker, _dir) = build_engine(two_tasks(), vec![], |c| c.with_max_iterations(3));

    assert!(matches!(
        engine.add_iterations(0).await,
        Err(EngineError::BadArg(_))
    ));
    assert!(matches!(
        engine.remove_iterations(5).await,
        Err(EngineError::WouldEndLoop(5))
    ));

    engine.remove_iterations(1).await.unwrap();
    assert_eq!(engine.state().max_iterations, 2);
}

#[tokio::test]
async fn agent_output_is_captured_and_addressable() {
    let (engine, _tracker, _dir) = build_engine(
        vec![Task::new("a", "Task A")],
        vec![ScriptedRun {
            stdout: vec!["hello ".to_string(), "world\n".to_string()],
            stderr: vec!["careful\n".to_string()],
            exit_code: 0,
            completes_task: true,
            duration: Duration::ZERO,
        }],
        |c| c,
    );
    let mut sub = engine.subscribe();
    engine.start().unwrap();
    let events = wait_for_stop(&mut sub).await;

    let output = engine.iteration_output(1).unwrap();
    assert_eq!(output.output, "hello world\n");
    assert_eq!(output.stderr, "careful\n");

    let chunks: Vec<&EngineEvent> = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::AgentOutput { .. }))
        .collect();
    assert_eq!(chunks.len(), 3);
}

#[tokio::test]
async fn prompt_preview_shows_next_prompt_without_running() {
    let (engine, _tracker, _dir) = build_engine(
        vec![Task::new("a", "Fix the build").with_description("cargo check fails")],
        vec![],
        |c| c,
    );
    let (task, prompt) = engine.prompt_preview().await.unwrap().unwrap();
    assert_eq!(task.id, "a");
    assert!(prompt.contains("Fix the build"));
    assert!(prompt.contains("cargo check fails"));
    assert_eq!(engine.state().status, EngineStatus::Idle);
}

#[tokio::test]
async fn refresh_tasks_reaches_the_tracker_when_idle() {
    let (engine, tracker, _dir) = build_engine(two_tasks(), vec![], |c| c);
    engine.refresh_tasks().await.unwrap();
    assert_eq!(tracker.refreshes(), 1);
    assert_eq!(engine.state().total_tasks, 2);
}
