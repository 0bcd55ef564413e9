//! Control commands posted to the iteration loop.
//!
//! Shared-memory flags are replaced by message passing: every control
//! operation becomes a [`Command`] pushed into a single inbox, and the
//! loop picks them up at its safe points (between iterations, or while
//! waiting on agent events).

use tokio::sync::oneshot;

use crate::error::EngineError;

/// The operation being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Park after the current iteration finishes.
    Pause,
    /// Leave the parked state.
    Resume,
    /// Wind the loop down; signals the in-flight agent.
    Stop,
    /// Signal the in-flight agent only.
    Interrupt,
    /// Grow the iteration budget.
    AddIterations(u32),
    /// Shrink the iteration budget.
    RemoveIterations(u32),
    /// Re-read the tracker snapshot.
    RefreshTasks,
}

impl CommandKind {
    /// Operation name used in errors and `operation_result` payloads.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Interrupt => "interrupt",
            Self::AddIterations(_) => "add_iterations",
            Self::RemoveIterations(_) => "remove_iterations",
            Self::RefreshTasks => "refresh_tasks",
        }
    }
}

/// A control request plus its reply slot.
#[derive(Debug)]
pub struct Command {
    pub kind: CommandKind,
    reply: Option<oneshot::Sender<Result<(), EngineError>>>,
}

impl Command {
    /// Create a command with a reply channel.
    #[must_use]
    pub fn new(kind: CommandKind) -> (Self, oneshot::Receiver<Result<(), EngineError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Answer the caller. Safe to call once; later calls are no-ops.
    pub fn reply(&mut self, result: Result<(), EngineError>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        // A command dropped unanswered means the loop wound down first.
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(EngineError::LoopGone));
        }
    }
}
