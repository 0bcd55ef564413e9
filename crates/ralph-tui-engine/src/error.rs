//! Engine error taxonomy.

use thiserror::Error;

use ralph_tui_core::{AgentError, EngineStatus, TrackerError};
use ralph_tui_session::{RegistryError, StoreError};

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine already running")]
    AlreadyRunning,
    #[error("Operation {op} invalid in state {status:?}")]
    InvalidState {
        op: &'static str,
        status: EngineStatus,
    },
    #[error("No active agent to interrupt")]
    NoActiveAgent,
    #[error("Bad argument: {0}")]
    BadArg(String),
    #[error("Removing {0} iterations would end the loop")]
    WouldEndLoop(u32),
    #[error("Engine loop has not terminated")]
    NotTerminated,
    #[error("Engine loop is gone")]
    LoopGone,
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}
