//! Engine events fanned out to subscribers.

use serde::{Deserialize, Serialize};

use crate::iteration::IterationResult;
use crate::state::StopReason;
use crate::task::Task;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One engine event.
///
/// Events are emitted synchronously from the iteration loop and fanned
/// out to every subscriber; the wire encoding uses the colon-separated
/// names the UI and remote clients key on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    #[serde(rename = "engine:started")]
    EngineStarted,
    #[serde(rename = "engine:stopped")]
    EngineStopped { reason: StopReason },
    #[serde(rename = "engine:paused")]
    EnginePaused,
    #[serde(rename = "engine:resumed")]
    EngineResumed,
    #[serde(rename = "iteration:started")]
    IterationStarted { iteration: u32, task: Task },
    #[serde(rename = "iteration:completed")]
    IterationCompleted { result: IterationResult },
    #[serde(rename = "iteration:failed")]
    IterationFailed { result: IterationResult },
    #[serde(rename = "task:selected")]
    TaskSelected { task: Task },
    #[serde(rename = "task:completed")]
    TaskCompleted { task: Task },
    #[serde(rename = "agent:output")]
    AgentOutput { stream: OutputStream, data: String },
}

impl EngineEvent {
    /// The wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EngineStarted => "engine:started",
            Self::EngineStopped { .. } => "engine:stopped",
            Self::EnginePaused => "engine:paused",
            Self::EngineResumed => "engine:resumed",
            Self::IterationStarted { .. } => "iteration:started",
            Self::IterationCompleted { .. } => "iteration:completed",
            Self::IterationFailed { .. } => "iteration:failed",
            Self::TaskSelected { .. } => "task:selected",
            Self::TaskCompleted { .. } => "task:completed",
            Self::AgentOutput { .. } => "agent:output",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_use_colons_on_the_wire() {
        let event = EngineEvent::IterationStarted {
            iteration: 3,
            task: Task::new("a", "A"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"iteration:started\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn output_event_roundtrip() {
        let event = EngineEvent::AgentOutput {
            stream: OutputStream::Stderr,
            data: "warning: unused import".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"stream\":\"stderr\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
