//! Wire protocol for the remote control plane.
//!
//! Bidirectional JSON messages over a single full-duplex connection.
//! Every message carries `{type, id, timestamp}`; responses echo the
//! request's `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use ralph_tui_core::{EngineEvent, EngineState, EngineStatus, Task};

/// Default TCP port of the remote control plane.
pub const DEFAULT_PORT: u16 = 7890;

/// Error codes sent in `error` messages and close frames.
pub mod error_codes {
    pub const UNKNOWN_MESSAGE: &str = "UNKNOWN_MESSAGE";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
    pub const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Which credential an `auth` message presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// The long-lived server token.
    Server,
    /// A short-lived per-connection token.
    Connection,
}

/// Config file scope for check/push operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigScope {
    /// `<home>/.config/ralph-tui/config.toml`
    Global,
    /// `<remote_cwd>/.ralph-tui/config.toml`
    Project,
}

/// Message payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Payload {
    Auth {
        token: String,
        token_type: TokenType,
    },
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TokenRefresh,
    TokenRefreshResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping,
    Pong,
    Error {
        code: String,
        message: String,
    },
    ServerStatus {
        engine_status: EngineStatus,
        uptime_seconds: u64,
        connections: u32,
    },
    Subscribe,
    Unsubscribe,
    EngineEvent {
        event: EngineEvent,
    },
    GetState,
    StateResponse {
        state: EngineState,
    },
    GetTasks,
    TasksResponse {
        tasks: Vec<Task>,
    },
    Pause,
    Resume,
    Interrupt,
    RefreshTasks,
    AddIterations {
        count: u32,
    },
    RemoveIterations {
        count: u32,
    },
    Continue,
    OperationResult {
        operation: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetPromptPreview,
    PromptPreviewResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<Task>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    GetIterationOutput {
        iteration: u32,
    },
    IterationOutputResponse {
        iteration: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
    CheckConfig,
    CheckConfigResponse {
        global_exists: bool,
        project_exists: bool,
        global_path: String,
        project_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        global_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_content: Option<String>,
        remote_cwd: String,
    },
    PushConfig {
        scope: ConfigScope,
        config_content: String,
        overwrite: bool,
    },
    PushConfigResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup_path: Option<String>,
        migration_triggered: bool,
        requires_restart: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Every known wire `type`, for unknown-message detection.
const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_response",
    "token_refresh",
    "token_refresh_response",
    "ping",
    "pong",
    "error",
    "server_status",
    "subscribe",
    "unsubscribe",
    "engine_event",
    "get_state",
    "state_response",
    "get_tasks",
    "tasks_response",
    "pause",
    "resume",
    "interrupt",
    "refresh_tasks",
    "add_iterations",
    "remove_iterations",
    "continue",
    "operation_result",
    "get_prompt_preview",
    "prompt_preview_response",
    "get_iteration_output",
    "iteration_output_response",
    "check_config",
    "check_config_response",
    "push_config",
    "push_config_response",
];

/// Parse failure for an incoming frame.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One protocol message: envelope plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    /// New message with a fresh id.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Response correlated to a request: echoes its `id`.
    #[must_use]
    pub fn reply_to(request_id: Uuid, payload: Payload) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Serialize to a single JSON frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a frame, distinguishing unknown types from malformed JSON.
    ///
    /// # Errors
    /// Returns [`ParseError::UnknownType`] for a well-formed message of
    /// a type this protocol does not define.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match serde_json::from_str::<Self>(text) {
            Ok(message) => Ok(message),
            Err(original) => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                    if let Some(t) = value.get("type").and_then(serde_json::Value::as_str) {
                        if !KNOWN_TYPES.contains(&t) {
                            return Err(ParseError::UnknownType(t.to_string()));
                        }
                    }
                }
                Err(ParseError::Malformed(original))
            }
        }
    }
}
