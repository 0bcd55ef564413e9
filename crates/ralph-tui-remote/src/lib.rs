//! Remote control plane for the ralph-tui engine.
//!
//! Provides:
//! - Wire protocol (`Message`, `Payload`) over WebSocket frames
//! - Token lifecycle (`TokenStore`): server token, connection tokens
//! - `RemoteServer` - auth, subscriptions, command dispatch
//! - `RemoteClient` - reconnect with backoff, heartbeat, token refresh
//! - Config check/push with backup

pub mod client;
pub mod config_push;
mod dispatch;
pub mod exit_codes;
pub mod protocol;
pub mod server;
pub mod token;

pub use client::{
    backoff_delay, ClientConfig, ClientError, ClientEvent, ConnectionState, RemoteClient,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, SILENT_RETRY_THRESHOLD,
};
pub use config_push::{check_config, push_config, ConfigPaths, ConfigPushError, PushOutcome};
pub use protocol::{error_codes, ConfigScope, Message, ParseError, Payload, TokenType, DEFAULT_PORT};
pub use server::{RemoteServer, ServerConfig, ServerError};
pub use token::{
    ConnectionToken, ServerToken, TokenError, TokenStore, CONNECTION_TOKEN_HOURS,
    REFRESH_THRESHOLD_HOURS, SERVER_TOKEN_DAYS,
};
