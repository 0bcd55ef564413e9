//! Server and connection token lifecycle.
//!
//! The server token is a long-lived shared secret distributed to
//! operators out of band; connection tokens are short-lived
//! credentials minted per successful auth. All comparisons are
//! constant-time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use ralph_tui_session::store::write_atomic;

use crate::protocol::TokenType;

/// Server token lifetime.
pub const SERVER_TOKEN_DAYS: i64 = 90;
/// Connection token lifetime.
pub const CONNECTION_TOKEN_HOURS: i64 = 24;
/// Refresh a connection token when less than this remains.
pub const REFRESH_THRESHOLD_HOURS: i64 = 1;

/// File name of the persisted server token, next to the registry.
pub const TOKEN_FILE_NAME: &str = "server-token.json";

/// Token error.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The long-lived server credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ServerToken {
    fn generate() -> Self {
        let now = Utc::now();
        Self {
            token: Uuid::new_v4().to_string(),
            issued_at: now,
            expires_at: now + Duration::days(SERVER_TOKEN_DAYS),
        }
    }

    /// Whether the token is still valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// A short-lived per-connection credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

fn tokens_equal(a: &str, b: &str) -> bool {
    // ct_eq requires equal lengths; a length mismatch is already a
    // mismatch and leaks nothing useful about the token value.
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Holds the server token and all live connection tokens.
#[derive(Debug)]
pub struct TokenStore {
    path: Option<PathBuf>,
    server: Mutex<ServerToken>,
    connections: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TokenStore {
    /// Load the persisted server token, generating one at first launch.
    ///
    /// # Errors
    /// Returns error if the token file cannot be read or written.
    pub fn load_or_generate(path: PathBuf) -> Result<Self, TokenError> {
        let server = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let token = ServerToken::generate();
                persist(&path, &token)?;
                tracing::info!(path = %path.display(), "generated new server token");
                token
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            server: Mutex::new(server),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            server: Mutex::new(ServerToken::generate()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Current server token.
    #[must_use]
    pub fn server_token(&self) -> ServerToken {
        self.server.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Regenerate the server token (`--rotate-token`).
    ///
    /// Outstanding connection tokens stay valid until they expire.
    ///
    /// # Errors
    /// Returns error if the new token cannot be persisted.
    pub fn rotate_server_token(&self) -> Result<ServerToken, TokenError> {
        let token = ServerToken::generate();
        if let Some(path) = &self.path {
            persist(path, &token)?;
        }
        *self.server.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        tracing::info!("rotated server token");
        Ok(token)
    }

    /// Verify a presented credential.
    #[must_use]
    pub fn verify(&self, token: &str, token_type: TokenType) -> bool {
        match token_type {
            TokenType::Server => {
                let server = self.server.lock().unwrap_or_else(|e| e.into_inner());
                server.is_valid() && tokens_equal(token, &server.token)
            }
            TokenType::Connection => {
                let now = Utc::now();
                let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
                connections
                    .iter()
                    .any(|(candidate, expires)| *expires > now && tokens_equal(token, candidate))
            }
        }
    }

    /// Mint a connection token valid for [`CONNECTION_TOKEN_HOURS`].
    #[must_use]
    pub fn issue_connection_token(&self) -> ConnectionToken {
        let token = ConnectionToken {
            token: Uuid::new_v4().to_string(),
            expires_at: Utc::now() + Duration::hours(CONNECTION_TOKEN_HOURS),
        };
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        connections.retain(|_, expires| *expires > now);
        connections.insert(token.token.clone(), token.expires_at);
        token
    }

    /// Rotate a live connection token. Returns `None` when the
    /// presented token is unknown or expired.
    #[must_use]
    pub fn refresh_connection_token(&self, current: &str) -> Option<ConnectionToken> {
        if !self.verify(current, TokenType::Connection) {
            return None;
        }
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(current);
        Some(self.issue_connection_token())
    }
}

fn persist(path: &Path, token: &ServerToken) -> Result<(), TokenError> {
    let json = serde_json::to_string_pretty(token)?;
    write_atomic(path, json.as_bytes())?;
    Ok(())
}
