//! Global index of sessions across working directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionStatus;
use crate::store::write_atomic;

/// On-disk schema version of the registry file.
pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

/// File name of the registry under the ralph-tui config directory.
pub const REGISTRY_FILE_NAME: &str = "sessions.json";

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No config directory available")]
    NoConfigDir,
}

/// One session known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub session_id: Uuid,
    /// Absolute working directory of the session.
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agent_plugin: String,
    pub tracker_plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<bool>,
}

/// Filter for [`SessionRegistry::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFilter {
    /// Only sessions that can be picked back up.
    Resumable,
    /// Every known session.
    All,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryFile {
    version: u32,
    sessions: HashMap<String, RegistryEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_SCHEMA_VERSION,
            sessions: HashMap::new(),
        }
    }
}

/// Global session index, one JSON file keyed by session id.
///
/// Read-modify-write cycles serialize through an in-process mutex and
/// land via atomic rename, so concurrent registrations cannot corrupt
/// the file and are all reflected in the final contents.
#[derive(Debug)]
pub struct SessionRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionRegistry {
    /// Registry at an explicit path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Registry at `<config_home>/ralph-tui/sessions.json`.
    ///
    /// # Errors
    /// Returns error if no config directory can be determined.
    pub fn open_default() -> Result<Self, RegistryError> {
        let base = dirs::config_dir().ok_or(RegistryError::NoConfigDir)?;
        Ok(Self::new(base.join("ralph-tui").join(REGISTRY_FILE_NAME)))
    }

    /// The registry file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace an entry by session id.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read or written.
    pub fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read_file()?;
        file.sessions.insert(entry.session_id.to_string(), entry);
        self.write_file(&file)
    }

    /// Update the status of an entry. Silent no-op when absent.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read or written.
    pub fn update_status(&self, id: Uuid, status: SessionStatus) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read_file()?;
        if let Some(entry) = file.sessions.get_mut(&id.to_string()) {
            entry.status = status;
            entry.updated_at = Utc::now();
            self.write_file(&file)?;
        }
        Ok(())
    }

    /// Remove an entry by session id.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read or written.
    pub fn unregister(&self, id: Uuid) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read_file()?;
        if file.sessions.remove(&id.to_string()).is_some() {
            self.write_file(&file)?;
        }
        Ok(())
    }

    /// Look up an entry by session id.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read.
    pub fn get_by_id(&self, id: Uuid) -> Result<Option<RegistryEntry>, RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = self.read_file()?;
        Ok(file.sessions.get(&id.to_string()).cloned())
    }

    /// The newest resumable session registered for a working directory.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read.
    pub fn get_by_cwd(&self, cwd: &Path) -> Result<Option<RegistryEntry>, RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = self.read_file()?;
        Ok(file
            .sessions
            .into_values()
            .filter(|e| e.cwd == cwd && e.status.is_resumable())
            .max_by_key(|e| e.updated_at))
    }

    /// List entries, newest first.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read.
    pub fn list(&self, filter: RegistryFilter) -> Result<Vec<RegistryEntry>, RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = self.read_file()?;
        let mut entries: Vec<RegistryEntry> = file
            .sessions
            .into_values()
            .filter(|e| match filter {
                RegistryFilter::Resumable => e.status.is_resumable(),
                RegistryFilter::All => true,
            })
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }

    /// Entries whose session id starts with `prefix`, newest first.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
        let mut entries = self.list(RegistryFilter::All)?;
        entries.retain(|e| e.session_id.to_string().starts_with(prefix));
        Ok(entries)
    }

    /// Drop entries whose working directory no longer holds a session.
    ///
    /// `occupied` is asked once per entry; entries it reports `false`
    /// for are removed. Returns the number of removed entries.
    ///
    /// # Errors
    /// Returns error if the registry file cannot be read or written.
    pub fn cleanup_stale<F>(&self, occupied: F) -> Result<usize, RegistryError>
    where
        F: Fn(&Path) -> bool,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read_file()?;
        let before = file.sessions.len();
        file.sessions.retain(|_, entry| occupied(&entry.cwd));
        let removed = before - file.sessions.len();
        if removed > 0 {
            self.write_file(&file)?;
        }
        Ok(removed)
    }

    fn read_file(&self) -> Result<RegistryFile, RegistryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default());
            }
            Err(e) => return Err(e.into()),
        };
        let file: RegistryFile = serde_json::from_str(&contents)?;
        if file.version != REGISTRY_SCHEMA_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                version = file.version,
                "registry file has unexpected schema version"
            );
        }
        Ok(file)
    }

    fn write_file(&self, file: &RegistryFile) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(file)?;
        write_atomic(&self.path, json.as_bytes())?;
        Ok(())
    }
}
