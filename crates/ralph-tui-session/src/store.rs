//! Crash-safe per-cwd session file store.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::session::{PersistedSession, SESSION_SCHEMA_VERSION};

/// File name of the session file inside the working directory.
pub const SESSION_FILE_NAME: &str = ".ralph-tui-session.json";

/// Store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write `contents` to `path` atomically: temp file, fsync, rename.
///
/// # Errors
/// Returns error if any step of the write fails.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = tmp_path_for(path);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Crash-safe session persistence for a working directory.
///
/// All writes go through temp-file-plus-rename so a crash mid-save
/// never leaves a truncated session behind.
#[derive(Debug, Default)]
pub struct SessionStore {
    write_lock: Mutex<()>,
}

impl SessionStore {
    /// Create a store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the session file for a working directory.
    #[must_use]
    pub fn session_path(cwd: &Path) -> PathBuf {
        cwd.join(SESSION_FILE_NAME)
    }

    /// Whether a session file exists for this working directory.
    #[must_use]
    pub fn has(&self, cwd: &Path) -> bool {
        Self::session_path(cwd).is_file()
    }

    /// Load the session for a working directory, if one exists.
    ///
    /// A schema version other than the current one logs a warning but
    /// is still parsed best-effort.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(&self, cwd: &Path) -> Result<Option<PersistedSession>, StoreError> {
        let path = Self::session_path(cwd);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value = serde_json::from_str(&contents)?;
        let version = value.get("version").and_then(serde_json::Value::as_u64);
        if version != Some(u64::from(SESSION_SCHEMA_VERSION)) {
            tracing::warn!(
                path = %path.display(),
                ?version,
                "session file has unexpected schema version, parsing best-effort"
            );
        }

        Ok(Some(serde_json::from_value(value)?))
    }

    /// Persist the session to its working directory.
    ///
    /// Refreshes `updated_at` before writing.
    ///
    /// # Errors
    /// Returns error if serialization or the atomic write fails.
    pub fn save(&self, session: &mut PersistedSession) -> Result<(), StoreError> {
        session.updated_at = chrono::Utc::now();
        let path = Self::session_path(&session.cwd);
        let json = serde_json::to_string_pretty(session)?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        write_atomic(&path, json.as_bytes())?;
        Ok(())
    }

    /// Remove the session file, if present.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be removed.
    pub fn delete(&self, cwd: &Path) -> Result<(), StoreError> {
        match fs::remove_file(Self::session_path(cwd)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionStatus, TrackerState};

    fn tracker_state() -> TrackerState {
        TrackerState {
            plugin: "json".to_string(),
            epic_id: Some("epic-7".to_string()),
            prd_path: None,
            total_tasks: 3,
            tasks: vec![],
        }
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new();
        assert!(!store.has(dir.path()));
        assert!(store.load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new();
        let mut session = PersistedSession::create(
            dir.path().to_path_buf(),
            "claude",
            Some("opus".to_string()),
            5,
            tracker_state(),
        );
        store.save(&mut session).unwrap();

        assert!(store.has(dir.path()));
        let loaded = store.load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(loaded.updated_at >= loaded.started_at);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new();
        let mut session =
            PersistedSession::create(dir.path().to_path_buf(), "claude", None, 0, tracker_state());
        store.save(&mut session).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new();
        let mut session =
            PersistedSession::create(dir.path().to_path_buf(), "claude", None, 0, tracker_state());
        store.save(&mut session).unwrap();

        store.delete(dir.path()).unwrap();
        store.delete(dir.path()).unwrap();
        assert!(!store.has(dir.path()));
    }

    #[test]
    fn unknown_version_still_parses() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new();
        let mut session =
            PersistedSession::create(dir.path().to_path_buf(), "claude", None, 0, tracker_state());
        store.save(&mut session).unwrap();

        // Rewrite the file with a bumped version field.
        let path = SessionStore::session_path(dir.path());
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replace("\"version\": 1", "\"version\": 2")).unwrap();

        let loaded = store.load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.status, SessionStatus::Running);
    }
}
