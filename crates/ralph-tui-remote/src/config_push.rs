//! Remote config check and push.
//!
//! Validates pushed TOML, backs up what it overwrites, and reports
//! whether the change needs a migration or a server restart.

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use ralph_tui_session::store::write_atomic;

use crate::protocol::{ConfigScope, Payload};

/// Config push failure.
#[derive(Debug, Error)]
pub enum ConfigPushError {
    #[error("Invalid TOML: {0}")]
    InvalidToml(String),
    #[error("Config already exists at {0}. Use overwrite=true to replace it")]
    AlreadyExists(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved config file locations for one host.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub global: PathBuf,
    pub project: PathBuf,
    pub remote_cwd: PathBuf,
}

impl ConfigPaths {
    /// Standard locations: `<home>/.config/ralph-tui/config.toml` and
    /// `<remote_cwd>/.ralph-tui/config.toml`.
    #[must_use]
    pub fn resolve(remote_cwd: PathBuf, home: &Path) -> Self {
        Self {
            global: home.join(".config").join("ralph-tui").join("config.toml"),
            project: remote_cwd.join(".ralph-tui").join("config.toml"),
            remote_cwd,
        }
    }

    /// Standard locations under the current user's home directory.
    ///
    /// `None` when no home directory can be determined.
    #[must_use]
    pub fn from_home(remote_cwd: PathBuf) -> Option<Self> {
        let home = dirs::home_dir()?;
        Some(Self::resolve(remote_cwd, &home))
    }

    /// The target for a scope.
    #[must_use]
    pub fn for_scope(&self, scope: ConfigScope) -> &Path {
        match scope {
            ConfigScope::Global => &self.global,
            ConfigScope::Project => &self.project,
        }
    }
}

/// Result of a successful push.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub config_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub migration_triggered: bool,
    pub requires_restart: bool,
}

/// Build a `check_config_response` payload for these paths.
#[must_use]
pub fn check_config(paths: &ConfigPaths) -> Payload {
    let global_content = std::fs::read_to_string(&paths.global).ok();
    let project_content = std::fs::read_to_string(&paths.project).ok();
    Payload::CheckConfigResponse {
        global_exists: global_content.is_some(),
        project_exists: project_content.is_some(),
        global_path: paths.global.display().to_string(),
        project_path: paths.project.display().to_string(),
        global_content,
        project_content,
        remote_cwd: paths.remote_cwd.display().to_string(),
    }
}

/// Write a pushed config file.
///
/// Validates the content as TOML, refuses to clobber without
/// `overwrite`, backs up any previous content, and writes atomically.
///
/// # Errors
/// Returns [`ConfigPushError::InvalidToml`] for unparseable content
/// and [`ConfigPushError::AlreadyExists`] when the target exists and
/// `overwrite` is false.
pub fn push_config(
    paths: &ConfigPaths,
    scope: ConfigScope,
    content: &str,
    overwrite: bool,
) -> Result<PushOutcome, ConfigPushError> {
    let new_value: toml::Value =
        toml::from_str(content).map_err(|e| ConfigPushError::InvalidToml(e.to_string()))?;

    let target = paths.for_scope(scope);
    let existing = match std::fs::read_to_string(target) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    if existing.is_some() && !overwrite {
        return Err(ConfigPushError::AlreadyExists(target.to_path_buf()));
    }

    let backup_path = match &existing {
        Some(old_content) => {
            let stamp = Utc::now().to_rfc3339().replace(':', "-");
            let backup = PathBuf::from(format!("{}.backup.{stamp}", target.display()));
            write_atomic(&backup, old_content.as_bytes())?;
            Some(backup)
        }
        None => None,
    };

    write_atomic(target, content.as_bytes())?;
    tracing::info!(path = %target.display(), ?scope, "pushed config");

    let old_value = existing.as_deref().and_then(|c| toml::from_str(c).ok());
    Ok(PushOutcome {
        config_path: target.to_path_buf(),
        backup_path,
        migration_triggered: migration_triggered(old_value.as_ref(), &new_value),
        requires_restart: requires_restart(old_value.as_ref(), &new_value),
    })
}

/// A schema `version` change means the loader will migrate. A first
/// push has nothing to migrate from.
fn migration_triggered(old: Option<&toml::Value>, new: &toml::Value) -> bool {
    match old {
        None => false,
        Some(old) => old.get("version") != new.get("version"),
    }
}

/// Changes to bound listeners need a restart: `port`, `daemon`, or
/// anything under `[remote]`.
fn requires_restart(old: Option<&toml::Value>, new: &toml::Value) -> bool {
    const RESTART_KEYS: &[&str] = &["port", "daemon", "remote"];
    RESTART_KEYS
        .iter()
        .any(|key| old.and_then(|v| v.get(key)) != new.get(key))
}
