//! Engine configuration.
//!
//! Loading and validating `config.toml` is the caller's concern; the
//! engine receives this plain struct.

use std::path::PathBuf;
use std::time::Duration;

use crate::policy::ErrorPolicy;

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Working directory the agent operates in and the session file
    /// lives under.
    pub cwd: PathBuf,
    /// Iteration budget; 0 means unbounded.
    pub max_iterations: u32,
    /// Sleep between iterations.
    pub iteration_delay: Duration,
    /// What to do when an iteration fails.
    pub error_policy: ErrorPolicy,
    /// Prompt template; defaults to [`crate::prompt::DEFAULT_PROMPT_TEMPLATE`].
    pub prompt_template: Option<String>,
    /// Model override forwarded to the agent.
    pub model: Option<String>,
    /// Tracker context recorded in the session.
    pub epic_id: Option<String>,
    /// Tracker context recorded in the session.
    pub prd_path: Option<String>,
}

impl EngineConfig {
    /// Defaults for a working directory: unbounded iterations, no
    /// delay, retry policy.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            max_iterations: 0,
            iteration_delay: Duration::ZERO,
            error_policy: ErrorPolicy::default(),
            prompt_template: None,
            model: None,
            epic_id: None,
            prd_path: None,
        }
    }

    /// Set the iteration budget.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the inter-iteration delay.
    #[must_use]
    pub fn with_iteration_delay(mut self, delay: Duration) -> Self {
        self.iteration_delay = delay;
        self
    }

    /// Set the error policy.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}
