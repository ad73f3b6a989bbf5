//! Engine configuration.
//!
//! Type-safe configuration structures with defaults and builder-style
//! setters; loading from disk is left to the embedding application.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::DepthOverflowPolicy;

/// Root configuration for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Worker pool size per plan depth; index 0 serves root plans.
    pub pool_sizes: Vec<usize>,

    /// Behavior for plans deeper than the configured pools.
    pub depth_overflow: DepthOverflowPolicy,

    /// Maximum think-act rounds per step.
    pub max_agent_steps: usize,

    /// Character budget for an agent's working message history.
    pub memory_max_characters: usize,

    /// Messages kept verbatim by forced memory compression.
    pub memory_retain_recent: usize,

    /// Seconds a form-input wait lasts before timing out.
    pub form_input_timeout_secs: u64,

    /// Seconds an exclusive form-slot acquisition may wait.
    pub form_lock_timeout_secs: u64,

    /// Working directory for per-plan run folders.
    pub base_dir: PathBuf,

    /// Staging directory for pre-uploaded files, keyed by upload key.
    pub upload_dir: PathBuf,

    /// Model requested when a plan does not pin one.
    pub default_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_sizes: vec![4, 4, 2, 2, 1],
            depth_overflow: DepthOverflowPolicy::ReuseDeepest,
            max_agent_steps: 20,
            memory_max_characters: 200_000,
            memory_retain_recent: 6,
            form_input_timeout_secs: 300,
            form_lock_timeout_secs: 30,
            base_dir: PathBuf::from("runs"),
            upload_dir: PathBuf::from("uploads"),
            default_model: "gpt-4o".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Set the per-depth pool sizes.
    #[must_use]
    pub fn with_pool_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.pool_sizes = sizes;
        self
    }

    /// Set the depth overflow policy.
    #[must_use]
    pub const fn with_depth_overflow(mut self, policy: DepthOverflowPolicy) -> Self {
        self.depth_overflow = policy;
        self
    }

    /// Set the per-step round limit.
    #[must_use]
    pub const fn with_max_agent_steps(mut self, max_agent_steps: usize) -> Self {
        self.max_agent_steps = max_agent_steps;
        self
    }

    /// Set the memory character budget.
    #[must_use]
    pub const fn with_memory_max_characters(mut self, max_characters: usize) -> Self {
        self.memory_max_characters = max_characters;
        self
    }

    /// Set the form-input wait timeout.
    #[must_use]
    pub const fn with_form_input_timeout(mut self, secs: u64) -> Self {
        self.form_input_timeout_secs = secs;
        self
    }

    /// Set the working directory for run folders.
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Set the upload staging directory.
    #[must_use]
    pub fn with_upload_dir(mut self, upload_dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = upload_dir.into();
        self
    }

    /// Set the default model name.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Form-input wait timeout as a [`Duration`].
    #[must_use]
    pub const fn form_input_timeout(&self) -> Duration {
        Duration::from_secs(self.form_input_timeout_secs)
    }

    /// Exclusive form-slot acquisition timeout as a [`Duration`].
    #[must_use]
    pub const fn form_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.form_lock_timeout_secs)
    }
}
