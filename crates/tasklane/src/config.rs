//! Engine configuration and definition-file loading.
//!
//! Files ending in `.yaml`/`.yml` are parsed as YAML, everything else as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::Task;

/// Default per-run deadline when a task sets `timeout_seconds = 0`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// How long a finished run stays visible in the progress tracker.
pub const DEFAULT_PROGRESS_RETENTION_SECS: u64 = 3600;
/// Interval at which partial script output is published.
pub const DEFAULT_OUTPUT_POLL_INTERVAL_MS: u64 = 500;
/// Grace period between the termination signal and a forced kill.
pub const DEFAULT_STOP_GRACE_MS: u64 = 3000;
/// Cap on captured output per run.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// Whether a task may have more than one run in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Every dispatch starts a new run.
    #[default]
    Allow,
    /// A dispatch is refused while another run of the same task is running.
    Skip,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_timeout_secs: u64,
    pub progress_retention_secs: u64,
    pub output_poll_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub max_output_bytes: usize,
    pub overlap: OverlapPolicy,
    /// Interpreter override; `bash` on POSIX and `cmd` on Windows when unset.
    pub shell: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            progress_retention_secs: DEFAULT_PROGRESS_RETENTION_SECS,
            output_poll_interval_ms: DEFAULT_OUTPUT_POLL_INTERVAL_MS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            overlap: OverlapPolicy::Allow,
            shell: None,
        }
    }
}

impl EngineConfig {
    /// Deadline for a task: its own timeout, or the default when zero.
    pub fn timeout_for(&self, timeout_seconds: u64) -> Duration {
        if timeout_seconds == 0 {
            Duration::from_secs(self.default_timeout_secs)
        } else {
            Duration::from_secs(timeout_seconds)
        }
    }

    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }

    pub fn output_poll_interval(&self) -> Duration {
        Duration::from_millis(self.output_poll_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    #[must_use]
    pub fn with_default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_progress_retention(mut self, retention: Duration) -> Self {
        self.progress_retention_secs = retention.as_secs();
        self
    }

    #[must_use]
    pub fn with_output_poll_interval_ms(mut self, ms: u64) -> Self {
        self.output_poll_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn with_stop_grace_ms(mut self, ms: u64) -> Self {
        self.stop_grace_ms = ms;
        self
    }

    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = Some(shell.into());
        self
    }
}

pub fn load_config_file(path: &Path) -> EngineResult<EngineConfig> {
    load_file(path, "config")
}

/// Load a list of task definitions.
pub fn load_tasks_file(path: &Path) -> EngineResult<Vec<Task>> {
    load_file(path, "tasks")
}

/// Load a single task definition.
pub fn load_task_file(path: &Path) -> EngineResult<Task> {
    load_file(path, "task")
}

fn load_file<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> EngineResult<T> {
    let data = fs::read_to_string(path)
        .map_err(|err| EngineError::config(format!("failed to read {what} file"), err))?;
    if is_yaml(path) {
        serde_yml::from_str(&data)
            .map_err(|err| EngineError::config(format!("failed to parse {what} yaml"), err))
    } else {
        serde_json::from_str(&data)
            .map_err(|err| EngineError::config(format!("failed to parse {what} json"), err))
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}
