//! Common test helper functions.
//!
//! These utilities reduce boilerplate in integration tests by providing
//! standard implementations for temp directories and file serialization.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tasklane::config::EngineConfig;
use tasklane::model::Task;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a unique temporary directory for a test.
///
/// The name carries a timestamp and a process-wide counter so parallel tests
/// never collide. The directory is created immediately.
///
/// # Panics
///
/// Panics if the directory cannot be created.
#[must_use]
pub fn temp_dir(prefix: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "tasklane-{prefix}-{stamp}-{}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("failed to create temp directory");
    dir
}

/// Write a list of tasks to a JSON file.
pub fn write_tasks(path: &Path, tasks: &[Task]) {
    let data = serde_json::to_vec_pretty(tasks).expect("failed to serialize tasks");
    fs::write(path, data).expect("failed to write tasks file");
}

/// Write a single task to a JSON file.
pub fn write_task(path: &Path, task: &Task) {
    let data = serde_json::to_vec_pretty(task).expect("failed to serialize task");
    fs::write(path, data).expect("failed to write task file");
}

/// Write an engine configuration to a JSON file.
pub fn write_config(path: &Path, config: &EngineConfig) {
    let data = serde_json::to_vec_pretty(config).expect("failed to serialize config");
    fs::write(path, data).expect("failed to write config file");
}
