//! Live progress registry and the sink runners report through.
//!
//! The tracker holds one [`LiveProgress`] per in-flight or recently finished
//! run. Finished entries are dropped one retention window after they reach a
//! terminal state by a one-shot delayed task.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::model::{LiveProgress, RunId, RunRecord, RunStatus};

/// Receives partial output while a run executes.
///
/// Implementors can use this to update a registry, drive a spinner, or
/// collect output in tests.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called with the full output captured so far.
    async fn on_output(&self, output: &str);
}

/// A sink that discards all output.
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn on_output(&self, _output: &str) {}
}

/// Shared map of run id to live progress.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    entries: Arc<RwLock<HashMap<RunId, LiveProgress>>>,
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn put(&self, progress: LiveProgress) {
        self.entries.write().await.insert(progress.run_id, progress);
    }

    pub async fn get(&self, run_id: RunId) -> Option<LiveProgress> {
        self.entries.read().await.get(&run_id).cloned()
    }

    pub async fn delete(&self, run_id: RunId) -> Option<LiveProgress> {
        self.entries.write().await.remove(&run_id)
    }

    /// Entries accepted by `filter`, newest first.
    pub async fn list(&self, filter: impl Fn(&LiveProgress) -> bool) -> Vec<LiveProgress> {
        let mut matched: Vec<LiveProgress> = self
            .entries
            .read()
            .await
            .values()
            .filter(|progress| filter(progress))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        matched
    }

    pub async fn list_running(&self) -> Vec<LiveProgress> {
        self.list(|progress| progress.status == RunStatus::Running)
            .await
    }

    /// Replace the captured output of a running entry. Terminal entries are left alone.
    pub async fn update_output(&self, run_id: RunId, output: &str) {
        let mut entries = self.entries.write().await;
        if let Some(progress) = entries.get_mut(&run_id) {
            if !progress.status.is_terminal() && progress.output != output {
                progress.output = output.to_string();
            }
        }
    }

    /// Copy the terminal state of `record` into its entry and schedule removal.
    ///
    /// Returns `false` when there is no entry or it was already terminal.
    pub async fn finish(&self, record: &RunRecord) -> bool {
        {
            let mut entries = self.entries.write().await;
            let Some(progress) = entries.get_mut(&record.id) else {
                return false;
            };
            if progress.status.is_terminal() {
                return false;
            }
            progress.status = record.status;
            progress.output = record.output.clone();
            progress.error = record.error.clone();
            progress.progress = 100;
            progress.end_time = record.end_time;
            progress.duration = record.duration;
        }
        self.expire_after_retention(record.id);
        true
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn expire_after_retention(&self, run_id: RunId) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.retention).await;
            if tracker.delete(run_id).await.is_some() {
                tracing::debug!(%run_id, "expired live progress");
            }
        });
    }

    /// A sink that writes into this tracker's entry for `run_id`.
    pub fn sink_for(&self, run_id: RunId) -> TrackerSink {
        TrackerSink {
            tracker: self.clone(),
            run_id,
        }
    }
}

/// [`ProgressSink`] bound to one run's tracker entry.
#[derive(Clone, Debug)]
pub struct TrackerSink {
    tracker: ProgressTracker,
    run_id: RunId,
}

#[async_trait]
impl ProgressSink for TrackerSink {
    async fn on_output(&self, output: &str) {
        self.tracker.update_output(self.run_id, output).await;
    }
}

/// A sink that collects every published output for testing.
#[cfg(test)]
#[derive(Default)]
pub struct CollectingProgress {
    outputs: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<String> {
        self.outputs.lock().expect("progress mutex poisoned").clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ProgressSink for CollectingProgress {
    async fn on_output(&self, output: &str) {
        self.outputs
            .lock()
            .expect("progress mutex poisoned")
            .push(output.to_string());
    }
}
