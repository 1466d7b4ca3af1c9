use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{RunId, Task, TaskId};

/// Lifecycle state of a run: `pending -> running -> {success, failed}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted history row for one execution of a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub task_id: TaskId,
    pub status: RunStatus,
    pub output: String,
    pub error: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds between start and end.
    pub duration: u64,
}

impl RunRecord {
    /// A fresh run for `task`, already marked running.
    pub fn start(task: &Task) -> Self {
        Self {
            id: RunId::new(),
            task_id: task.id,
            status: RunStatus::Running,
            output: String::new(),
            error: String::new(),
            start_time: Utc::now(),
            end_time: None,
            duration: 0,
        }
    }

    /// Apply the terminal state. Returns `false` if the record was already terminal.
    pub fn finish(
        &mut self,
        status: RunStatus,
        output: String,
        error: String,
        end_time: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.output = output;
        self.error = error;
        self.end_time = Some(end_time);
        self.duration = elapsed_secs(self.start_time, end_time);
        true
    }
}

/// In-memory view of an in-flight or recently finished run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveProgress {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub task_name: String,
    pub status: RunStatus,
    pub output: String,
    pub error: String,
    /// 0 while running, 100 once terminal.
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: u64,
}

impl LiveProgress {
    pub fn for_run(record: &RunRecord, task: &Task) -> Self {
        Self {
            run_id: record.id,
            task_id: record.task_id,
            task_name: task.name.clone(),
            status: record.status,
            output: record.output.clone(),
            error: record.error.clone(),
            progress: if record.status.is_terminal() { 100 } else { 0 },
            start_time: record.start_time,
            end_time: record.end_time,
            duration: record.duration,
        }
    }
}

pub(crate) fn elapsed_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_seconds()).unwrap_or(0)
}
