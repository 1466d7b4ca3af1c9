use serde::{Deserialize, Serialize};

use crate::model::TaskId;

/// A user-defined unit of automation, read from the storage collaborator.
///
/// The engine treats a task as an immutable snapshot: every run works on the
/// copy it was dispatched with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Per-run deadline in seconds. Zero selects the engine default.
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub enable_cron: bool,
    #[serde(default)]
    pub cron_expr: String,
}

impl Task {
    /// Whether the scheduler should hold a trigger for this task.
    pub fn wants_schedule(&self) -> bool {
        self.status == TaskStatus::Active && self.enable_cron && !self.cron_expr.trim().is_empty()
    }

    /// Short name of the task kind, as used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Script { .. } => "script",
            TaskKind::Http(_) => "http",
        }
    }
}

/// What a task does when it runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Shell script body, executed by `bash` (or `cmd` on Windows).
    Script {
        #[serde(default)]
        script: String,
    },
    /// Outbound HTTP request.
    Http(HttpRequestSpec),
}

/// HTTP call definition. Headers and body are opaque text blobs from storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// JSON object of header name to value; empty means no headers.
    #[serde(default)]
    pub headers: String,
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for HttpRequestSpec {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_method(),
            headers: String::new(),
            body: String::new(),
        }
    }
}

/// Whether a task is eligible for scheduling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Inactive,
}
