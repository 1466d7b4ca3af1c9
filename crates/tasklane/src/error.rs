//! Error type shared by every engine surface.
//!
//! Errors carry a stable [`ErrorCode`], a human-readable message, and an
//! optional JSON context with the details a caller needs to act on them.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::model::{RunId, TaskId};

/// Result alias used across the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Cron expression could not be parsed.
    InvalidCron,
    /// Script rejected by the safety validator.
    UnsafeScript,
    /// HTTP task definition is malformed (headers, method, url).
    InvalidRequest,
    /// Unknown run or task id.
    NotFound,
    /// Run exists but is no longer running.
    NotRunning,
    /// Termination signal could not be delivered.
    SignalFailed,
    /// Overlap policy refused a second concurrent run of a task.
    AlreadyRunning,
    /// Deadline exceeded.
    Timeout,
    /// Filesystem or process I/O failure.
    Io,
    /// Storage collaborator failure.
    Storage,
    /// Configuration file could not be read or parsed.
    Config,
    /// Invariant violation inside the engine.
    Internal,
}

impl ErrorCode {
    /// Wire form of the code, e.g. `E_INVALID_CRON`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCron => "E_INVALID_CRON",
            Self::UnsafeScript => "E_UNSAFE_SCRIPT",
            Self::InvalidRequest => "E_INVALID_REQUEST",
            Self::NotFound => "E_NOT_FOUND",
            Self::NotRunning => "E_NOT_RUNNING",
            Self::SignalFailed => "E_SIGNAL_FAILED",
            Self::AlreadyRunning => "E_ALREADY_RUNNING",
            Self::Timeout => "E_TIMEOUT",
            Self::Io => "E_IO",
            Self::Storage => "E_STORAGE",
            Self::Config => "E_CONFIG",
            Self::Internal => "E_INTERNAL",
        }
    }

    /// Process exit code used by the command-line front end.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::UnsafeScript => 2,
            Self::InvalidCron | Self::InvalidRequest | Self::Config => 3,
            Self::Timeout => 4,
            Self::NotFound | Self::NotRunning | Self::AlreadyRunning => 5,
            Self::SignalFailed | Self::Io | Self::Storage | Self::Internal => 6,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error with code, message and optional structured context.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    #[serde(serialize_with = "serialize_code")]
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn invalid_cron(expr: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidCron,
            format!("invalid cron expression '{expr}': {reason}"),
            serde_json::json!({
                "expr": expr,
                "expected": "5 fields: minute hour day-of-month month day-of-week",
                "example": "0 0 * * *"
            }),
        )
    }

    pub fn unsafe_script(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsafeScript, reason, None)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, None)
    }

    pub fn not_found(what: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{what} not found"),
            serde_json::json!({ "id": id.to_string() }),
        )
    }

    pub fn not_running(run_id: RunId) -> Self {
        Self::new(
            ErrorCode::NotRunning,
            "run is not running",
            serde_json::json!({ "run_id": run_id.to_string() }),
        )
    }

    pub fn signal_failed(run_id: RunId, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::SignalFailed,
            "failed to signal process",
            serde_json::json!({ "run_id": run_id.to_string(), "source": err.to_string() }),
        )
    }

    pub fn already_running(task_id: TaskId, run_id: RunId) -> Self {
        Self::new(
            ErrorCode::AlreadyRunning,
            format!("task {task_id} already has a running run"),
            serde_json::json!({
                "task_id": task_id.0,
                "running_run_id": run_id.to_string(),
                "fix": "Wait for the running run to finish or set overlap: allow"
            }),
        )
    }

    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Io,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn storage(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Storage,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn config(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Config,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, None)
    }

    /// Attach the run id of a run that was recorded before the error surfaced.
    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        let mut context = match self.context.take() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("detail".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        context.insert("run_id".to_string(), Value::String(run_id.to_string()));
        self.context = Some(Value::Object(context));
        self
    }

    /// Run id recorded in the context, if any.
    pub fn run_id(&self) -> Option<RunId> {
        self.context
            .as_ref()?
            .get("run_id")?
            .as_str()?
            .parse()
            .ok()
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_code<S: serde::Serializer>(code: &ErrorCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(code.as_str())
}

impl Diagnostic for EngineError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code))
    }
}
