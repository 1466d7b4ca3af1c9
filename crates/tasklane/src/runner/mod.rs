//! Task runners.
//!
//! Each [`TaskKind`](crate::model::TaskKind) has one [`Runner`]. A runner
//! checks a task before any run starts (`preflight`) and then executes it,
//! returning a single [`RunOutcome`]. Runners never write run state
//! themselves; the engine applies the outcome exactly once.

pub mod http;
pub mod progress;
pub mod script;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineResult;
use crate::model::{RunId, RunStatus, Task};
use crate::runner::progress::ProgressSink;
use crate::session::StopHandle;

pub use http::HttpRunner;
pub use script::ScriptRunner;

/// Error text recorded for runs ended by a stop request.
pub const STOPPED_BY_USER: &str = "stopped by user";

/// Everything a runner needs for one execution.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub task: Task,
    /// Deadline for the whole execution.
    pub timeout: Duration,
    pub sink: Arc<dyn ProgressSink>,
    pub stop: StopHandle,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("task_id", &self.task.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Terminal result of one execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: String,
    pub error: String,
}

impl RunOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Success,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            output: output.into(),
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Execution strategy for one task kind.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Reject a task before a run starts. No process or request is created.
    fn preflight(&self, task: &Task) -> EngineResult<()>;

    /// Execute the task. Every failure is reported in the outcome.
    async fn run(&self, ctx: RunContext) -> RunOutcome;
}
