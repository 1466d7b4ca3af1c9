//! Fluent builder for constructing [`Task`] values in tests.

use tasklane::model::{HttpRequestSpec, Task, TaskId, TaskKind, TaskStatus};

// ============================================================================
// TaskBuilder
// ============================================================================

/// Fluent builder for [`Task`] definitions.
///
/// Starts active, with cron disabled and the engine's default timeout.
///
/// # Example
///
/// ```ignore
/// let task = TaskBuilder::script(1, "echo hello")
///     .with_timeout(2)
///     .with_cron("*/5 * * * *")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    /// Script task with the given body.
    #[must_use]
    pub fn script(id: u64, script: &str) -> Self {
        Self::new(
            id,
            TaskKind::Script {
                script: script.to_string(),
            },
        )
    }

    /// HTTP task sending a `GET` to `url`.
    #[must_use]
    pub fn http(id: u64, url: impl Into<String>) -> Self {
        Self::new(
            id,
            TaskKind::Http(HttpRequestSpec {
                url: url.into(),
                ..HttpRequestSpec::default()
            }),
        )
    }

    fn new(id: u64, kind: TaskKind) -> Self {
        Self {
            task: Task {
                id: TaskId(id),
                name: format!("task-{id}"),
                description: String::new(),
                kind,
                timeout_seconds: 0,
                status: TaskStatus::Active,
                enable_cron: false,
                cron_expr: String::new(),
            },
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    /// Set the timeout in seconds; zero means the engine default.
    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.task.timeout_seconds = seconds;
        self
    }

    /// Enable cron with `expr`.
    #[must_use]
    pub fn with_cron(mut self, expr: &str) -> Self {
        self.task.enable_cron = true;
        self.task.cron_expr = expr.to_string();
        self
    }

    /// Disable cron, keeping the expression.
    #[must_use]
    pub fn without_cron(mut self) -> Self {
        self.task.enable_cron = false;
        self
    }

    /// Mark the task inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.task.status = TaskStatus::Inactive;
        self
    }

    /// Set the HTTP method. No effect on script tasks.
    #[must_use]
    pub fn with_method(mut self, method: &str) -> Self {
        if let TaskKind::Http(spec) = &mut self.task.kind {
            spec.method = method.to_string();
        }
        self
    }

    /// Set the raw JSON header object. No effect on script tasks.
    #[must_use]
    pub fn with_headers(mut self, headers: &str) -> Self {
        if let TaskKind::Http(spec) = &mut self.task.kind {
            spec.headers = headers.to_string();
        }
        self
    }

    /// Set the request body. No effect on script tasks.
    #[must_use]
    pub fn with_body(mut self, body: &str) -> Self {
        if let TaskKind::Http(spec) = &mut self.task.kind {
            spec.body = body.to_string();
        }
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Task {
        self.task
    }
}
