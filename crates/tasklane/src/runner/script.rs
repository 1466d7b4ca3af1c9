//! Script task runner.

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{Task, TaskKind};
use crate::policy::ensure_script_allowed;
use crate::runner::{RunContext, RunOutcome, Runner, STOPPED_BY_USER};
use crate::session::{ProcessOutcome, RunLimits, ScriptProcess, ScriptSpec};

/// Runs script tasks: validate, then hand the body to the process controller.
#[derive(Clone, Debug)]
pub struct ScriptRunner {
    config: EngineConfig,
}

impl ScriptRunner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn limits(&self, ctx: &RunContext) -> RunLimits {
        RunLimits {
            deadline: ctx.timeout,
            poll_interval: self.config.output_poll_interval(),
            stop_grace: self.config.stop_grace(),
        }
    }
}

fn script_body(task: &Task) -> EngineResult<&str> {
    match &task.kind {
        TaskKind::Script { script } => Ok(script),
        TaskKind::Http(_) => Err(EngineError::internal(format!(
            "task {} is not a script task",
            task.id
        ))),
    }
}

#[async_trait]
impl Runner for ScriptRunner {
    fn preflight(&self, task: &Task) -> EngineResult<()> {
        ensure_script_allowed(script_body(task)?)
    }

    async fn run(&self, ctx: RunContext) -> RunOutcome {
        let script = match script_body(&ctx.task).and_then(|script| {
            ensure_script_allowed(script)?;
            Ok(script.to_string())
        }) {
            Ok(script) => script,
            Err(err) => return RunOutcome::failed(err.message, ""),
        };

        let spec = ScriptSpec {
            run_id: ctx.run_id,
            script,
            shell: self.config.shell.clone(),
            max_output_bytes: self.config.max_output_bytes,
        };
        let process = match ScriptProcess::spawn(spec) {
            Ok(process) => process,
            Err(err) => return RunOutcome::failed(err.message, ""),
        };

        let timeout_secs = ctx.timeout.as_secs();
        match process
            .run(self.limits(&ctx), ctx.sink.as_ref(), &ctx.stop)
            .await
        {
            Ok(ProcessOutcome::Exited {
                success: true,
                output,
                ..
            }) => RunOutcome::success(output),
            Ok(ProcessOutcome::Exited { code, output, .. }) => {
                let error = match code {
                    Some(code) => format!("execution failed: exit code {code}"),
                    None => "execution failed: terminated by signal".to_string(),
                };
                RunOutcome::failed(error, output)
            }
            Ok(ProcessOutcome::TimedOut { output }) => {
                tracing::warn!(run_id = %ctx.run_id, timeout_secs, "script timed out");
                RunOutcome::failed(format!("execution timeout after {timeout_secs}s"), output)
            }
            Ok(ProcessOutcome::Stopped { output }) => RunOutcome::failed(STOPPED_BY_USER, output),
            Err(err) => RunOutcome::failed(err.message, ""),
        }
    }
}
