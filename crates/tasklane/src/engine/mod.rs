//! Execution engine: the single entry point for starting, observing and
//! stopping runs.
//!
//! `dispatch` records the run, registers its live progress, and spawns the
//! execution as a tokio task watched by a supervisor. The supervisor is the
//! only writer of the run's terminal state, and turns a panic inside a runner
//! into a failed run.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::config::{EngineConfig, OverlapPolicy};
use crate::error::{EngineError, EngineResult};
use crate::model::{LiveProgress, RunId, RunRecord, RunStatus, Task, TaskKind};
use crate::runner::progress::ProgressTracker;
use crate::runner::{HttpRunner, RunContext, RunOutcome, Runner, ScriptRunner};
use crate::session::ActiveRuns;
use crate::store::RunStore;

/// Error text for a run whose execution task panicked.
pub const RUN_PANICKED: &str = "internal error: run panicked";

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    tracker: ProgressTracker,
    active: ActiveRuns,
    runs: Arc<dyn RunStore>,
    script: Arc<ScriptRunner>,
    http: Arc<HttpRunner>,
    /// Serializes the overlap check with run registration.
    dispatch_gate: Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, runs: Arc<dyn RunStore>) -> Self {
        let tracker = ProgressTracker::new(config.progress_retention());
        Self::with_parts(config, runs, tracker, ActiveRuns::new(), HttpRunner::default())
    }

    /// Build an engine around caller-owned shared structures.
    pub fn with_parts(
        config: EngineConfig,
        runs: Arc<dyn RunStore>,
        tracker: ProgressTracker,
        active: ActiveRuns,
        http: HttpRunner,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                script: Arc::new(ScriptRunner::new(config.clone())),
                http: Arc::new(http),
                config,
                tracker,
                active,
                runs,
                dispatch_gate: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.inner.tracker
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.inner.active
    }

    pub fn run_store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.inner.runs)
    }

    fn runner_for(&self, kind: &TaskKind) -> Arc<dyn Runner> {
        match kind {
            TaskKind::Script { .. } => self.inner.script.clone(),
            TaskKind::Http(_) => self.inner.http.clone(),
        }
    }

    /// Start a run of `task` and return its id without waiting for it.
    ///
    /// A task rejected before execution (unsafe script, malformed request)
    /// still gets a failed run record; the returned error carries its
    /// `run_id` in the context.
    ///
    /// # Errors
    /// - `E_UNSAFE_SCRIPT`, `E_INVALID_REQUEST`: preflight rejection
    /// - `E_ALREADY_RUNNING`: overlap policy is `skip` and the task is running
    /// - `E_STORAGE`: the run record could not be created
    pub async fn dispatch(&self, task: &Task) -> EngineResult<RunId> {
        let runner = self.runner_for(&task.kind);
        let mut record = RunRecord::start(task);
        let run_id = record.id;
        let span = tracing::info_span!("run", %run_id, task_id = %task.id, kind = task.kind_name());

        {
            let _gate = self.inner.dispatch_gate.lock().await;
            self.check_overlap(task).await?;
            self.inner.runs.create_run(&record).await.map_err(|err| {
                tracing::error!(%run_id, task_id = %task.id, error = %err, "failed to record run");
                err
            })?;
            self.inner
                .tracker
                .put(LiveProgress::for_run(&record, task))
                .await;
        }

        if let Err(err) = runner.preflight(task) {
            tracing::warn!(%run_id, task_id = %task.id, reason = %err.message, "run rejected");
            self.finalize(&mut record, RunOutcome::failed(err.message.clone(), ""))
                .await;
            return Err(err.with_run_id(run_id));
        }

        let stop = self.inner.active.register(run_id).await;
        let ctx = RunContext {
            run_id,
            task: task.clone(),
            timeout: self.inner.config.timeout_for(task.timeout_seconds),
            sink: Arc::new(self.inner.tracker.sink_for(run_id)),
            stop,
        };

        let engine = self.clone();
        tokio::spawn(
            async move {
                tracing::info!(task_name = %ctx.task.name, "run started");
                let execution = tokio::spawn(async move { runner.run(ctx).await }.in_current_span());
                let outcome = match execution.await {
                    Ok(outcome) => outcome,
                    Err(err) if err.is_panic() => {
                        tracing::error!("run panicked");
                        RunOutcome::failed(RUN_PANICKED, "")
                    }
                    Err(_) => RunOutcome::failed("internal error: run cancelled", ""),
                };
                engine.finalize(&mut record, outcome).await;
            }
            .instrument(span),
        );
        Ok(run_id)
    }

    async fn check_overlap(&self, task: &Task) -> EngineResult<()> {
        if self.inner.config.overlap == OverlapPolicy::Allow {
            return Ok(());
        }
        let running = self
            .inner
            .tracker
            .list(|progress| progress.task_id == task.id && progress.status == RunStatus::Running)
            .await;
        match running.first() {
            Some(existing) => Err(EngineError::already_running(task.id, existing.run_id)),
            None => Ok(()),
        }
    }

    /// Apply the terminal state to the store, the active-run registry and the tracker.
    async fn finalize(&self, record: &mut RunRecord, outcome: RunOutcome) {
        let status = outcome.status;
        if !record.finish(status, outcome.output, outcome.error, Utc::now()) {
            return;
        }
        if let Err(err) = self.inner.runs.update_run(record).await {
            tracing::error!(run_id = %record.id, error = %err, "failed to persist run result");
        }
        self.inner.active.remove(record.id).await;
        self.inner.tracker.finish(record).await;

        match status {
            RunStatus::Success => {
                tracing::info!(run_id = %record.id, duration = record.duration, "run succeeded");
            }
            _ => {
                tracing::warn!(run_id = %record.id, duration = record.duration, error = %record.error, "run failed");
            }
        }
    }

    pub async fn get_progress(&self, run_id: RunId) -> Option<LiveProgress> {
        self.inner.tracker.get(run_id).await
    }

    /// Request termination of a running run.
    ///
    /// # Errors
    /// - `E_NOT_FOUND`: unknown run id
    /// - `E_NOT_RUNNING`: the run already reached a terminal state
    /// - `E_SIGNAL_FAILED`: the process could not be signalled
    pub async fn stop_run(&self, run_id: RunId) -> EngineResult<()> {
        let status = match self.inner.tracker.get(run_id).await {
            Some(progress) => progress.status,
            None => match self.inner.runs.get_run(run_id).await? {
                Some(record) => record.status,
                None => return Err(EngineError::not_found("run", run_id)),
            },
        };
        if status.is_terminal() {
            return Err(EngineError::not_running(run_id));
        }
        let handle = self
            .inner
            .active
            .get(run_id)
            .await
            .ok_or_else(|| EngineError::not_running(run_id))?;
        handle.request_stop()?;
        tracing::info!(%run_id, "stop requested");
        Ok(())
    }

    /// Request a stop for every active run. Returns how many were signalled.
    pub async fn stop_all(&self) -> usize {
        let handles = self.inner.active.handles().await;
        let mut stopped = 0;
        for handle in handles {
            match handle.request_stop() {
                Ok(()) => stopped += 1,
                Err(err) => {
                    tracing::warn!(run_id = %handle.run_id(), error = %err, "failed to stop run");
                }
            }
        }
        stopped
    }

    /// Running runs, newest first.
    pub async fn list_running(&self) -> Vec<LiveProgress> {
        self.inner.tracker.list_running().await
    }

    /// Poll until the run is terminal. `None` when it is unknown or still
    /// running after `timeout`.
    pub async fn wait_for_terminal(&self, run_id: RunId, timeout: Duration) -> Option<LiveProgress> {
        let poll = async {
            loop {
                match self.inner.tracker.get(run_id).await {
                    Some(progress) if progress.status.is_terminal() => return Some(progress),
                    Some(_) => tokio::time::sleep(WAIT_POLL).await,
                    None => return None,
                }
            }
        };
        tokio::time::timeout(timeout, poll).await.ok().flatten()
    }
}
