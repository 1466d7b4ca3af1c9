//! Cron scheduler: one trigger loop per scheduled task.
//!
//! Each entry owns a tokio task that sleeps until the next fire time and then
//! hands the task to [`Engine::dispatch`]. Dispatch failures are logged and
//! never end the loop. An entry exists exactly while its task is active, has
//! cron enabled, and carries a valid expression.

mod expr;

pub use expr::{next_run_after, next_run_time, upcoming, CronExpr};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::model::{Task, TaskId};
use crate::store::TaskStore;

/// Public view of one cron entry.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ScheduledEntry {
    pub task_id: TaskId,
    pub expr: String,
    pub next_fire: Option<DateTime<Utc>>,
}

struct CronEntry {
    expr: CronExpr,
    task: watch::Sender<Task>,
    next_fire: watch::Receiver<Option<DateTime<Utc>>>,
    trigger: JoinHandle<()>,
}

impl Drop for CronEntry {
    fn drop(&mut self) {
        self.trigger.abort();
    }
}

#[derive(Clone)]
pub struct CronScheduler {
    engine: Engine,
    entries: Arc<Mutex<HashMap<TaskId, CronEntry>>>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler").finish()
    }
}

impl CronScheduler {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule every task that wants a schedule. Invalid expressions are
    /// logged and skipped. Returns the number of tasks scheduled.
    pub async fn start(&self, tasks: &[Task]) -> usize {
        let mut scheduled = 0;
        for task in tasks.iter().filter(|task| task.wants_schedule()) {
            match self.schedule(task).await {
                Ok(()) => scheduled += 1,
                Err(err) => {
                    tracing::warn!(task_id = %task.id, error = %err, "skipping task with invalid schedule");
                }
            }
        }
        tracing::info!(scheduled, "scheduler started");
        scheduled
    }

    /// Load tasks from `store` and [`start`](Self::start) them.
    pub async fn start_from_store(&self, store: &dyn TaskStore) -> EngineResult<usize> {
        let tasks = store.list_tasks().await?;
        Ok(self.start(&tasks).await)
    }

    /// Install (or replace) the trigger for `task`.
    ///
    /// A task that does not want a schedule loses any entry it had.
    ///
    /// # Errors
    /// - `E_INVALID_CRON`: cron is enabled and the expression is missing or malformed
    pub async fn schedule(&self, task: &Task) -> EngineResult<()> {
        if !task.enable_cron {
            self.unschedule(task.id).await;
            return Ok(());
        }
        if task.cron_expr.trim().is_empty() {
            return Err(EngineError::invalid_cron(
                &task.cron_expr,
                "expression is required when cron is enabled",
            ));
        }
        let expr = CronExpr::parse(&task.cron_expr)?;
        if !task.wants_schedule() {
            self.unschedule(task.id).await;
            return Ok(());
        }

        let (task_tx, task_rx) = watch::channel(task.clone());
        let (next_tx, next_rx) = watch::channel(None);
        let trigger = tokio::spawn(trigger_loop(
            self.engine.clone(),
            expr.clone(),
            task_rx,
            next_tx,
        ));
        let entry = CronEntry {
            expr,
            task: task_tx,
            next_fire: next_rx,
            trigger,
        };
        let replaced = self.entries.lock().await.insert(task.id, entry);
        tracing::info!(
            task_id = %task.id,
            expr = %task.cron_expr,
            replaced = replaced.is_some(),
            "task scheduled"
        );
        Ok(())
    }

    /// Remove the trigger for `task_id`. Returns whether one existed.
    pub async fn unschedule(&self, task_id: TaskId) -> bool {
        let removed = self.entries.lock().await.remove(&task_id);
        if removed.is_some() {
            tracing::info!(%task_id, "task unscheduled");
        }
        removed.is_some()
    }

    /// Apply an edit of a task definition.
    ///
    /// The trigger is rebuilt when the schedule-relevant fields changed;
    /// otherwise only the task snapshot used at fire time is refreshed.
    ///
    /// # Errors
    /// - `E_INVALID_CRON`: the new expression is malformed; no entry is left behind
    pub async fn reschedule(&self, old: &Task, new: &Task) -> EngineResult<()> {
        if old.id != new.id {
            self.unschedule(old.id).await;
        }
        let schedule_changed = old.enable_cron != new.enable_cron
            || old.status != new.status
            || old.cron_expr.trim() != new.cron_expr.trim();

        if !schedule_changed {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&new.id) {
                entry.task.send_replace(new.clone());
                return Ok(());
            }
        }

        self.unschedule(new.id).await;
        self.schedule(new).await
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_scheduled(&self, task_id: TaskId) -> bool {
        self.entries.lock().await.contains_key(&task_id)
    }

    /// Current entries ordered by task id.
    pub async fn entries(&self) -> Vec<ScheduledEntry> {
        let mut entries: Vec<ScheduledEntry> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|(task_id, entry)| ScheduledEntry {
                task_id: *task_id,
                expr: entry.expr.as_str().to_string(),
                next_fire: *entry.next_fire.borrow(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.task_id);
        entries
    }

    /// Next fire time of `expr` from now, without scheduling anything.
    pub fn preview_next_run(&self, expr: &str) -> EngineResult<DateTime<Utc>> {
        next_run_time(expr)
    }

    /// Abort every trigger.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        tracing::info!(count, "scheduler stopped");
    }
}

async fn trigger_loop(
    engine: Engine,
    expr: CronExpr,
    task: watch::Receiver<Task>,
    next_fire: watch::Sender<Option<DateTime<Utc>>>,
) {
    let mut cursor = Utc::now();
    loop {
        let now = Utc::now();
        let Some(next) = expr.next_fire(cursor.max(now)) else {
            tracing::warn!(expr = %expr, "cron expression has no future fire times");
            next_fire.send_replace(None);
            return;
        };
        next_fire.send_replace(Some(next));
        tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;
        cursor = next;

        let snapshot = task.borrow().clone();
        match engine.dispatch(&snapshot).await {
            Ok(run_id) => {
                tracing::info!(task_id = %snapshot.id, %run_id, "cron fired");
            }
            Err(err) if err.code == ErrorCode::AlreadyRunning => {
                tracing::warn!(task_id = %snapshot.id, "cron fire skipped, previous run still running");
            }
            Err(err) => {
                tracing::warn!(task_id = %snapshot.id, error = %err, "cron dispatch failed");
            }
        }
    }
}
