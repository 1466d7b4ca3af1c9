//! Storage collaborator interfaces and an in-memory implementation.
//!
//! Task definitions and run history live outside the engine. The engine only
//! needs to read tasks and to create and update run rows, each as a single
//! atomic write.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::model::{RunId, RunRecord, Task, TaskId};

/// Read access to task definitions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_tasks(&self) -> EngineResult<Vec<Task>>;
    async fn get_task(&self, id: TaskId) -> EngineResult<Option<Task>>;
}

/// Run history.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &RunRecord) -> EngineResult<()>;
    async fn update_run(&self, run: &RunRecord) -> EngineResult<()>;
    async fn get_run(&self, id: RunId) -> EngineResult<Option<RunRecord>>;
    /// Runs of one task, newest first.
    async fn list_runs(&self, task_id: TaskId) -> EngineResult<Vec<RunRecord>>;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    tasks: Arc<RwLock<BTreeMap<TaskId, Task>>>,
    runs: Arc<RwLock<HashMap<RunId, RunRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        for task in tasks {
            store.put_task(task).await;
        }
        store
    }

    /// Insert or replace a task definition. Returns the previous version.
    pub async fn put_task(&self, task: Task) -> Option<Task> {
        self.tasks.write().await.insert(task.id, task)
    }

    pub async fn remove_task(&self, id: TaskId) -> Option<Task> {
        self.tasks.write().await.remove(&id)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn list_tasks(&self) -> EngineResult<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn get_task(&self, id: TaskId) -> EngineResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: &RunRecord) -> EngineResult<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(EngineError::storage(
                "run already exists",
                format!("duplicate run id {}", run.id),
            ));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &RunRecord) -> EngineResult<()> {
        match self.runs.write().await.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(EngineError::not_found("run", run.id)),
        }
    }

    async fn get_run(&self, id: RunId) -> EngineResult<Option<RunRecord>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_runs(&self, task_id: TaskId) -> EngineResult<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| run.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::model::{RunStatus, TaskKind, TaskStatus};
    use chrono::{Duration, Utc};

    fn task(id: u64) -> Task {
        Task {
            id: TaskId(id),
            name: format!("t{id}"),
            description: String::new(),
            kind: TaskKind::Script {
                script: "echo hi".to_string(),
            },
            timeout_seconds: 0,
            status: TaskStatus::Active,
            enable_cron: false,
            cron_expr: String::new(),
        }
    }

    #[tokio::test]
    async fn tasks_round_trip() {
        let store = MemoryStore::with_tasks([task(2), task(1)]).await;
        let ids: Vec<TaskId> = store
            .list_tasks()
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![TaskId(1), TaskId(2)]);
        assert!(store.get_task(TaskId(3)).await.unwrap().is_none());
        assert!(store.remove_task(TaskId(1)).await.is_some());
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_history_is_newest_first() {
        let store = MemoryStore::new();
        let task = task(1);
        let mut older = RunRecord::start(&task);
        older.start_time = Utc::now() - Duration::minutes(5);
        let newer = RunRecord::start(&task);
        store.create_run(&older).await.unwrap();
        store.create_run(&newer).await.unwrap();
        store.create_run(&RunRecord::start(&self::task(9))).await.unwrap();

        let runs = store.list_runs(TaskId(1)).await.unwrap();
        let ids: Vec<RunId> = runs.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn update_replaces_and_unknown_is_not_found() {
        let store = MemoryStore::new();
        let mut run = RunRecord::start(&task(1));
        store.create_run(&run).await.unwrap();
        assert_eq!(
            store.create_run(&run).await.unwrap_err().code,
            ErrorCode::Storage
        );

        run.finish(RunStatus::Success, "ok".into(), String::new(), Utc::now());
        store.update_run(&run).await.unwrap();
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Success
        );

        let stranger = RunRecord::start(&task(1));
        assert_eq!(
            store.update_run(&stranger).await.unwrap_err().code,
            ErrorCode::NotFound
        );
    }
}
