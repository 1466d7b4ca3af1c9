// Test module - relaxed lint rules
#![cfg(unix)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Script execution through the engine
//!
//! Requires `bash` on the PATH.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tasklane::runner::progress::NoopProgress;
use tasklane::session::{ActiveRuns, ProcessOutcome, RunLimits, ScriptProcess, ScriptSpec};
use tasklane::{
    Engine, EngineConfig, ErrorCode, LiveProgress, MemoryStore, OverlapPolicy, RunId, RunStatus,
    RunStore, TaskId,
};
use tasklane_fixtures::TaskBuilder;

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_output_poll_interval_ms(50)
        .with_stop_grace_ms(500)
}

fn engine(config: EngineConfig) -> (Engine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(config, store.clone());
    (engine, store)
}

async fn finish(engine: &Engine, run_id: RunId) -> LiveProgress {
    engine
        .wait_for_terminal(run_id, Duration::from_secs(15))
        .await
        .expect("run did not finish in time")
}

async fn wait_for_output(engine: &Engine, run_id: RunId, needle: &str) -> LiveProgress {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let progress = engine.get_progress(run_id).await.expect("run not tracked");
        if progress.output.contains(needle) {
            return progress;
        }
        assert!(Instant::now() < deadline, "output never contained {needle:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[tokio::test]
async fn successful_script_captures_output() {
    let (engine, store) = engine(fast_config());
    let task = TaskBuilder::script(1, "echo hello").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = finish(&engine, run_id).await;

    assert_eq!(progress.status, RunStatus::Success);
    assert_eq!(progress.output.trim(), "hello");
    assert_eq!(progress.progress, 100);
    assert!(progress.error.is_empty());

    let record = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.output.trim(), "hello");
    assert!(record.end_time.is_some());
}

#[tokio::test]
async fn stderr_is_captured_with_stdout() {
    let (engine, _store) = engine(fast_config());
    let task = TaskBuilder::script(1, "echo out\necho err 1>&2").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = finish(&engine, run_id).await;

    assert_eq!(progress.status, RunStatus::Success);
    assert!(progress.output.contains("out"));
    assert!(progress.output.contains("err"));
}

#[tokio::test]
async fn non_zero_exit_fails_with_code() {
    let (engine, _store) = engine(fast_config());
    let task = TaskBuilder::script(1, "echo partial\nexit 3").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = finish(&engine, run_id).await;

    assert_eq!(progress.status, RunStatus::Failed);
    assert_eq!(progress.error, "execution failed: exit code 3");
    assert!(progress.output.contains("partial"));
}

#[tokio::test]
async fn strict_mode_stops_on_first_failure() {
    let (engine, _store) = engine(fast_config());
    let task = TaskBuilder::script(1, "false\necho unreachable").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = finish(&engine, run_id).await;

    assert_eq!(progress.status, RunStatus::Failed);
    assert!(!progress.output.contains("unreachable"));
}

#[tokio::test]
async fn script_runs_in_private_directory() {
    let (engine, _store) = engine(fast_config());
    let cwd = std::env::current_dir().unwrap();
    let task = TaskBuilder::script(1, "pwd").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = finish(&engine, run_id).await;

    assert_eq!(progress.status, RunStatus::Success);
    assert_ne!(progress.output.trim(), cwd.display().to_string());
    assert!(progress.output.contains("task_run_"));
}

// =============================================================================
// Timeout and stop
// =============================================================================

#[tokio::test]
async fn timeout_terminates_and_reports_seconds() {
    let (engine, _store) = engine(fast_config());
    let task = TaskBuilder::script(1, "echo begin\nsleep 10").with_timeout(1).build();

    let started = Instant::now();
    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = finish(&engine, run_id).await;

    assert_eq!(progress.status, RunStatus::Failed);
    assert_eq!(progress.error, "execution timeout after 1s");
    assert!(progress.output.contains("begin"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(engine.active_runs().is_empty().await);
}

#[tokio::test]
async fn stop_marks_run_failed_and_second_stop_is_rejected() {
    let (engine, store) = engine(fast_config());
    let task = TaskBuilder::script(1, "echo started\nsleep 30").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    wait_for_output(&engine, run_id, "started").await;
    assert_eq!(engine.list_running().await.len(), 1);

    engine.stop_run(run_id).await.unwrap();
    let progress = finish(&engine, run_id).await;
    assert_eq!(progress.status, RunStatus::Failed);
    assert_eq!(progress.error, "stopped by user");
    assert!(progress.output.contains("started"));

    let err = engine.stop_run(run_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotRunning);
    let record = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error, "stopped by user");
}

#[tokio::test]
async fn stop_unknown_run_is_not_found() {
    let (engine, _store) = engine(fast_config());
    let err = engine.stop_run(RunId::new()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn partial_output_is_visible_while_running() {
    let (engine, _store) = engine(fast_config());
    let task = TaskBuilder::script(1, "echo first\nsleep 2\necho second").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = wait_for_output(&engine, run_id, "first").await;
    assert_eq!(progress.status, RunStatus::Running);
    assert!(!progress.output.contains("second"));

    let progress = finish(&engine, run_id).await;
    assert_eq!(progress.status, RunStatus::Success);
    assert!(progress.output.contains("second"));
}

#[tokio::test]
async fn unterminated_line_is_visible_while_running() {
    let (engine, _store) = engine(fast_config());
    let task = TaskBuilder::script(1, "printf 'working...'\nsleep 5").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    let progress = wait_for_output(&engine, run_id, "working...").await;
    assert_eq!(progress.status, RunStatus::Running);

    engine.stop_run(run_id).await.unwrap();
    let progress = finish(&engine, run_id).await;
    assert_eq!(progress.error, "stopped by user");
    assert!(progress.output.starts_with("working..."));
}

// =============================================================================
// Rejection before execution
// =============================================================================

#[tokio::test]
async fn unsafe_script_is_recorded_but_never_runs() {
    let (engine, store) = engine(fast_config());
    let task = TaskBuilder::script(1, "rm -rf /").build();

    let err = engine.dispatch(&task).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsafeScript);
    assert!(err.message.contains("unsafe command detected: rm -rf"));

    let run_id = err.run_id().expect("rejected run id in context");
    let progress = engine.get_progress(run_id).await.unwrap();
    assert_eq!(progress.status, RunStatus::Failed);
    assert!(progress.error.starts_with("script contains unsafe commands"));
    assert!(engine.active_runs().is_empty().await);

    let runs = store.list_runs(TaskId(1)).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn overlapping_runs_are_allowed_by_default() {
    let (engine, _store) = engine(fast_config());
    let task = TaskBuilder::script(1, "sleep 1").build();

    let first = engine.dispatch(&task).await.unwrap();
    let second = engine.dispatch(&task).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(engine.list_running().await.len(), 2);

    finish(&engine, first).await;
    finish(&engine, second).await;
}

#[tokio::test]
async fn skip_policy_rejects_second_dispatch() {
    let (engine, store) = engine(fast_config().with_overlap(OverlapPolicy::Skip));
    let task = TaskBuilder::script(1, "sleep 30").build();

    let first = engine.dispatch(&task).await.unwrap();
    let err = engine.dispatch(&task).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyRunning);
    assert_eq!(store.list_runs(TaskId(1)).await.unwrap().len(), 1);

    engine.stop_run(first).await.unwrap();
    finish(&engine, first).await;

    let other = TaskBuilder::script(2, "echo other").build();
    let run_id = engine.dispatch(&other).await.unwrap();
    assert_eq!(finish(&engine, run_id).await.status, RunStatus::Success);
}

#[tokio::test]
async fn finished_progress_expires_after_retention() {
    let config = fast_config().with_progress_retention(Duration::from_secs(1));
    let (engine, store) = engine(config);
    let task = TaskBuilder::script(1, "echo bye").build();

    let run_id = engine.dispatch(&task).await.unwrap();
    finish(&engine, run_id).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(engine.get_progress(run_id).await.is_none());
    assert!(store.get_run(run_id).await.unwrap().is_some());
    assert_eq!(
        engine.stop_run(run_id).await.unwrap_err().code,
        ErrorCode::NotRunning
    );
}

// =============================================================================
// Process controller
// =============================================================================

#[tokio::test]
async fn temp_files_are_removed_after_exit() {
    let run_id = RunId::new();
    let stop = ActiveRuns::new().register(run_id).await;
    let process = ScriptProcess::spawn(ScriptSpec::new(run_id, "echo hi")).unwrap();
    let script = process.script_path().to_path_buf();
    let workdir = process.workdir().to_path_buf();
    assert!(script.exists());
    assert!(workdir.is_dir());

    let outcome = process
        .run(RunLimits::with_deadline(Duration::from_secs(5)), &NoopProgress, &stop)
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Exited { success: true, .. }));
    assert!(!script.exists());
    assert!(!workdir.exists());
}

#[tokio::test]
async fn temp_files_are_removed_after_failure() {
    let run_id = RunId::new();
    let stop = ActiveRuns::new().register(run_id).await;
    let process = ScriptProcess::spawn(ScriptSpec::new(run_id, "exit 3")).unwrap();
    let script = process.script_path().to_path_buf();
    let workdir = process.workdir().to_path_buf();

    let outcome = process
        .run(RunLimits::with_deadline(Duration::from_secs(5)), &NoopProgress, &stop)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Exited {
            code: Some(3),
            success: false,
            ..
        }
    ));
    assert!(!script.exists());
    assert!(!workdir.exists());
}

#[tokio::test]
async fn temp_files_are_removed_after_stop() {
    let run_id = RunId::new();
    let stop = ActiveRuns::new().register(run_id).await;
    let process = ScriptProcess::spawn(ScriptSpec::new(run_id, "sleep 30")).unwrap();
    let script = process.script_path().to_path_buf();
    let workdir = process.workdir().to_path_buf();

    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.request_stop().unwrap();
    });

    let mut limits = RunLimits::with_deadline(Duration::from_secs(20));
    limits.stop_grace = Duration::from_millis(500);
    let started = Instant::now();
    let outcome = process.run(limits, &NoopProgress, &stop).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Stopped { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!script.exists());
    assert!(!workdir.exists());
}

#[tokio::test]
async fn temp_files_are_removed_after_timeout() {
    let run_id = RunId::new();
    let stop = ActiveRuns::new().register(run_id).await;
    let process = ScriptProcess::spawn(ScriptSpec::new(run_id, "sleep 10")).unwrap();
    let script = process.script_path().to_path_buf();

    let mut limits = RunLimits::with_deadline(Duration::from_millis(300));
    limits.stop_grace = Duration::from_millis(200);
    let outcome = process.run(limits, &NoopProgress, &stop).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
    assert!(!script.exists());
}

#[tokio::test]
async fn output_is_capped() {
    let run_id = RunId::new();
    let stop = ActiveRuns::new().register(run_id).await;
    let mut spec = ScriptSpec::new(run_id, "for i in 1 2 3 4 5 6 7 8 9 10; do echo line-$i; done");
    spec.max_output_bytes = 20;
    let process = ScriptProcess::spawn(spec).unwrap();

    let outcome = process
        .run(RunLimits::with_deadline(Duration::from_secs(5)), &NoopProgress, &stop)
        .await
        .unwrap();
    assert!(outcome.output().ends_with("[output truncated]\n"));
    assert!(!outcome.output().contains("line-10"));
}
