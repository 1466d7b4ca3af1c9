// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Loading task and engine definitions from disk.

use std::fs;

use tasklane::config::{load_config_file, load_task_file, load_tasks_file};
use tasklane::{EngineConfig, ErrorCode, OverlapPolicy, TaskId, TaskKind, TaskStatus};
use tasklane_fixtures::{temp_dir, write_config, write_task, write_tasks, TaskBuilder};

#[test]
fn yaml_task_list_loads_both_kinds() {
    let dir = temp_dir("yaml-tasks");
    let path = dir.join("tasks.yaml");
    fs::write(
        &path,
        r#"
- id: 1
  name: nightly-report
  type: script
  script: |
    echo building report
  enable_cron: true
  cron_expr: "0 2 * * *"
- id: 2
  name: ping
  type: http
  url: http://127.0.0.1:8080/health
  method: HEAD
  headers: '{"Accept": "text/plain"}'
  timeout_seconds: 5
  status: inactive
"#,
    )
    .unwrap();

    let tasks = load_tasks_file(&path).unwrap();
    assert_eq!(tasks.len(), 2);

    assert_eq!(tasks[0].id, TaskId(1));
    assert!(tasks[0].wants_schedule());
    assert!(matches!(&tasks[0].kind, TaskKind::Script { script } if script.contains("building report")));

    assert_eq!(tasks[1].status, TaskStatus::Inactive);
    assert_eq!(tasks[1].timeout_seconds, 5);
    match &tasks[1].kind {
        TaskKind::Http(spec) => {
            assert_eq!(spec.method, "HEAD");
            assert!(spec.headers.contains("Accept"));
        }
        other => panic!("expected http task, got {other:?}"),
    }
    fs::remove_dir_all(dir).ok();
}

#[test]
fn json_files_written_by_fixtures_load_back() {
    let dir = temp_dir("json-defs");
    let tasks = vec![
        TaskBuilder::script(1, "echo a").with_cron("*/5 * * * *").build(),
        TaskBuilder::http(2, "http://127.0.0.1/")
            .with_method("POST")
            .with_body("{}")
            .build(),
    ];
    write_tasks(&dir.join("tasks.json"), &tasks);
    write_task(&dir.join("task.json"), &tasks[1]);
    let config = EngineConfig::default().with_overlap(OverlapPolicy::Skip);
    write_config(&dir.join("engine.json"), &config);

    assert_eq!(load_tasks_file(&dir.join("tasks.json")).unwrap(), tasks);
    assert_eq!(load_task_file(&dir.join("task.json")).unwrap(), tasks[1]);
    assert_eq!(load_config_file(&dir.join("engine.json")).unwrap(), config);
    fs::remove_dir_all(dir).ok();
}

#[test]
fn unknown_task_type_is_config_error() {
    let dir = temp_dir("bad-type");
    let path = dir.join("task.json");
    fs::write(&path, r#"{"id": 1, "name": "x", "type": "ftp"}"#).unwrap();

    let err = load_task_file(&path).unwrap_err();
    assert_eq!(err.code, ErrorCode::Config);
    fs::remove_dir_all(dir).ok();
}
