//! Tasklane: a cron-driven task scheduling and execution engine.
//!
//! Tasks are either shell scripts or outbound HTTP requests. The engine runs
//! them on demand or on a cron schedule, tracks live progress in memory,
//! records run history through a storage collaborator, and can stop an
//! in-flight script together with every process it spawned.

#![forbid(unsafe_code)]
// Library documentation is in progress. Public API types have docs;
// internal types will be documented in future releases.
#![allow(missing_docs)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod store;

pub use crate::config::{EngineConfig, OverlapPolicy};
pub use crate::engine::Engine;
pub use crate::error::{EngineError, EngineResult, ErrorCode};
pub use crate::model::*;
pub use crate::scheduler::{CronExpr, CronScheduler};
pub use crate::store::{MemoryStore, RunStore, TaskStore};
