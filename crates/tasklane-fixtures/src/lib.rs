//! Test utilities and fixtures for tasklane integration tests.
//!
//! - [`TaskBuilder`] - Fluent API for constructing script and HTTP tasks
//! - [`temp_dir`] - Create unique temporary directories
//! - [`write_tasks`] / [`write_task`] / [`write_config`] - Serialize to JSON files
//! - [`StubServer`] - One-route HTTP server on a local port
//!
//! # Example
//!
//! ```ignore
//! use tasklane_fixtures::{StubServer, TaskBuilder};
//!
//! let server = StubServer::start(200, "ok").await;
//! let task = TaskBuilder::http(1, server.url("/health")).build();
//! ```

// Test fixtures crate - relaxed lints for test utilities
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::indexing_slicing)]

pub mod builders;
pub mod helpers;
pub mod http;

// Re-export commonly used items at crate root
pub use builders::TaskBuilder;
pub use helpers::{temp_dir, write_config, write_task, write_tasks};
pub use http::StubServer;
