//! Core domain models for orchestration.
//!
//! Tasks, their declarations, and the dependency graph that decides which
//! of them are ready to run.

pub mod graph;
pub mod task;

pub use graph::TaskGraph;
pub use task::{Task, TaskFile, TaskId, TaskSpec, TaskState};
