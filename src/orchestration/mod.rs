//! Orchestration layer: the process engine and its collaborators.
//!
//! [`Process`] drives a [`TaskGraph`](crate::core::TaskGraph) under one of
//! three dispatch disciplines, assembling each task's context from the run's
//! ledger and compacting it against the budget before every dispatch.

mod manager;
mod process;
mod prompt;
mod report;

pub use manager::{parse_decision, AgentManager, FirstReadyManager, Manager, ManagerDecision};
pub use process::{Process, ProcessConfig, ProcessMode, ProcessStep};
pub use prompt::{build_task_prompt, ContextEntry};
pub use report::{Halt, ProcessEvent, RunReport, TaskResult};
