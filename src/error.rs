use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic dependency detected: {}", format_cycle(.path))]
    CyclicDependency { path: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid state transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Task {task} failed: {message}")]
    TaskExecution { task: TaskId, message: String },

    #[error("Budget configuration error: {0}")]
    BudgetConfiguration(String),

    #[error("Manager assignment error: {0}")]
    ManagerAssignment(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Loop exhausted after {iterations} iterations without meeting its condition")]
    LoopExhausted { iterations: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Whether the error is raised while building a graph or a budget,
    /// before any agent is invoked.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Error::CyclicDependency { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
                | Error::BudgetConfiguration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
