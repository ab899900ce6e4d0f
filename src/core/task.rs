//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work assigned to agents. A [`TaskSpec`] is
//! the declaration a caller hands in; a [`Task`] is the live node the graph
//! owns, tracking its state, output, and timing.

use crate::agent::AgentId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of a task, as declared by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task state in its lifecycle.
///
/// `Pending -> Ready -> Running -> Completed | Failed`. A pending or ready
/// task may also fail directly when an upstream task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Declared, not yet scheduled.
    #[default]
    Pending,
    /// Selected for dispatch, waiting for its agent call to start.
    Ready,
    /// Agent call in flight.
    Running,
    /// Finished with an output.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    /// Whether the state is terminal (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// A task declaration, as read from a task file or built in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    pub agent_id: AgentId,
    /// Tasks whose outputs this task consumes, in order.
    #[serde(default, alias = "context_tasks")]
    pub depends_on: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, description: &str, agent_id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            expected_output: String::new(),
            agent_id: agent_id.into(),
            depends_on: Vec::new(),
            output_file: None,
        }
    }

    pub fn with_expected_output(mut self, expected: &str) -> Self {
        self.expected_output = expected.to_string();
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }
}

/// Wrapper for task files: `[[tasks]]` in TOML or `{"tasks": [...]}` in JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl TaskFile {
    /// Parse a task file, choosing the format from the file extension.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(&contents)?),
            Some("json") => Ok(serde_json::from_str(&contents)?),
            other => Err(Error::Validation(format!(
                "unsupported task file extension: {:?}",
                other
            ))),
        }
    }
}

/// A single task node in the execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub expected_output: String,
    pub agent_id: AgentId,
    /// Ordered dependency ids; their outputs form this task's context.
    pub context_tasks: Vec<TaskId>,
    pub output_file: Option<PathBuf>,
    pub state: TaskState,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            expected_output: spec.expected_output,
            agent_id: spec.agent_id,
            context_tasks: spec.depends_on,
            output_file: spec.output_file,
            state: TaskState::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, allowed: &[TaskState], to: TaskState) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(Error::InvalidTransition {
                task: self.id.clone(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Pending -> Ready.
    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(&[TaskState::Pending], TaskState::Ready)
    }

    /// Pending | Ready -> Running, recording the start time.
    pub fn start(&mut self) -> Result<()> {
        self.transition(&[TaskState::Pending, TaskState::Ready], TaskState::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Completed, storing the output for downstream context.
    pub fn complete(&mut self, output: String) -> Result<()> {
        self.transition(&[TaskState::Running], TaskState::Completed)?;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Any non-terminal state -> Failed.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.transition(
            &[TaskState::Pending, TaskState::Ready, TaskState::Running],
            TaskState::Failed,
        )?;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}
