//! Results and events produced by a process run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::context::{ContextLedger, OptimizationResult};
use crate::core::{TaskId, TaskState};
use crate::orchestration::process::ProcessMode;
use crate::workflow::GateOutcome;

/// Outcome of one task, as reported by [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    /// The agent that ran the task (the manager's choice in hierarchical mode).
    pub agent_id: AgentId,
    pub output: Option<String>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Loop iterations, for tasks wrapped in a loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<usize>,
}

/// Why a run stopped before every task finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Halt {
    /// A task failed and the process halts on failure.
    Failure { task: TaskId },
    /// A gate's condition did not hold on this task's output.
    Gate { task: TaskId },
    Cancelled,
    /// The manager ended the run with tasks still ready.
    ManagerDone,
}

impl std::fmt::Display for Halt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Halt::Failure { task } => write!(f, "halted on failure of {}", task),
            Halt::Gate { task } => write!(f, "halted at gate after {}", task),
            Halt::Cancelled => write!(f, "cancelled"),
            Halt::ManagerDone => write!(f, "manager signalled done"),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: ProcessMode,
    /// One entry per task, in declaration order.
    pub results: Vec<TaskResult>,
    pub halt: Option<Halt>,
    pub ledger: ContextLedger,
    /// Compaction passes that actually ran.
    pub compactions: Vec<OptimizationResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn result(&self, id: &TaskId) -> Option<&TaskResult> {
        self.results.iter().find(|r| &r.task_id == id)
    }

    pub fn state_of(&self, id: &TaskId) -> Option<TaskState> {
        self.result(id).map(|r| r.state)
    }

    pub fn failed(&self) -> Vec<&TaskResult> {
        self.results
            .iter()
            .filter(|r| r.state == TaskState::Failed)
            .collect()
    }

    /// Whether every task completed and nothing halted the run.
    pub fn is_success(&self) -> bool {
        self.halt.is_none() && self.results.iter().all(|r| r.state == TaskState::Completed)
    }

    /// Output of the last completed task in declaration order.
    pub fn final_output(&self) -> Option<&str> {
        self.results
            .iter()
            .rev()
            .find(|r| r.state == TaskState::Completed)
            .and_then(|r| r.output.as_deref())
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Lifecycle events emitted while a process runs.
///
/// These let callers observe progress without polling the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    TaskStarted { task_id: TaskId, agent_id: AgentId },
    TaskCompleted { task_id: TaskId },
    TaskFailed { task_id: TaskId, error: String },
    GateEvaluated { task_id: TaskId, outcome: GateOutcome },
    Compacted { result: OptimizationResult },
    Finished { halt: Option<Halt> },
}
