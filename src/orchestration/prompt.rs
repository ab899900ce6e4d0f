//! Prompt assembly for task invocations.
//!
//! The engine hands context to agents inside the prompt; agents never read
//! the ledger. Context entries are already filtered by the optimizer.

use crate::agent::AgentId;
use crate::core::{Task, TaskId};

/// One piece of context handed to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Producing task, or `None` for the run input or a summary.
    pub source: Option<TaskId>,
    pub content: String,
}

impl ContextEntry {
    pub fn from_task(id: &TaskId, content: &str) -> Self {
        Self {
            source: Some(id.clone()),
            content: content.to_string(),
        }
    }

    pub fn anonymous(content: &str) -> Self {
        Self {
            source: None,
            content: content.to_string(),
        }
    }
}

/// Build the prompt for `task`.
///
/// The description comes first so that agents keyed on the first line (and
/// [`EchoAgent`](crate::agent::EchoAgent)) see the task itself.
pub fn build_task_prompt(task: &Task, context: &[ContextEntry]) -> String {
    let mut prompt = task.description.clone();

    if !task.expected_output.is_empty() {
        prompt.push_str("\n\nExpected output:\n");
        prompt.push_str(&task.expected_output);
    }

    if !context.is_empty() {
        prompt.push_str("\n\nContext:");
        for entry in context {
            match &entry.source {
                Some(id) => prompt.push_str(&format!("\n\n[{}]\n{}", id, entry.content)),
                None => prompt.push_str(&format!("\n\n{}", entry.content)),
            }
        }
    }

    prompt
}

/// Prompt for a manager choosing the next assignment.
pub fn build_manager_prompt(ready: &[Task], agents: &[AgentId]) -> String {
    let mut prompt = String::from(
        "Choose the next task to run. Reply with JSON only:\n\
         {\"decision\": \"assign\", \"task_id\": \"<id>\", \"agent_id\": \"<id>\"}\n\
         or {\"decision\": \"done\"} when no more work should run.\n\nReady tasks:",
    );
    for task in ready {
        prompt.push_str(&format!(
            "\n- {} (suggested agent: {}): {}",
            task.id, task.agent_id, task.description
        ));
    }
    prompt.push_str("\n\nAgents: ");
    let names: Vec<&str> = agents.iter().map(AgentId::as_str).collect();
    prompt.push_str(&names.join(", "));
    prompt
}
