//! Managers for hierarchical dispatch.
//!
//! A [`Manager`] picks the next assignment from the live ready set. Its
//! answer is a structured [`ManagerDecision`]; the process engine validates
//! it and never trusts free-form text.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentId, AgentPool};
use crate::core::{Task, TaskId};
use crate::error::{Error, Result};
use crate::mlog_debug;
use crate::orchestration::prompt::build_manager_prompt;

/// A manager's choice for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ManagerDecision {
    Assign { task_id: TaskId, agent_id: AgentId },
    Done,
}

impl ManagerDecision {
    pub fn assign(task_id: impl Into<TaskId>, agent_id: impl Into<AgentId>) -> Self {
        ManagerDecision::Assign {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// Chooses assignments in hierarchical mode.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Pick the next assignment. `ready` is never empty.
    async fn decide(&self, ready: &[Task], agents: &AgentPool) -> Result<ManagerDecision>;
}

/// Deterministic manager: the first ready task, on its declared agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstReadyManager;

#[async_trait]
impl Manager for FirstReadyManager {
    async fn decide(&self, ready: &[Task], _agents: &AgentPool) -> Result<ManagerDecision> {
        Ok(ready
            .first()
            .map(|t| ManagerDecision::assign(t.id.clone(), t.agent_id.clone()))
            .unwrap_or(ManagerDecision::Done))
    }
}

/// Manager backed by an agent that answers in JSON.
pub struct AgentManager {
    agent: Arc<dyn Agent>,
}

impl AgentManager {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Manager for AgentManager {
    async fn decide(&self, ready: &[Task], agents: &AgentPool) -> Result<ManagerDecision> {
        let prompt = build_manager_prompt(ready, &agents.ids());
        let reply = self.agent.invoke(&prompt, &[]).await?;
        mlog_debug!("[manager] raw decision: {}", reply.text.trim());
        parse_decision(&reply.text)
    }
}

/// Parse a decision from agent text.
///
/// Tolerates surrounding prose and code fences by taking the outermost JSON
/// object in the text.
///
/// # Errors
///
/// Returns `ManagerAssignment` if no valid decision object is present.
pub fn parse_decision(text: &str) -> Result<ManagerDecision> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => {
            return Err(Error::ManagerAssignment(format!(
                "no decision object in manager reply: {}",
                text.trim()
            )))
        }
    };
    serde_json::from_str(json)
        .map_err(|e| Error::ManagerAssignment(format!("invalid manager decision: {}", e)))
}
