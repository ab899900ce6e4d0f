//! Agent capability consumed by the process engine.
//!
//! An [`Agent`] is anything that turns a prompt (plus an optional tool list)
//! into a reply. The engine never sees transport details; LLM clients,
//! scripted test doubles and sub-workflows all sit behind the same trait.
//! Agents are stateless with respect to the context ledger: they receive
//! their context inside the prompt and never read or write ledger state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::context::estimate_tokens;
use crate::{Error, Result};

/// Identifier of an agent in an [`AgentPool`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema of a tool an agent may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::Value::Null,
        }
    }

    /// Tokens this schema occupies in the context window.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&serde_json::to_string(self).unwrap_or_default())
    }
}

/// A tool call reported by an agent, with its output if the agent ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub output: Option<String>,
}

/// Reply returned by [`Agent::invoke`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// Polymorphic executor for tasks.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Tools offered to this agent on every invocation.
    fn tools(&self) -> Vec<ToolSchema> {
        Vec::new()
    }

    /// Run one completion for `prompt`.
    async fn invoke(&self, prompt: &str, tools: &[ToolSchema]) -> Result<AgentReply>;
}

type AgentFn = dyn Fn(String) -> BoxFuture<'static, Result<AgentReply>> + Send + Sync;

/// Agent backed by an async closure.
pub struct FnAgent {
    f: Box<AgentFn>,
    tools: Vec<ToolSchema>,
}

impl FnAgent {
    /// Wrap a closure returning plain text.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            f: Box::new(move |prompt| f(prompt).map(|r| r.map(AgentReply::text)).boxed()),
            tools: Vec::new(),
        }
    }

    /// Wrap a closure returning a full [`AgentReply`].
    pub fn with_reply<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AgentReply>> + Send + 'static,
    {
        Self {
            f: Box::new(move |prompt| f(prompt).boxed()),
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn tools(&self) -> Vec<ToolSchema> {
        self.tools.clone()
    }

    async fn invoke(&self, prompt: &str, _tools: &[ToolSchema]) -> Result<AgentReply> {
        (self.f)(prompt.to_string()).await
    }
}

/// Offline agent that answers with the first line of its prompt.
///
/// Used by `maestro run` to exercise a graph without any provider.
pub struct EchoAgent {
    name: String,
}

impl EchoAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn invoke(&self, prompt: &str, _tools: &[ToolSchema]) -> Result<AgentReply> {
        let first = prompt.lines().next().unwrap_or_default();
        Ok(AgentReply::text(format!("[{}] {}", self.name, first)))
    }
}

/// Registry of agents available to a process run.
#[derive(Clone, Default)]
pub struct AgentPool {
    agents: HashMap<AgentId, Arc<dyn Agent>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<AgentId>, agent: Arc<dyn Agent>) {
        self.agents.insert(id.into(), agent);
    }

    pub fn with_agent(mut self, id: impl Into<AgentId>, agent: impl Agent + 'static) -> Self {
        self.register(id, Arc::new(agent));
        self
    }

    pub fn get(&self, id: &AgentId) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.clone()))
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool").field("agents", &self.ids()).finish()
    }
}
