//! Repeat: run a step until a condition holds (evaluator-optimizer loop).
//!
//! Each iteration substitutes `{{previous}}` in the prompt, invokes the
//! [`Step`], records the output, notifies `on_iteration`, and evaluates
//! `until`. The loop ends in exactly one of three ways:
//!
//! - the condition held: `condition_met = true`
//! - iterations ran out: `max_reached = true, condition_met = false`
//! - the step failed or the run was cancelled: the error is returned

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, ToolSchema};
use crate::error::{Error, Result};
use crate::workflow::predicate::Predicate;
use crate::workflow::template::substitute_previous;
use crate::{mlog_debug, mlog_trace};

/// Default iteration cap.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// The one capability Repeat drives.
///
/// Agents, closures and sub-workflows are adapted to this at the boundary.
#[async_trait]
pub trait Step: Send + Sync {
    /// Produce the next output from the substituted prompt and the
    /// previous output, if any.
    async fn invoke(&self, prompt: &str, previous: Option<&str>) -> Result<String>;
}

type StepFn = dyn Fn(String, Option<String>) -> BoxFuture<'static, Result<String>> + Send + Sync;

/// Step backed by an async closure.
pub struct FnStep {
    f: Box<StepFn>,
}

impl FnStep {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            f: Box::new(move |prompt, previous| f(prompt, previous).boxed()),
        }
    }
}

#[async_trait]
impl Step for FnStep {
    async fn invoke(&self, prompt: &str, previous: Option<&str>) -> Result<String> {
        (self.f)(prompt.to_string(), previous.map(str::to_string)).await
    }
}

/// Step that sends the substituted prompt to an agent.
pub struct AgentStep {
    agent: Arc<dyn Agent>,
    tools: Vec<ToolSchema>,
}

impl AgentStep {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        let tools = agent.tools();
        Self { agent, tools }
    }
}

#[async_trait]
impl Step for AgentStep {
    async fn invoke(&self, prompt: &str, _previous: Option<&str>) -> Result<String> {
        Ok(self.agent.invoke(prompt, &self.tools).await?.text)
    }
}

/// Snapshot handed to `until` and `on_iteration`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepeatContext {
    /// Zero-based index of the iteration that just ran.
    pub iteration: usize,
    pub last_output: String,
    /// Every output so far, oldest first.
    pub history: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ConditionMet,
    MaxReached,
}

/// Summary of a finished loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatResult {
    /// Last output.
    pub result: Option<String>,
    pub iterations: Vec<String>,
    pub count: usize,
    pub condition_met: bool,
    pub max_reached: bool,
}

impl RepeatResult {
    pub fn stop_reason(&self) -> StopReason {
        if self.condition_met {
            StopReason::ConditionMet
        } else {
            StopReason::MaxReached
        }
    }
}

/// Loop settings read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    pub max_iterations: usize,
    /// Pause between iterations, in milliseconds.
    pub delay_ms: Option<u64>,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            delay_ms: None,
        }
    }
}

type IterationHook = dyn Fn(&RepeatContext) + Send + Sync;

/// Configured loop, reusable across runs.
#[derive(Clone)]
pub struct Repeat {
    max_iterations: usize,
    until: Option<Predicate<RepeatContext>>,
    on_iteration: Option<Arc<IterationHook>>,
    delay: Option<Duration>,
    metadata: HashMap<String, serde_json::Value>,
    cancel: Option<CancellationToken>,
}

impl Default for Repeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Repeat {
    pub fn new() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            until: None,
            on_iteration: None,
            delay: None,
            metadata: HashMap::new(),
            cancel: None,
        }
    }

    pub fn from_config(config: &RepeatConfig) -> Self {
        let mut repeat = Self::new().with_max_iterations(config.max_iterations);
        if let Some(ms) = config.delay_ms {
            repeat = repeat.with_delay(Duration::from_millis(ms));
        }
        repeat
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Stop once `predicate` holds.
    pub fn until(mut self, predicate: Predicate<RepeatContext>) -> Self {
        self.until = Some(predicate);
        self
    }

    /// Stop once the closure returns true.
    pub fn until_fn<F>(self, f: F) -> Self
    where
        F: Fn(&RepeatContext) -> bool + Send + Sync + 'static,
    {
        self.until(Predicate::new(f))
    }

    /// Observe each iteration. The hook cannot influence control flow.
    pub fn on_iteration<F>(mut self, f: F) -> Self
    where
        F: Fn(&RepeatContext) + Send + Sync + 'static,
    {
        self.on_iteration = Some(Arc::new(f));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Run `step` from `prompt` until the condition holds or iterations run out.
    ///
    /// # Errors
    /// - `Validation` if `max_iterations` is zero
    /// - `Cancelled` if the token fires before an iteration or during a delay
    /// - any error returned by the step
    pub async fn run(&self, step: &dyn Step, prompt: &str) -> Result<RepeatResult> {
        if self.max_iterations == 0 {
            return Err(Error::Validation(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let mut ctx = RepeatContext {
            metadata: self.metadata.clone(),
            ..Default::default()
        };

        for iteration in 0..self.max_iterations {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let previous = ctx.history.last().map(String::as_str);
            let rendered = substitute_previous(prompt, previous);
            mlog_trace!("[repeat] iteration {} prompt: {}", iteration, rendered);

            let output = step.invoke(&rendered, previous).await?;

            ctx.iteration = iteration;
            ctx.last_output = output.clone();
            ctx.history.push(output);

            if let Some(hook) = &self.on_iteration {
                hook(&ctx);
            }

            let met = match &self.until {
                Some(predicate) => predicate.evaluate(&ctx).await,
                None => false,
            };
            mlog_debug!(
                "[repeat] iteration {}/{} condition_met={}",
                iteration + 1,
                self.max_iterations,
                met
            );

            if met {
                return Ok(self.finish(ctx, true));
            }

            let more = iteration + 1 < self.max_iterations;
            if let (Some(delay), true) = (self.delay, more) {
                self.pause(delay).await?;
            }
        }

        Ok(self.finish(ctx, false))
    }

    fn finish(&self, ctx: RepeatContext, condition_met: bool) -> RepeatResult {
        RepeatResult {
            result: ctx.history.last().cloned(),
            count: ctx.history.len(),
            iterations: ctx.history,
            condition_met,
            max_reached: !condition_met,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Repeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repeat")
            .field("max_iterations", &self.max_iterations)
            .field("has_until", &self.until.is_some())
            .field("delay", &self.delay)
            .finish()
    }
}
