//! Process engine: runs a task graph under one dispatch discipline.
//!
//! The mode is fixed when the [`Process`] is built:
//!
//! - **Sequential** runs tasks in declaration order. Dependencies only
//!   choose which outputs a task sees as context.
//! - **Hierarchical** asks a [`Manager`] for one assignment per round and
//!   validates it against the live ready set before anything runs.
//! - **Workflow** resolves dependencies, runs ready tasks (concurrently up
//!   to `max_concurrency`), and applies gates and loops.
//!
//! Agent failures, timeouts and output-file errors are recorded on the task
//! and never escape [`Process::run`]. Only construction problems, an invalid
//! manager assignment, or a manager error do.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Agent, AgentId, AgentPool, ToolCall, ToolSchema};
use crate::context::{
    estimate_tokens, BudgetAllocation, ContextLedger, ContextOptimizer, EntryKind,
    OptimizationResult, RunMode, Segment, Strategy, Summarizer, WARNING_THRESHOLD,
};
use crate::core::{Task, TaskGraph, TaskId, TaskSpec, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::manager::{FirstReadyManager, Manager, ManagerDecision};
use crate::orchestration::prompt::{build_task_prompt, ContextEntry};
use crate::orchestration::report::{Halt, ProcessEvent, RunReport, TaskResult};
use crate::workflow::{has_previous, Gate, GateContext, GateOutcome, Repeat, Step};
use crate::{mlog, mlog_debug, mlog_error, mlog_warn};

/// Dispatch discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    #[default]
    Sequential,
    Hierarchical,
    Workflow,
}

impl std::fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessMode::Sequential => write!(f, "sequential"),
            ProcessMode::Hierarchical => write!(f, "hierarchical"),
            ProcessMode::Workflow => write!(f, "workflow"),
        }
    }
}

impl std::str::FromStr for ProcessMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(ProcessMode::Sequential),
            "hierarchical" => Ok(ProcessMode::Hierarchical),
            "workflow" => Ok(ProcessMode::Workflow),
            other => Err(Error::Validation(format!("unknown process mode: {}", other))),
        }
    }
}

/// Per-process settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub mode: ProcessMode,
    /// Picks the default compaction threshold.
    pub run_mode: RunMode,
    /// Overrides the run mode's threshold when set.
    pub compaction_threshold: Option<f64>,
    pub strategy: Strategy,
    /// Stop at the first failed task (sequential and hierarchical).
    pub halt_on_failure: bool,
    /// Ready tasks dispatched together in workflow mode.
    pub max_concurrency: usize,
    pub task_timeout_secs: Option<u64>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            mode: ProcessMode::Sequential,
            run_mode: RunMode::Interactive,
            compaction_threshold: None,
            strategy: Strategy::Smart,
            halt_on_failure: true,
            max_concurrency: 1,
            task_timeout_secs: None,
        }
    }
}

impl ProcessConfig {
    pub fn new(mode: ProcessMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Fraction of the usable budget at which compaction triggers.
    pub fn threshold(&self) -> f64 {
        self.compaction_threshold
            .unwrap_or_else(|| self.run_mode.default_threshold())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// # Errors
    ///
    /// Returns `Validation` for a threshold outside `(0, 1]` or a zero
    /// concurrency limit.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.threshold();
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Validation(format!(
                "compaction threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Executes task graphs against an agent pool.
pub struct Process {
    config: ProcessConfig,
    allocation: BudgetAllocation,
    optimizer: ContextOptimizer,
    /// Optimizer at the warning level, used only for previews.
    preview: ContextOptimizer,
    gates: HashMap<TaskId, Gate>,
    loops: HashMap<TaskId, Repeat>,
    manager: Arc<dyn Manager>,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<ProcessEvent>>,
}

impl Process {
    /// Build a process, validating the configuration and budget.
    ///
    /// # Errors
    ///
    /// - `BudgetConfiguration` if the fixed segments exceed the usable budget
    /// - `Validation` for an invalid threshold or concurrency limit
    pub fn new(config: ProcessConfig, allocation: BudgetAllocation) -> Result<Self> {
        allocation.validate()?;
        config.validate()?;
        Ok(Self {
            optimizer: ContextOptimizer::new(config.threshold()),
            preview: ContextOptimizer::new(WARNING_THRESHOLD),
            config,
            allocation,
            gates: HashMap::new(),
            loops: HashMap::new(),
            manager: Arc::new(FirstReadyManager),
            cancel: CancellationToken::new(),
            events: None,
        })
    }

    /// Attach a gate to `task`, evaluated on its output in workflow mode.
    pub fn with_gate(mut self, task: impl Into<TaskId>, gate: Gate) -> Self {
        self.gates.insert(task.into(), gate);
        self
    }

    /// Wrap `task` in a loop. The task completes only once the loop's
    /// condition holds.
    pub fn with_loop(mut self, task: impl Into<TaskId>, repeat: Repeat) -> Self {
        self.loops.insert(task.into(), repeat);
        self
    }

    pub fn with_manager(mut self, manager: impl Manager + 'static) -> Self {
        self.manager = Arc::new(manager);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.optimizer = self.optimizer.with_summarizer(Arc::clone(&summarizer));
        self.preview = self.preview.with_summarizer(summarizer);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn allocation(&self) -> &BudgetAllocation {
        &self.allocation
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ========== Entry Points ==========

    pub async fn run(&self, graph: &mut TaskGraph, agents: &AgentPool) -> Result<RunReport> {
        self.run_with_ledger(graph, agents, None, ContextLedger::new())
            .await
    }

    /// Run with `input` recorded as context visible to every task.
    pub async fn run_with_input(
        &self,
        graph: &mut TaskGraph,
        agents: &AgentPool,
        input: &str,
    ) -> Result<RunReport> {
        self.run_with_ledger(graph, agents, Some(input), ContextLedger::new())
            .await
    }

    /// Run on a caller-seeded ledger (system prompt, memory, ...).
    ///
    /// # Errors
    ///
    /// - `Validation` if a gate or loop names a task missing from `graph`
    /// - `ManagerAssignment` if the manager picks a task that is not ready or
    ///   an agent that is not in the pool
    /// - any error the manager itself returns
    pub async fn run_with_ledger(
        &self,
        graph: &mut TaskGraph,
        agents: &AgentPool,
        input: Option<&str>,
        ledger: ContextLedger,
    ) -> Result<RunReport> {
        self.check_attachments(graph)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        mlog!(
            "[process] run {} started: mode={}, tasks={}, usable={}, history={}",
            run_id,
            self.config.mode,
            graph.len(),
            self.allocation.usable_budget(),
            self.allocation.history_budget()
        );

        let mut state = RunState::new(ledger);
        self.register_tools(graph, agents, &mut state);
        if let Some(input) = input {
            state.ledger.record(EntryKind::Input, None, input);
        }
        // Tasks finished before this run still feed their dependents.
        for task in graph.tasks().filter(|t| t.state == TaskState::Completed) {
            if let Some(output) = &task.output {
                state
                    .ledger
                    .record(EntryKind::Output, Some(task.id.clone()), output);
            }
        }

        match self.config.mode {
            ProcessMode::Sequential => self.run_sequential(graph, agents, &mut state).await?,
            ProcessMode::Hierarchical => {
                self.run_hierarchical(graph, agents, &mut state).await?
            }
            ProcessMode::Workflow => self.run_workflow(graph, agents, &mut state).await?,
        }

        let results = graph
            .tasks()
            .map(|task| TaskResult {
                task_id: task.id.clone(),
                agent_id: state
                    .assigned
                    .get(&task.id)
                    .cloned()
                    .unwrap_or_else(|| task.agent_id.clone()),
                output: task.output.clone(),
                state: task.state,
                error: task.error.clone(),
                iterations: state.iterations.get(&task.id).copied(),
            })
            .collect();

        match &state.halt {
            Some(halt) => mlog_warn!("[process] run {} {}", run_id, halt),
            None => mlog!("[process] run {} finished", run_id),
        }
        mlog_debug!("[process] {}", state.ledger.to_log_string());
        self.emit(ProcessEvent::Finished {
            halt: state.halt.clone(),
        });

        Ok(RunReport {
            run_id,
            mode: self.config.mode,
            results,
            halt: state.halt,
            ledger: state.ledger,
            compactions: state.compactions,
            started_at,
            finished_at: Utc::now(),
        })
    }

    // ========== Dispatch Disciplines ==========

    async fn run_sequential(
        &self,
        graph: &mut TaskGraph,
        agents: &AgentPool,
        state: &mut RunState,
    ) -> Result<()> {
        let mut previous: Option<TaskId> = None;

        for id in graph.ids() {
            if self.cancel.is_cancelled() {
                state.halt = Some(Halt::Cancelled);
                break;
            }

            let task = lookup(graph, &id)?;
            if task.state != TaskState::Pending {
                mlog_debug!("[process] skipping task {} ({})", id, task.state);
                if task.state == TaskState::Completed {
                    previous = Some(id);
                }
                continue;
            }
            let wanted: Vec<TaskId> = if task.context_tasks.is_empty() {
                previous.iter().cloned().collect()
            } else {
                task.context_tasks.clone()
            };

            let dispatch = self.prepare(state, &task, task.agent_id.clone(), &wanted);
            self.start(graph, &dispatch)?;
            let outcome = self.invoke(&dispatch, agents).await;

            if self.settle(graph, state, dispatch, outcome).await? {
                previous = Some(id);
            } else if self.config.halt_on_failure {
                state.halt = Some(Halt::Failure { task: id });
                break;
            }
        }
        Ok(())
    }

    async fn run_hierarchical(
        &self,
        graph: &mut TaskGraph,
        agents: &AgentPool,
        state: &mut RunState,
    ) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                state.halt = Some(Halt::Cancelled);
                break;
            }

            let ready: Vec<Task> = graph.ready_tasks().into_iter().cloned().collect();
            if ready.is_empty() {
                break;
            }

            let decision = self.manager.decide(&ready, agents).await?;
            mlog!("[process] manager decision: {:?}", decision);

            let (task_id, agent_id) = match decision {
                ManagerDecision::Done => {
                    state.halt = Some(Halt::ManagerDone);
                    break;
                }
                ManagerDecision::Assign { task_id, agent_id } => (task_id, agent_id),
            };

            let Some(task) = ready.iter().find(|t| t.id == task_id) else {
                let ready_ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
                mlog_error!(
                    "[process] manager assigned {} outside ready set [{}]",
                    task_id,
                    ready_ids.join(", ")
                );
                return Err(Error::ManagerAssignment(format!(
                    "task {} is not ready (ready: {})",
                    task_id,
                    ready_ids.join(", ")
                )));
            };
            if !agents.contains(&agent_id) {
                mlog_error!("[process] manager assigned unknown agent {}", agent_id);
                return Err(Error::ManagerAssignment(format!(
                    "agent {} is not in the pool",
                    agent_id
                )));
            }

            state.assigned.insert(task_id.clone(), agent_id.clone());
            if let Ok(agent) = agents.get(&agent_id) {
                register_agent_tools(agent.as_ref(), state);
            }
            let dispatch = self.prepare(state, task, agent_id, &task.context_tasks);
            self.start(graph, &dispatch)?;
            let outcome = self.invoke(&dispatch, agents).await;

            if !self.settle(graph, state, dispatch, outcome).await? {
                if self.config.halt_on_failure {
                    state.halt = Some(Halt::Failure { task: task_id });
                    break;
                }
                self.cascade_failure(graph, &task_id)?;
            }
        }
        Ok(())
    }

    async fn run_workflow(
        &self,
        graph: &mut TaskGraph,
        agents: &AgentPool,
        state: &mut RunState,
    ) -> Result<()> {
        let held: HashSet<TaskId> = self
            .gates
            .values()
            .filter_map(|gate| gate.alternate().cloned())
            .collect();

        'waves: loop {
            if self.cancel.is_cancelled() {
                state.halt = Some(Halt::Cancelled);
                break;
            }

            let wave: Vec<TaskId> = graph
                .ready_ids()
                .into_iter()
                .filter(|id| !held.contains(id) || state.released.contains(id))
                .filter(|id| !state.blocked.contains(id))
                .collect();
            if wave.is_empty() {
                break;
            }
            mlog_debug!("[process] wave: {:?}", wave);

            for chunk in wave.chunks(self.config.max_concurrency) {
                if self.cancel.is_cancelled() {
                    state.halt = Some(Halt::Cancelled);
                    break 'waves;
                }

                let mut dispatches = Vec::with_capacity(chunk.len());
                for id in chunk {
                    let task = lookup(graph, id)?;
                    dispatches.push(self.prepare(
                        state,
                        &task,
                        task.agent_id.clone(),
                        &task.context_tasks,
                    ));
                }
                for dispatch in &dispatches {
                    self.start(graph, dispatch)?;
                }

                let outcomes = join_all(dispatches.iter().map(|d| self.invoke(d, agents))).await;

                for (dispatch, outcome) in dispatches.into_iter().zip(outcomes) {
                    let id = dispatch.task_id.clone();
                    if self.settle(graph, state, dispatch, outcome).await? {
                        self.apply_gate(graph, state, &id).await;
                    } else {
                        self.cascade_failure(graph, &id)?;
                    }
                }

                if state.halt.is_some() {
                    break 'waves;
                }
            }
        }
        Ok(())
    }

    // ========== Task Lifecycle ==========

    /// Compact if needed, then assemble the prompt from ledger context.
    fn prepare(
        &self,
        state: &mut RunState,
        task: &Task,
        agent_id: AgentId,
        wanted: &[TaskId],
    ) -> Dispatch {
        self.compact_if_needed(state);
        let context = context_for(&state.ledger, wanted);
        Dispatch {
            task_id: task.id.clone(),
            agent_id,
            prompt: build_task_prompt(task, &context),
            output_file: task.output_file.clone(),
            withheld: state.pruned.clone(),
        }
    }

    fn start(&self, graph: &mut TaskGraph, dispatch: &Dispatch) -> Result<()> {
        graph.mark_ready(&dispatch.task_id)?;
        graph.mark_running(&dispatch.task_id)?;
        mlog!(
            "[process] task {} started on {}",
            dispatch.task_id,
            dispatch.agent_id
        );
        self.emit(ProcessEvent::TaskStarted {
            task_id: dispatch.task_id.clone(),
            agent_id: dispatch.agent_id.clone(),
        });
        Ok(())
    }

    /// Call the agent (or the task's loop), bounded by the task timeout.
    async fn invoke(&self, dispatch: &Dispatch, agents: &AgentPool) -> Result<Invocation> {
        match self.config.task_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.call_agent(dispatch, agents))
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => self.call_agent(dispatch, agents).await,
        }
    }

    async fn call_agent(&self, dispatch: &Dispatch, agents: &AgentPool) -> Result<Invocation> {
        let agent = agents.get(&dispatch.agent_id)?;
        let tools: Vec<ToolSchema> = agent
            .tools()
            .into_iter()
            .filter(|tool| !dispatch.withheld.contains(&tool.name))
            .collect();

        let Some(repeat) = self.loops.get(&dispatch.task_id) else {
            let reply = agent.invoke(&dispatch.prompt, &tools).await?;
            return Ok(Invocation {
                text: reply.text,
                tool_calls: reply.tool_calls,
                iterations: None,
            });
        };

        let step = LoopTaskStep {
            append_previous: !has_previous(&dispatch.prompt),
            agent,
            tools,
        };
        let result = repeat
            .clone()
            .with_cancellation(self.cancel.clone())
            .run(&step, &dispatch.prompt)
            .await?;
        if !result.condition_met {
            return Err(Error::LoopExhausted {
                iterations: result.count,
            });
        }
        Ok(Invocation {
            text: result.result.clone().unwrap_or_default(),
            tool_calls: Vec::new(),
            iterations: Some(result.iterations),
        })
    }

    /// Record an invocation outcome on the graph and ledger.
    ///
    /// Returns whether the task completed.
    async fn settle(
        &self,
        graph: &mut TaskGraph,
        state: &mut RunState,
        dispatch: Dispatch,
        outcome: Result<Invocation>,
    ) -> Result<bool> {
        let id = dispatch.task_id;
        let outcome = match outcome {
            Ok(invocation) => write_output(dispatch.output_file.as_deref(), &invocation.text)
                .await
                .map(|_| invocation),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(invocation) => {
                if let Some(iterations) = &invocation.iterations {
                    state.iterations.insert(id.clone(), iterations.len());
                    let earlier = iterations.len().saturating_sub(1);
                    for text in &iterations[..earlier] {
                        state
                            .ledger
                            .record(EntryKind::Iteration, Some(id.clone()), text);
                    }
                }
                account_tool_calls(&mut state.ledger, &invocation.tool_calls);
                let tokens = state
                    .ledger
                    .record(EntryKind::Output, Some(id.clone()), &invocation.text);
                graph.mark_completed(&id, invocation.text)?;

                mlog!("[process] task {} completed ({} tokens)", id, tokens);
                self.emit(ProcessEvent::TaskCompleted { task_id: id });
                Ok(true)
            }
            Err(e) => {
                let error = Error::TaskExecution {
                    task: id.clone(),
                    message: e.to_string(),
                }
                .to_string();
                graph.mark_failed(&id, &error)?;

                mlog_error!("[process] {}", error);
                self.emit(ProcessEvent::TaskFailed { task_id: id, error });
                Ok(false)
            }
        }
    }

    /// Evaluate the gate on a completed task, if it has one.
    async fn apply_gate(&self, graph: &TaskGraph, state: &mut RunState, id: &TaskId) {
        let Some(gate) = self.gates.get(id) else {
            return;
        };
        let Some(task) = graph.task(id) else {
            return;
        };

        let ctx = GateContext {
            task_id: id.clone(),
            agent_id: task.agent_id.clone(),
            output: task.output.clone().unwrap_or_default(),
        };
        let outcome = gate.evaluate(&ctx).await;
        mlog!("[process] gate on {}: {:?}", id, outcome);

        match &outcome {
            GateOutcome::Passed => {}
            GateOutcome::Halted => {
                if state.halt.is_none() {
                    state.halt = Some(Halt::Gate { task: id.clone() });
                }
            }
            GateOutcome::Routed { to } => {
                state.released.insert(to.clone());
                state.blocked.extend(
                    graph
                        .dependents(id)
                        .into_iter()
                        .map(|t| t.id.clone())
                        .filter(|dep| dep != to),
                );
            }
        }

        self.emit(ProcessEvent::GateEvaluated {
            task_id: id.clone(),
            outcome,
        });
    }

    /// Fail every unfinished task downstream of `id`.
    fn cascade_failure(&self, graph: &mut TaskGraph, id: &TaskId) -> Result<()> {
        let reason = format!("upstream task {} failed", id);
        for downstream in graph.descendants(id) {
            if graph.task(&downstream).is_some_and(|t| !t.is_finished()) {
                graph.mark_failed(&downstream, &reason)?;
                mlog_debug!("[process] task {} failed: {}", downstream, reason);
                self.emit(ProcessEvent::TaskFailed {
                    task_id: downstream,
                    error: reason.clone(),
                });
            }
        }
        Ok(())
    }

    // ========== Context Accounting ==========

    fn register_tools(&self, graph: &TaskGraph, agents: &AgentPool, state: &mut RunState) {
        let mut seen: HashSet<&AgentId> = HashSet::new();
        for task in graph.tasks() {
            if !seen.insert(&task.agent_id) {
                continue;
            }
            if let Ok(agent) = agents.get(&task.agent_id) {
                register_agent_tools(agent.as_ref(), state);
            }
        }
    }

    fn compact_if_needed(&self, state: &mut RunState) {
        if self.optimizer.should_compact(&state.ledger, &self.allocation) {
            let result =
                self.optimizer
                    .optimize(&mut state.ledger, &self.allocation, self.config.strategy);
            state.warned = false;
            if result.applied() {
                self.emit(ProcessEvent::Compacted {
                    result: result.clone(),
                });
                state.pruned.extend(result.tools_pruned.iter().cloned());
                state.compactions.push(result);
            }
            return;
        }

        let usage = self.allocation.usage_fraction(&state.ledger);
        if !state.warned && usage >= WARNING_THRESHOLD {
            let preview: OptimizationResult = self.preview.non_destructive(
                &state.ledger,
                &self.allocation,
                self.config.strategy,
            );
            mlog_warn!(
                "[process] context at {:.0}% of usable budget, compaction would remove {} tokens",
                usage * 100.0,
                preview.tokens_removed
            );
            state.warned = true;
        }
    }

    // ========== Validation ==========

    fn check_attachments(&self, graph: &TaskGraph) -> Result<()> {
        for (id, gate) in &self.gates {
            if !graph.contains(id) {
                return Err(Error::Validation(format!("gate on unknown task {}", id)));
            }
            if let Some(alternate) = gate.alternate() {
                if !graph.contains(alternate) {
                    return Err(Error::Validation(format!(
                        "gate on {} routes to unknown task {}",
                        id, alternate
                    )));
                }
                if alternate == id {
                    return Err(Error::Validation(format!("gate on {} routes to itself", id)));
                }
            }
        }
        for id in self.loops.keys() {
            if !graph.contains(id) {
                return Err(Error::Validation(format!("loop on unknown task {}", id)));
            }
        }
        if !self.gates.is_empty() && self.config.mode != ProcessMode::Workflow {
            mlog_warn!(
                "[process] {} gate(s) ignored outside workflow mode",
                self.gates.len()
            );
        }
        Ok(())
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("config", &self.config)
            .field("allocation", &self.allocation)
            .field("gates", &self.gates.keys().collect::<Vec<_>>())
            .field("loops", &self.loops.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Mutable bookkeeping owned by one run.
struct RunState {
    ledger: ContextLedger,
    compactions: Vec<OptimizationResult>,
    assigned: HashMap<TaskId, AgentId>,
    iterations: HashMap<TaskId, usize>,
    halt: Option<Halt>,
    /// Gate alternates released by a failed condition.
    released: HashSet<TaskId>,
    /// Tasks on a path a gate routed away from.
    blocked: HashSet<TaskId>,
    warned: bool,
    /// Tools pruned from the ledger; their schemas are no longer sent.
    pruned: HashSet<String>,
}

impl RunState {
    fn new(ledger: ContextLedger) -> Self {
        Self {
            ledger,
            compactions: Vec::new(),
            assigned: HashMap::new(),
            iterations: HashMap::new(),
            halt: None,
            released: HashSet::new(),
            blocked: HashSet::new(),
            warned: false,
            pruned: HashSet::new(),
        }
    }
}

/// A task ready to hand to its agent.
struct Dispatch {
    task_id: TaskId,
    agent_id: AgentId,
    prompt: String,
    output_file: Option<PathBuf>,
    withheld: HashSet<String>,
}

struct Invocation {
    text: String,
    tool_calls: Vec<ToolCall>,
    iterations: Option<Vec<String>>,
}

/// Loop body for a task: the task's agent, fed its previous attempt.
struct LoopTaskStep {
    agent: Arc<dyn Agent>,
    tools: Vec<ToolSchema>,
    /// The prompt has no `{{previous}}` placeholder, so append it instead.
    append_previous: bool,
}

#[async_trait]
impl Step for LoopTaskStep {
    async fn invoke(&self, prompt: &str, previous: Option<&str>) -> Result<String> {
        let prompt = match (self.append_previous, previous) {
            (true, Some(prev)) => format!("{}\n\nPrevious attempt:\n{}", prompt, prev),
            _ => prompt.to_string(),
        };
        Ok(self.agent.invoke(&prompt, &self.tools).await?.text)
    }
}

/// Sub-workflow adapted to a [`Step`]: each invocation runs the task list
/// on a fresh graph with the prompt as input and returns the final output.
pub struct ProcessStep {
    process: Arc<Process>,
    tasks: Vec<TaskSpec>,
    agents: AgentPool,
}

impl ProcessStep {
    /// # Errors
    ///
    /// Returns the graph construction error if `tasks` do not form a DAG.
    pub fn new(process: Process, tasks: Vec<TaskSpec>, agents: AgentPool) -> Result<Self> {
        TaskGraph::build(tasks.clone())?;
        Ok(Self {
            process: Arc::new(process),
            tasks,
            agents,
        })
    }
}

#[async_trait]
impl Step for ProcessStep {
    async fn invoke(&self, prompt: &str, _previous: Option<&str>) -> Result<String> {
        let mut graph = TaskGraph::build(self.tasks.clone())?;
        let report = self
            .process
            .run_with_input(&mut graph, &self.agents, prompt)
            .await?;

        if let Some(failed) = report.failed().first() {
            return Err(Error::TaskExecution {
                task: failed.task_id.clone(),
                message: failed.error.clone().unwrap_or_default(),
            });
        }
        if report.halt == Some(Halt::Cancelled) {
            return Err(Error::Cancelled);
        }
        report
            .final_output()
            .map(str::to_string)
            .ok_or_else(|| Error::Validation("sub-workflow produced no output".to_string()))
    }
}

fn lookup(graph: &TaskGraph, id: &TaskId) -> Result<Task> {
    graph
        .task(id)
        .cloned()
        .ok_or_else(|| Error::TaskNotFound(id.clone()))
}

/// Context visible to a task: run input, compaction summaries, and the
/// outputs of `wanted` tasks still in the ledger, oldest first.
fn context_for(ledger: &ContextLedger, wanted: &[TaskId]) -> Vec<ContextEntry> {
    ledger
        .history()
        .iter()
        .filter_map(|entry| match entry.kind {
            EntryKind::Input | EntryKind::Summary => Some(ContextEntry::anonymous(&entry.content)),
            EntryKind::Output => entry
                .source
                .as_ref()
                .filter(|source| wanted.contains(source))
                .map(|source| ContextEntry::from_task(source, &entry.content)),
            EntryKind::Iteration => None,
        })
        .collect()
}

/// Register an agent's tool schemas, except those already pruned this run.
fn register_agent_tools(agent: &dyn Agent, state: &mut RunState) {
    for schema in agent.tools() {
        if !state.pruned.contains(&schema.name) {
            state
                .ledger
                .register_tool(&schema.name, schema.estimated_tokens());
        }
    }
}

fn account_tool_calls(ledger: &mut ContextLedger, calls: &[ToolCall]) {
    for call in calls {
        ledger.mark_tool_used(&call.name);
        if let Some(output) = &call.output {
            ledger.accumulate(Segment::ToolOutputs, estimate_tokens(output) as i64);
        }
    }
}

async fn write_output(path: Option<&Path>, output: &str) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, output).await?;
    mlog_debug!("[process] wrote output to {}", path.display());
    Ok(())
}
