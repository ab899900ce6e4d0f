//! Conditional gates attached to workflow tasks.
//!
//! A gate is evaluated on a task's result once the task completes. When the
//! condition holds, dependents proceed as usual. When it does not, the gate
//! either halts the run or routes to an alternate task. Alternates are held
//! back until their gate fails; they never run on the passing path.

use serde::Serialize;

use crate::agent::AgentId;
use crate::core::TaskId;
use crate::workflow::predicate::Predicate;

/// Snapshot of a completed task handed to a gate condition.
#[derive(Debug, Clone, Serialize)]
pub struct GateContext {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub output: String,
}

/// What to do when a gate condition does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "task")]
pub enum GateAction {
    /// Stop the run. Dependents of the gated task stay pending.
    Halt,
    /// Release the named alternate task.
    Route(TaskId),
}

/// Result of evaluating a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Halted,
    Routed { to: TaskId },
}

/// A condition over a task result plus its failure action.
#[derive(Debug, Clone)]
pub struct Gate {
    condition: Predicate<GateContext>,
    on_fail: GateAction,
}

impl Gate {
    /// Gate that halts when `condition` does not hold.
    pub fn new(condition: Predicate<GateContext>) -> Self {
        Self {
            condition,
            on_fail: GateAction::Halt,
        }
    }

    /// Gate over the task output only.
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::new(Predicate::new(move |ctx: &GateContext| f(&ctx.output)))
    }

    /// Route to `alternate` instead of halting.
    pub fn or_route(mut self, alternate: impl Into<TaskId>) -> Self {
        self.on_fail = GateAction::Route(alternate.into());
        self
    }

    pub fn on_fail(&self) -> &GateAction {
        &self.on_fail
    }

    /// Alternate task this gate may release, if any.
    pub fn alternate(&self) -> Option<&TaskId> {
        match &self.on_fail {
            GateAction::Route(id) => Some(id),
            GateAction::Halt => None,
        }
    }

    pub async fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        if self.condition.evaluate(ctx).await {
            return GateOutcome::Passed;
        }
        match &self.on_fail {
            GateAction::Halt => GateOutcome::Halted,
            GateAction::Route(to) => GateOutcome::Routed { to: to.clone() },
        }
    }
}
