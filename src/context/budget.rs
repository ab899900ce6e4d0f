//! Budget allocation: maps a model limit, an output reserve and per-segment
//! reservations to the usable and history budgets.
//!
//! Budgets are pure functions of the allocation and are recomputed on every
//! check, since reserved segments can change mid-run.

use serde::{Deserialize, Serialize};

use crate::context::ledger::{ContextLedger, Segment};
use crate::error::{Error, Result};

/// Compaction threshold when a human is watching the run.
pub const INTERACTIVE_THRESHOLD: f64 = 0.80;
/// Compaction threshold for unattended runs, where nobody notices a near-overflow.
pub const UNATTENDED_THRESHOLD: f64 = 0.70;
/// Usage fraction at which a non-destructive compaction preview is logged.
pub const WARNING_THRESHOLD: f64 = 0.60;

/// Default model context window in tokens.
const DEFAULT_MODEL_LIMIT: usize = 128_000;
/// Default tokens reserved for the model's response.
const DEFAULT_OUTPUT_RESERVE: usize = 4_096;

/// Whether someone is watching the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Interactive,
    Unattended,
}

impl RunMode {
    pub fn default_threshold(&self) -> f64 {
        match self {
            RunMode::Interactive => INTERACTIVE_THRESHOLD,
            RunMode::Unattended => UNATTENDED_THRESHOLD,
        }
    }
}

/// Reservation for one segment: a fixed token count or whatever remains.
///
/// Serialized as a number, with `-1` meaning "remaining". Any other negative
/// number is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SegmentBudget {
    Fixed(usize),
    Remaining,
}

impl TryFrom<i64> for SegmentBudget {
    type Error = Error;

    fn try_from(v: i64) -> Result<Self> {
        match v {
            -1 => Ok(SegmentBudget::Remaining),
            n if n >= 0 => Ok(SegmentBudget::Fixed(n as usize)),
            n => Err(Error::BudgetConfiguration(format!(
                "segment budget must be a token count or -1 (remaining), got {}",
                n
            ))),
        }
    }
}

impl From<SegmentBudget> for i64 {
    fn from(b: SegmentBudget) -> Self {
        match b {
            SegmentBudget::Fixed(n) => n as i64,
            SegmentBudget::Remaining => -1,
        }
    }
}

impl Default for SegmentBudget {
    fn default() -> Self {
        SegmentBudget::Fixed(0)
    }
}

fn remaining() -> SegmentBudget {
    SegmentBudget::Remaining
}

/// Budget configuration for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetAllocation {
    pub model_limit: usize,
    pub output_reserve: usize,
    pub system_prompt: SegmentBudget,
    pub rules: SegmentBudget,
    pub skills: SegmentBudget,
    pub memory: SegmentBudget,
    pub tools_schema: SegmentBudget,
    #[serde(default = "remaining")]
    pub history: SegmentBudget,
    pub tool_outputs: SegmentBudget,
    pub buffer: SegmentBudget,
}

impl Default for BudgetAllocation {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_LIMIT, DEFAULT_OUTPUT_RESERVE)
    }
}

impl BudgetAllocation {
    /// All segments at zero except history, which takes the remainder.
    pub fn new(model_limit: usize, output_reserve: usize) -> Self {
        Self {
            model_limit,
            output_reserve,
            system_prompt: SegmentBudget::Fixed(0),
            rules: SegmentBudget::Fixed(0),
            skills: SegmentBudget::Fixed(0),
            memory: SegmentBudget::Fixed(0),
            tools_schema: SegmentBudget::Fixed(0),
            history: SegmentBudget::Remaining,
            tool_outputs: SegmentBudget::Fixed(0),
            buffer: SegmentBudget::Fixed(0),
        }
    }

    pub fn with_segment(mut self, segment: Segment, budget: SegmentBudget) -> Self {
        self.set(segment, budget);
        self
    }

    pub fn get(&self, segment: Segment) -> SegmentBudget {
        match segment {
            Segment::SystemPrompt => self.system_prompt,
            Segment::Rules => self.rules,
            Segment::Skills => self.skills,
            Segment::Memory => self.memory,
            Segment::ToolsSchema => self.tools_schema,
            Segment::History => self.history,
            Segment::ToolOutputs => self.tool_outputs,
            Segment::Buffer => self.buffer,
        }
    }

    pub fn set(&mut self, segment: Segment, budget: SegmentBudget) {
        let slot = match segment {
            Segment::SystemPrompt => &mut self.system_prompt,
            Segment::Rules => &mut self.rules,
            Segment::Skills => &mut self.skills,
            Segment::Memory => &mut self.memory,
            Segment::ToolsSchema => &mut self.tools_schema,
            Segment::History => &mut self.history,
            Segment::ToolOutputs => &mut self.tool_outputs,
            Segment::Buffer => &mut self.buffer,
        };
        *slot = budget;
    }

    /// `model_limit - output_reserve`, floored at zero.
    pub fn usable_budget(&self) -> usize {
        self.model_limit.saturating_sub(self.output_reserve)
    }

    /// Sum of the fixed reservations of every segment except history.
    pub fn fixed_total(&self) -> usize {
        Segment::ALL
            .iter()
            .filter(|s| **s != Segment::History)
            .map(|s| match self.get(*s) {
                SegmentBudget::Fixed(n) => n,
                SegmentBudget::Remaining => 0,
            })
            .sum()
    }

    /// Tokens left for history: `max(0, usable - fixed)`, capped by a fixed
    /// history reservation if one is configured.
    pub fn history_budget(&self) -> usize {
        let rest = self.usable_budget().saturating_sub(self.fixed_total());
        match self.history {
            SegmentBudget::Remaining => rest,
            SegmentBudget::Fixed(n) => n.min(rest),
        }
    }

    /// Check the allocation before any agent call.
    ///
    /// # Errors
    /// `BudgetConfiguration` when the output reserve exceeds the model limit,
    /// a segment other than history asks for the remainder, or the fixed
    /// reservations exceed the usable budget. Nothing is clamped.
    pub fn validate(&self) -> Result<()> {
        if self.output_reserve > self.model_limit {
            return Err(Error::BudgetConfiguration(format!(
                "output reserve {} exceeds model limit {}",
                self.output_reserve, self.model_limit
            )));
        }

        for segment in Segment::ALL {
            if segment != Segment::History && self.get(segment) == SegmentBudget::Remaining {
                return Err(Error::BudgetConfiguration(format!(
                    "only history may take the remaining budget, not {}",
                    segment
                )));
            }
        }

        let usable = self.usable_budget();
        let fixed = self.fixed_total();
        if fixed > usable {
            return Err(Error::BudgetConfiguration(format!(
                "fixed segments need {} tokens but only {} are usable ({} limit - {} output reserve)",
                fixed, usable, self.model_limit, self.output_reserve
            )));
        }

        if let SegmentBudget::Fixed(n) = self.history {
            if fixed + n > usable {
                return Err(Error::BudgetConfiguration(format!(
                    "history reservation {} exceeds the {} tokens left after fixed segments",
                    n,
                    usable - fixed
                )));
            }
        }

        Ok(())
    }

    /// Smallest ledger total that triggers compaction at `threshold`.
    pub fn trigger_tokens(&self, threshold: f64) -> usize {
        let raw = threshold * self.usable_budget() as f64;
        // Absorb float noise such as 0.8 * 900 = 720.0000000000001.
        (raw - 1e-9).ceil().max(0.0) as usize
    }

    /// Usage of `ledger` as a fraction of the usable budget.
    pub fn usage_fraction(&self, ledger: &ContextLedger) -> f64 {
        let usable = self.usable_budget();
        if usable == 0 {
            return 1.0;
        }
        ledger.total() as f64 / usable as f64
    }
}

/// The single compaction trigger: `total >= threshold * usable`.
pub fn should_compact(ledger: &ContextLedger, allocation: &BudgetAllocation, threshold: f64) -> bool {
    ledger.total() >= allocation.trigger_tokens(threshold)
}
