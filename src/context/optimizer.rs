//! Compaction strategies that bring a ledger back under budget.
//!
//! Stages, cheapest first:
//! 1. `prune_tools` drops schemas of tools no call has used. Lossless for
//!    the conversation itself. Nothing counts as unused before the first
//!    recorded turn.
//! 2. `sliding_window` keeps the newest turns that fit the history budget.
//! 3. `summarize` replaces the dropped span with one synthesized entry.
//!
//! `smart` runs them in that order and escalates only while
//! [`should_compact`] stays true. `truncate` drops oldest history until the
//! trigger clears and is the lossy last resort.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::budget::{should_compact, BudgetAllocation};
use crate::context::ledger::ContextLedger;
use crate::context::summarizer::{DigestSummarizer, Summarizer};
use crate::context::truncate_to_tokens;
use crate::{mlog, mlog_debug, mlog_warn};

/// Summaries are capped at this size however much room is left.
const MAX_SUMMARY_TOKENS: usize = 512;
/// Below this allowance a summary is not worth inserting.
const MIN_SUMMARY_TOKENS: usize = 8;

/// Compaction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Truncate,
    SlidingWindow,
    Summarize,
    PruneTools,
    #[default]
    Smart,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Truncate => write!(f, "truncate"),
            Strategy::SlidingWindow => write!(f, "sliding_window"),
            Strategy::Summarize => write!(f, "summarize"),
            Strategy::PruneTools => write!(f, "prune_tools"),
            Strategy::Smart => write!(f, "smart"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "truncate" => Ok(Strategy::Truncate),
            "sliding_window" => Ok(Strategy::SlidingWindow),
            "summarize" => Ok(Strategy::Summarize),
            "prune_tools" => Ok(Strategy::PruneTools),
            "smart" => Ok(Strategy::Smart),
            other => Err(crate::Error::Validation(format!(
                "unknown compaction strategy: {}",
                other
            ))),
        }
    }
}

/// Outcome of one optimization pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub tokens_removed: usize,
    /// Last stage that ran; `None` when compaction was not needed.
    pub strategy_applied: Option<Strategy>,
    /// Every stage that ran, in order.
    pub stages: Vec<Strategy>,
    pub history_entries_removed: usize,
    pub tools_pruned: Vec<String>,
    pub still_over_budget: bool,
}

impl OptimizationResult {
    /// Whether any stage ran.
    pub fn applied(&self) -> bool {
        self.strategy_applied.is_some()
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let stages: Vec<String> = self.stages.iter().map(|s| s.to_string()).collect();
        format!(
            "compaction [{}]: {} -> {} tokens ({} removed, {} history entries, {} tools){}",
            stages.join(" -> "),
            self.tokens_before,
            self.tokens_after,
            self.tokens_removed,
            self.history_entries_removed,
            self.tools_pruned.len(),
            if self.still_over_budget {
                ", still over budget"
            } else {
                ""
            }
        )
    }
}

/// Applies compaction strategies against a budget allocation.
#[derive(Clone)]
pub struct ContextOptimizer {
    threshold: f64,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextOptimizer {
    /// Optimizer triggering at `threshold` of the usable budget.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            summarizer: Arc::new(DigestSummarizer),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn should_compact(&self, ledger: &ContextLedger, allocation: &BudgetAllocation) -> bool {
        should_compact(ledger, allocation, self.threshold)
    }

    /// Compact `ledger` with `strategy`.
    ///
    /// Leaves the ledger untouched when compaction is not triggered.
    pub fn optimize(
        &self,
        ledger: &mut ContextLedger,
        allocation: &BudgetAllocation,
        strategy: Strategy,
    ) -> OptimizationResult {
        let before = ledger.total();
        let mut result = OptimizationResult {
            tokens_before: before,
            tokens_after: before,
            ..Default::default()
        };

        if !self.should_compact(ledger, allocation) {
            return result;
        }

        match strategy {
            Strategy::Smart => {
                for stage in [Strategy::PruneTools, Strategy::SlidingWindow, Strategy::Summarize] {
                    self.apply_stage(ledger, allocation, stage, &mut result);
                    if !self.should_compact(ledger, allocation) {
                        break;
                    }
                    mlog_debug!(
                        "[optimizer] {} left {} tokens, escalating",
                        stage,
                        ledger.total()
                    );
                }
            }
            single => self.apply_stage(ledger, allocation, single, &mut result),
        }

        result.tokens_after = ledger.total();
        result.tokens_removed = before.saturating_sub(result.tokens_after);
        result.still_over_budget = self.should_compact(ledger, allocation);

        if result.still_over_budget {
            mlog_warn!("[optimizer] {}", result.to_log_string());
        } else {
            mlog!("[optimizer] {}", result.to_log_string());
        }
        result
    }

    /// What [`optimize`](Self::optimize) would do, computed on a copy.
    ///
    /// Used for pre-overflow warnings; `ledger` is never mutated.
    pub fn non_destructive(
        &self,
        ledger: &ContextLedger,
        allocation: &BudgetAllocation,
        strategy: Strategy,
    ) -> OptimizationResult {
        let mut copy = ledger.clone();
        self.optimize(&mut copy, allocation, strategy)
    }

    fn apply_stage(
        &self,
        ledger: &mut ContextLedger,
        allocation: &BudgetAllocation,
        stage: Strategy,
        result: &mut OptimizationResult,
    ) {
        let trigger = allocation.trigger_tokens(self.threshold);
        match stage {
            Strategy::PruneTools => {
                result.tools_pruned.extend(prune_tools(ledger, trigger));
            }
            Strategy::SlidingWindow => {
                result.history_entries_removed += sliding_window(ledger, allocation.history_budget());
            }
            Strategy::Summarize => {
                result.history_entries_removed +=
                    summarize(ledger, allocation, trigger, self.summarizer.as_ref());
            }
            Strategy::Truncate => {
                result.history_entries_removed += truncate(ledger, trigger);
            }
            Strategy::Smart => unreachable!("smart is expanded into its stages"),
        }
        result.stages.push(stage);
        result.strategy_applied = Some(stage);
    }
}

impl Default for ContextOptimizer {
    fn default() -> Self {
        Self::new(crate::context::INTERACTIVE_THRESHOLD)
    }
}

impl std::fmt::Debug for ContextOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextOptimizer")
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// Drop unused tool schemas in registration order until the total is below
/// `trigger`. Returns the pruned tool names.
fn prune_tools(ledger: &mut ContextLedger, trigger: usize) -> Vec<String> {
    let mut pruned = Vec::new();
    if ledger.turns() == 0 {
        mlog_debug!("[optimizer] no turns recorded yet, keeping every tool");
        return pruned;
    }
    let mut index = 0;
    while index < ledger.tools().len() && ledger.total() >= trigger {
        if ledger.tools()[index].used {
            index += 1;
            continue;
        }
        pruned.push(ledger.remove_tool(index).name);
    }
    pruned
}

/// Number of newest entries whose tokens fit in `budget`.
fn newest_fitting(ledger: &ContextLedger, budget: usize) -> usize {
    let mut used = 0;
    let mut keep = 0;
    for entry in ledger.history().iter().rev() {
        if used + entry.tokens > budget {
            break;
        }
        used += entry.tokens;
        keep += 1;
    }
    keep
}

/// Keep the most recent turns that fit the history budget.
fn sliding_window(ledger: &mut ContextLedger, history_budget: usize) -> usize {
    let keep = newest_fitting(ledger, history_budget);
    let drop = ledger.history().len() - keep;
    ledger.drain_oldest(drop).len()
}

/// Drop oldest entries until the total is below `trigger`.
fn truncate(ledger: &mut ContextLedger, trigger: usize) -> usize {
    let mut removed = 0;
    while ledger.total() >= trigger && !ledger.history().is_empty() {
        ledger.drain_oldest(1);
        removed += 1;
    }
    removed
}

/// Replace the oldest span with a summary so the total lands below `trigger`.
fn summarize(
    ledger: &mut ContextLedger,
    allocation: &BudgetAllocation,
    trigger: usize,
    summarizer: &dyn Summarizer,
) -> usize {
    // Room for history if the total is to end strictly below the trigger.
    let allowance = trigger
        .saturating_sub(1)
        .saturating_sub(ledger.non_history_total())
        .min(allocation.history_budget());
    let summary_cap = (allowance / 4).min(MAX_SUMMARY_TOKENS);

    if summary_cap < MIN_SUMMARY_TOKENS {
        mlog_debug!(
            "[optimizer] no room for a summary ({} tokens), dropping span",
            allowance
        );
        let keep = newest_fitting(ledger, allowance);
        let drop = ledger.history().len() - keep;
        return ledger.drain_oldest(drop).len();
    }

    let keep = newest_fitting(ledger, allowance - summary_cap);
    let drop = ledger.history().len() - keep;
    if drop == 0 {
        return 0;
    }

    let dropped = ledger.drain_oldest(drop);
    let text = summarizer.summarize(&dropped, summary_cap);
    let text = truncate_to_tokens(&text, summary_cap).to_string();
    let turn = dropped.last().map(|e| e.turn).unwrap_or(0);
    ledger.prepend_summary(text, turn);
    dropped.len()
}
