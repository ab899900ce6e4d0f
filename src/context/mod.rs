//! Context window accounting and compaction.
//!
//! - **[`ledger`]**: [`ContextLedger`] records per-run token usage by segment
//!   (system prompt, rules, skills, memory, tools schema, history, tool
//!   outputs, buffer) plus a turn counter.
//! - **[`budget`]**: [`BudgetAllocation`] maps a model limit, an output
//!   reserve and per-segment reservations to the usable and history budgets,
//!   and owns the single compaction trigger, [`should_compact`].
//! - **[`optimizer`]**: [`ContextOptimizer`] brings a ledger back under
//!   budget with one of the compaction strategies.
//! - **[`summarizer`]**: the hook the `summarize` strategy calls to
//!   synthesize one entry for a dropped span.
//!
//! Everything here is synchronous and in-memory; nothing suspends.

pub mod budget;
pub mod ledger;
pub mod optimizer;
pub mod summarizer;

pub use budget::{
    should_compact, BudgetAllocation, RunMode, SegmentBudget, INTERACTIVE_THRESHOLD,
    UNATTENDED_THRESHOLD, WARNING_THRESHOLD,
};
pub use ledger::{ContextLedger, EntryKind, HistoryEntry, Segment, ToolUsage};
pub use optimizer::{ContextOptimizer, OptimizationResult, Strategy};
pub use summarizer::{DigestSummarizer, FnSummarizer, Summarizer};

/// Characters per token used for estimation.
/// Most tokenizers average 3-4 chars per token; 3.5 is the middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimated token count of `text`, rounded up. Counts chars, not bytes.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() as f64 / DEFAULT_CHARS_PER_TOKEN).ceil() as usize
}

/// Cut `text` to at most as many chars as `tokens` covers.
pub fn truncate_to_tokens(text: &str, tokens: usize) -> &str {
    let max_chars = (tokens as f64 * DEFAULT_CHARS_PER_TOKEN).floor() as usize;
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
