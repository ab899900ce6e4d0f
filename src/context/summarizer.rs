//! Summarization hook for the `summarize` compaction strategy.
//!
//! The optimizer is synchronous and never suspends, so the hook is a plain
//! function of the dropped span. An LLM-backed summarizer can be plugged in
//! through [`FnSummarizer`]; [`DigestSummarizer`] is the offline default.

use crate::context::ledger::HistoryEntry;
use crate::context::truncate_to_tokens;

/// Produces one entry standing in for a span of dropped history.
pub trait Summarizer: Send + Sync {
    /// Summarize `dropped` in at most `max_tokens` tokens.
    fn summarize(&self, dropped: &[HistoryEntry], max_tokens: usize) -> String;
}

/// Extractive digest: one line per dropped entry, first line of its content.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSummarizer;

impl Summarizer for DigestSummarizer {
    fn summarize(&self, dropped: &[HistoryEntry], max_tokens: usize) -> String {
        let mut out = format!("[Summary of {} earlier entries]", dropped.len());
        for entry in dropped {
            let first = entry.content.lines().next().unwrap_or_default();
            if first.is_empty() {
                continue;
            }
            let label = entry
                .source
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("turn {}", entry.turn));
            out.push_str(&format!("\n- {}: {}", label, first));
        }
        truncate_to_tokens(&out, max_tokens).to_string()
    }
}

/// Summarizer backed by a closure.
pub struct FnSummarizer<F>(pub F);

impl<F> Summarizer for FnSummarizer<F>
where
    F: Fn(&[HistoryEntry], usize) -> String + Send + Sync,
{
    fn summarize(&self, dropped: &[HistoryEntry], max_tokens: usize) -> String {
        (self.0)(dropped, max_tokens)
    }
}
