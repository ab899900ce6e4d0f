//! Per-run record of token consumption by context segment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::estimate_tokens;
use crate::core::task::TaskId;

/// A region of the context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    SystemPrompt,
    Rules,
    Skills,
    Memory,
    ToolsSchema,
    History,
    ToolOutputs,
    Buffer,
}

impl Segment {
    pub const ALL: [Segment; 8] = [
        Segment::SystemPrompt,
        Segment::Rules,
        Segment::Skills,
        Segment::Memory,
        Segment::ToolsSchema,
        Segment::History,
        Segment::ToolOutputs,
        Segment::Buffer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::SystemPrompt => "system_prompt",
            Segment::Rules => "rules",
            Segment::Skills => "skills",
            Segment::Memory => "memory",
            Segment::ToolsSchema => "tools_schema",
            Segment::History => "history",
            Segment::ToolOutputs => "tool_outputs",
            Segment::Buffer => "buffer",
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Run input visible to every task.
    Input,
    /// Final output of a task.
    Output,
    /// Intermediate output of a looped task.
    Iteration,
    /// Synthesized stand-in for a compacted span.
    Summary,
}

/// One entry of the history segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub turn: usize,
    pub source: Option<TaskId>,
    pub kind: EntryKind,
    pub content: String,
    pub tokens: usize,
}

/// Schema tokens of one registered tool and whether any call used it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub name: String,
    pub tokens: usize,
    pub used: bool,
}

/// Token usage of one process run.
///
/// History and tool schemas are itemized so the optimizer can drop
/// individual turns and unused tools; every other segment is a plain count.
/// The total is always derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextLedger {
    segments: BTreeMap<Segment, usize>,
    history: Vec<HistoryEntry>,
    tools: Vec<ToolUsage>,
    turns: usize,
}

impl ContextLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a token delta to a segment.
    ///
    /// Counts saturate at zero. A positive history delta becomes an
    /// anonymous history entry; a negative one is taken from the oldest
    /// entries first.
    pub fn accumulate(&mut self, segment: Segment, delta: i64) {
        if segment == Segment::History {
            if delta > 0 {
                self.push_entry(EntryKind::Output, None, String::new(), delta as usize);
            } else {
                self.shrink_history(delta.unsigned_abs() as usize);
            }
            return;
        }

        let count = self.segments.entry(segment).or_insert(0);
        if delta >= 0 {
            *count = count.saturating_add(delta as usize);
        } else {
            *count = count.saturating_sub(delta.unsigned_abs() as usize);
        }
    }

    /// Append `content` to history, estimating its tokens.
    ///
    /// Outputs and iterations count as agent turns. Returns the tokens added.
    pub fn record(&mut self, kind: EntryKind, source: Option<TaskId>, content: &str) -> usize {
        let tokens = estimate_tokens(content);
        self.push_entry(kind, source, content.to_string(), tokens);
        tokens
    }

    fn push_entry(&mut self, kind: EntryKind, source: Option<TaskId>, content: String, tokens: usize) {
        if matches!(kind, EntryKind::Output | EntryKind::Iteration) {
            self.turns += 1;
        }
        self.history.push(HistoryEntry {
            turn: self.turns,
            source,
            kind,
            content,
            tokens,
        });
    }

    fn shrink_history(&mut self, mut tokens: usize) {
        while tokens > 0 && !self.history.is_empty() {
            let oldest = &mut self.history[0];
            if oldest.tokens <= tokens {
                tokens -= oldest.tokens;
                self.history.remove(0);
            } else {
                oldest.tokens -= tokens;
                tokens = 0;
            }
        }
    }

    /// Register a tool schema; re-registering a known tool is a no-op.
    pub fn register_tool(&mut self, name: &str, tokens: usize) {
        if self.tools.iter().any(|t| t.name == name) {
            return;
        }
        self.tools.push(ToolUsage {
            name: name.to_string(),
            tokens,
            used: false,
        });
    }

    /// Mark a tool as used; used tools are never pruned.
    pub fn mark_tool_used(&mut self, name: &str) {
        if let Some(tool) = self.tools.iter_mut().find(|t| t.name == name) {
            tool.used = true;
        }
    }

    /// Tokens in one segment.
    pub fn segment(&self, segment: Segment) -> usize {
        let base = self.segments.get(&segment).copied().unwrap_or(0);
        match segment {
            Segment::History => self.history.iter().map(|e| e.tokens).sum(),
            Segment::ToolsSchema => base + self.tools.iter().map(|t| t.tokens).sum::<usize>(),
            _ => base,
        }
    }

    /// Sum of every segment.
    pub fn total(&self) -> usize {
        Segment::ALL.iter().map(|s| self.segment(*s)).sum()
    }

    /// Sum of every segment except history.
    pub fn non_history_total(&self) -> usize {
        self.total() - self.segment(Segment::History)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn tools(&self) -> &[ToolUsage] {
        &self.tools
    }

    /// Number of agent turns recorded so far.
    pub fn turns(&self) -> usize {
        self.turns
    }

    /// Per-segment counts, in segment order.
    pub fn breakdown(&self) -> Vec<(Segment, usize)> {
        Segment::ALL.iter().map(|s| (*s, self.segment(*s))).collect()
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let parts: Vec<String> = self
            .breakdown()
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(s, n)| format!("{}={}", s, n))
            .collect();
        format!(
            "ledger: {} tokens over {} turns [{}]",
            self.total(),
            self.turns,
            parts.join(", ")
        )
    }

    // ========== Compaction primitives ==========

    /// Remove the `count` oldest history entries.
    pub(crate) fn drain_oldest(&mut self, count: usize) -> Vec<HistoryEntry> {
        let count = count.min(self.history.len());
        self.history.drain(..count).collect()
    }

    /// Put a summary entry in front of the remaining history.
    pub(crate) fn prepend_summary(&mut self, content: String, turn: usize) {
        let tokens = estimate_tokens(&content);
        self.history.insert(
            0,
            HistoryEntry {
                turn,
                source: None,
                kind: EntryKind::Summary,
                content,
                tokens,
            },
        );
    }

    /// Remove the tool at `index`, returning its schema tokens.
    pub(crate) fn remove_tool(&mut self, index: usize) -> ToolUsage {
        self.tools.remove(index)
    }
}
