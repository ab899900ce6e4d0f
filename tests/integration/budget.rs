//! Budget allocation and compaction tests.

use maestro::agent::{AgentPool, FnAgent, ToolSchema};
use maestro::context::{
    BudgetAllocation, ContextLedger, ContextOptimizer, EntryKind, Segment, SegmentBudget,
    Strategy, INTERACTIVE_THRESHOLD,
};
use maestro::core::TaskState;
use maestro::orchestration::{Process, ProcessConfig, ProcessMode};
use maestro::Error;

use crate::fixtures::{build, task, ToolAgent};

fn allocation(limit: usize, reserve: usize, fixed: usize) -> BudgetAllocation {
    BudgetAllocation::new(limit, reserve).with_segment(Segment::Rules, SegmentBudget::Fixed(fixed))
}

/// Test: History budget formula
/// For every allocation, history = max(0, L - O - F) and the configuration
/// is rejected exactly when F > L - O
#[test]
fn test_history_budget_formula() {
    for limit in [0usize, 100, 1_000, 8_192] {
        for reserve in [0usize, 50, 100, 2_000] {
            for fixed in [0usize, 10, 300, 900, 5_000] {
                let a = allocation(limit, reserve, fixed);
                let expected = (limit as i64 - reserve as i64 - fixed as i64).max(0) as usize;
                assert_eq!(a.history_budget(), expected, "L={} O={} F={}", limit, reserve, fixed);

                let over = fixed as i64 > limit as i64 - reserve as i64;
                match a.validate() {
                    Err(Error::BudgetConfiguration(_)) => assert!(over, "L={} O={} F={}", limit, reserve, fixed),
                    Ok(()) => assert!(!over, "L={} O={} F={}", limit, reserve, fixed),
                    Err(other) => panic!("unexpected error: {}", other),
                }
            }
        }
    }
}

/// Test: Process refuses an overcommitted budget before any call
#[test]
fn test_process_rejects_overcommitted_budget() {
    let err = Process::new(ProcessConfig::default(), allocation(1_000, 100, 901)).unwrap_err();
    assert!(matches!(err, Error::BudgetConfiguration(_)));
}

/// Seed a ledger with 300 non-history tokens and 550 history tokens.
fn scenario_ledger(unused_tool_tokens: usize) -> ContextLedger {
    let mut ledger = ContextLedger::new();
    let tools_used = 10;
    ledger.accumulate(
        Segment::SystemPrompt,
        (300 - tools_used - unused_tool_tokens) as i64,
    );
    ledger.register_tool("search", tools_used);
    ledger.mark_tool_used("search");
    ledger.register_tool("browse", unused_tool_tokens);
    for _ in 0..5 {
        // 385 chars = 110 tokens.
        ledger.record(EntryKind::Output, Some("t".into()), &"x".repeat(385));
    }
    ledger
}

/// Test: Smart compaction stops at prune_tools
/// Given limit 1000, reserve 100, 300 fixed tokens and 550 of history
/// When pruning the unused tool alone brings the total under 720
/// Then smart reports prune_tools with no history removed
#[test]
fn test_smart_prunes_tools_first() {
    let alloc = BudgetAllocation::new(1_000, 100)
        .with_segment(Segment::SystemPrompt, SegmentBudget::Fixed(150))
        .with_segment(Segment::ToolsSchema, SegmentBudget::Fixed(150));
    let mut ledger = scenario_ledger(140);
    assert_eq!(ledger.total(), 850);
    assert_eq!(alloc.trigger_tokens(INTERACTIVE_THRESHOLD), 720);

    let result = ContextOptimizer::new(INTERACTIVE_THRESHOLD).optimize(&mut ledger, &alloc, Strategy::Smart);

    assert_eq!(result.strategy_applied, Some(Strategy::PruneTools));
    assert_eq!(result.stages, vec![Strategy::PruneTools]);
    assert_eq!(result.history_entries_removed, 0);
    assert_eq!(result.tools_pruned, vec!["browse".to_string()]);
    assert_eq!(result.tokens_after, 710);
    assert!(!result.still_over_budget);
    assert_eq!(ledger.history().len(), 5);
}

/// Test: Smart escalates when pruning is not enough
#[test]
fn test_smart_escalates_past_prune_tools() {
    let alloc = BudgetAllocation::new(1_000, 100)
        .with_segment(Segment::SystemPrompt, SegmentBudget::Fixed(150))
        .with_segment(Segment::ToolsSchema, SegmentBudget::Fixed(150));
    let mut ledger = scenario_ledger(20);

    let result = ContextOptimizer::new(INTERACTIVE_THRESHOLD).optimize(&mut ledger, &alloc, Strategy::Smart);

    assert_eq!(result.stages[0], Strategy::PruneTools);
    assert!(result.stages.len() > 1);
    assert!(result.history_entries_removed > 0);
    assert!(!result.still_over_budget);
    assert!(ledger.total() < 720);
}

/// Test: Optimize below the trigger never alters the ledger
#[test]
fn test_optimize_below_trigger_is_noop() {
    let alloc = BudgetAllocation::new(1_000, 100);
    let mut ledger = ContextLedger::new();
    ledger.record(EntryKind::Output, Some("a".into()), "short output");
    ledger.register_tool("unused", 30);
    let before = ledger.clone();

    for strategy in [
        Strategy::Truncate,
        Strategy::SlidingWindow,
        Strategy::Summarize,
        Strategy::PruneTools,
        Strategy::Smart,
    ] {
        let result = ContextOptimizer::new(INTERACTIVE_THRESHOLD).optimize(&mut ledger, &alloc, strategy);
        assert!(!result.applied());
        assert_eq!(ledger, before);
    }
}

/// Test: Non-destructive preview leaves the ledger alone
#[test]
fn test_non_destructive_preview() {
    let alloc = BudgetAllocation::new(1_000, 100)
        .with_segment(Segment::SystemPrompt, SegmentBudget::Fixed(150))
        .with_segment(Segment::ToolsSchema, SegmentBudget::Fixed(150));
    let ledger = scenario_ledger(140);
    let before = ledger.clone();

    let preview = ContextOptimizer::new(INTERACTIVE_THRESHOLD).non_destructive(&ledger, &alloc, Strategy::Smart);

    assert_eq!(preview.tokens_removed, 140);
    assert_eq!(ledger, before);
}

/// Test: A run compacts its ledger as outputs accumulate
/// Given a small budget and agents returning ~58-token outputs
/// When five tasks run sequentially
/// Then compaction runs and every task still completes
#[tokio::test]
async fn test_run_compacts_history() {
    let agents = AgentPool::new().with_agent(
        "verbose",
        FnAgent::new(|_| async { Ok("y".repeat(200)) }),
    );
    let mut graph = build((0..5).map(|i| task(&format!("t{}", i), "verbose")).collect());
    let mut config = ProcessConfig::new(ProcessMode::Sequential);
    config.strategy = Strategy::SlidingWindow;
    let allocation = BudgetAllocation::new(200, 0).with_segment(
        Segment::History,
        SegmentBudget::Fixed(100),
    );

    let report = Process::new(config, allocation)
        .unwrap()
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert!(report.results.iter().all(|r| r.state == TaskState::Completed));
    assert!(!report.compactions.is_empty());
    for compaction in &report.compactions {
        assert_eq!(compaction.strategy_applied, Some(Strategy::SlidingWindow));
        assert!(compaction.tokens_after < compaction.tokens_before);
    }
    assert_eq!(report.ledger.turns(), 5);
}

/// Test: Pruned tools are no longer offered to the agent
/// Given an agent with a small search tool it uses and a large browser tool
/// it never calls, on a budget the browser schema alone nearly fills
/// When two tasks run with prune_tools
/// Then the first call still sees both tools and the second only search
#[tokio::test]
async fn test_pruned_tools_are_withheld() {
    let browser = ToolSchema::new("browser", &"b".repeat(2_030));
    assert!(browser.estimated_tokens() > 560);
    let agent = ToolAgent::new(vec![ToolSchema::new("search", "web search"), browser], "search");
    let received = agent.received();
    let agents = AgentPool::new().with_agent("researcher", agent);
    let mut graph = build(vec![task("a", "researcher"), task("b", "researcher")]);
    let mut config = ProcessConfig::new(ProcessMode::Sequential);
    config.strategy = Strategy::PruneTools;

    let report = Process::new(config, BudgetAllocation::new(700, 0))
        .unwrap()
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(
        *received.lock().unwrap(),
        vec![vec!["search", "browser"], vec!["search"]]
    );
    let pruned: Vec<&str> = report
        .compactions
        .iter()
        .flat_map(|c| c.tools_pruned.iter().map(String::as_str))
        .collect();
    assert_eq!(pruned, vec!["browser"]);
    let left: Vec<&str> = report.ledger.tools().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(left, vec!["search"]);
}
