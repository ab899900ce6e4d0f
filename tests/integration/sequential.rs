//! Sequential dispatch tests.

use std::time::Duration;

use maestro::agent::AgentPool;
use maestro::core::TaskState;
use maestro::orchestration::{Halt, ProcessConfig, ProcessMode};

use crate::fixtures::{
    build, call_log, entries, process, process_with, recording_pool, task, FailingAgent,
    RecordingAgent,
};

/// Test: Output order equals declaration order
/// Given three tasks whose agents take different times
/// When run sequentially
/// Then calls and results follow declaration order
#[tokio::test(start_paused = true)]
async fn test_sequential_order_ignores_duration() {
    let log = call_log();
    let agents = AgentPool::new()
        .with_agent("slow", RecordingAgent::new("slow", &log).with_delay(Duration::from_millis(300)))
        .with_agent("fast", RecordingAgent::new("fast", &log))
        .with_agent("mid", RecordingAgent::new("mid", &log).with_delay(Duration::from_millis(50)));
    let mut graph = build(vec![task("a", "slow"), task("b", "fast"), task("c", "mid")]);

    let report = process(ProcessMode::Sequential)
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert_eq!(entries(&log), vec!["slow:a", "fast:b", "mid:c"]);
    let ids: Vec<&str> = report.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(report.is_success());
}

/// Test: Dependencies are advisory
/// Given b declared before the task it depends on
/// When run sequentially
/// Then b still runs first
#[tokio::test]
async fn test_sequential_dependencies_are_advisory() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log);
    let mut graph = build(vec![task("b", "writer").depends_on("a"), task("a", "writer")]);

    let report = process(ProcessMode::Sequential)
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert_eq!(entries(&log), vec!["writer:b", "writer:a"]);
    assert!(report.is_success());
}

/// Test: Each output feeds the next task
/// Given tasks without declared dependencies
/// When run sequentially
/// Then each prompt carries the previous task's output only
#[tokio::test]
async fn test_sequential_feeds_previous_output() {
    let log = call_log();
    let writer = RecordingAgent::new("writer", &log);
    let prompts = writer.prompts();
    let agents = AgentPool::new().with_agent("writer", writer);
    let mut graph = build(vec![task("a", "writer"), task("b", "writer"), task("c", "writer")]);

    process(ProcessMode::Sequential)
        .run(&mut graph, &agents)
        .await
        .unwrap();

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts[0], "a");
    assert!(prompts[1].contains("[a]\nwriter did a"));
    assert!(prompts[2].contains("[b]\nwriter did b"));
    assert!(!prompts[2].contains("writer did a"));
}

/// Test: Declared context replaces the previous output
#[tokio::test]
async fn test_sequential_declared_context() {
    let log = call_log();
    let writer = RecordingAgent::new("writer", &log);
    let prompts = writer.prompts();
    let agents = AgentPool::new().with_agent("writer", writer);
    let mut graph = build(vec![
        task("a", "writer"),
        task("b", "writer"),
        task("c", "writer").depends_on("a"),
    ]);

    process(ProcessMode::Sequential)
        .run(&mut graph, &agents)
        .await
        .unwrap();

    let prompts = prompts.lock().unwrap();
    assert!(prompts[2].contains("writer did a"));
    assert!(!prompts[2].contains("writer did b"));
}

/// Test: Halt on first failure
/// Given a failing middle task
/// When run sequentially with the default config
/// Then later tasks stay pending and the run reports the failure
#[tokio::test]
async fn test_sequential_halts_on_failure() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log).with_agent("broken", FailingAgent::new("boom"));
    let mut graph = build(vec![task("a", "writer"), task("b", "broken"), task("c", "writer")]);

    let report = process(ProcessMode::Sequential)
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert_eq!(report.state_of(&"a".into()), Some(TaskState::Completed));
    assert_eq!(report.state_of(&"b".into()), Some(TaskState::Failed));
    assert_eq!(report.state_of(&"c".into()), Some(TaskState::Pending));
    assert_eq!(report.halt, Some(Halt::Failure { task: "b".into() }));

    let error = report.result(&"b".into()).unwrap().error.clone().unwrap();
    assert_eq!(error, "Task b failed: Agent error: boom");
    assert_eq!(entries(&log), vec!["writer:a"]);
}

/// Test: Continue past failures when halting is disabled
#[tokio::test]
async fn test_sequential_continues_when_configured() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log).with_agent("broken", FailingAgent::new("boom"));
    let mut graph = build(vec![task("a", "writer"), task("b", "broken"), task("c", "writer")]);
    let mut config = ProcessConfig::new(ProcessMode::Sequential);
    config.halt_on_failure = false;

    let report = process_with(config).run(&mut graph, &agents).await.unwrap();

    assert_eq!(report.state_of(&"c".into()), Some(TaskState::Completed));
    assert!(report.halt.is_none());
    assert_eq!(report.failed().len(), 1);
}

/// Test: Missing agent is a task failure, not a run error
#[tokio::test]
async fn test_sequential_unknown_agent_fails_task() {
    let mut graph = build(vec![task("a", "ghost")]);
    let report = process(ProcessMode::Sequential)
        .run(&mut graph, &AgentPool::new())
        .await
        .unwrap();

    assert_eq!(report.state_of(&"a".into()), Some(TaskState::Failed));
    let error = report.results[0].error.clone().unwrap();
    assert!(error.contains("Agent not found: ghost"));
}

/// Test: Task timeout
/// Given an agent slower than the task timeout
/// When run sequentially
/// Then the task fails with a timeout
#[tokio::test(start_paused = true)]
async fn test_sequential_task_timeout() {
    let log = call_log();
    let agents = AgentPool::new()
        .with_agent("slow", RecordingAgent::new("slow", &log).with_delay(Duration::from_secs(10)));
    let mut graph = build(vec![task("a", "slow")]);
    let mut config = ProcessConfig::new(ProcessMode::Sequential);
    config.task_timeout_secs = Some(1);

    let report = process_with(config).run(&mut graph, &agents).await.unwrap();

    assert_eq!(report.state_of(&"a".into()), Some(TaskState::Failed));
    assert!(report.results[0].error.clone().unwrap().contains("timed out"));
    assert!(entries(&log).is_empty());
}

/// Test: Cancellation before the run schedules nothing
#[tokio::test]
async fn test_sequential_cancelled() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log);
    let mut graph = build(vec![task("a", "writer"), task("b", "writer")]);
    let process = process(ProcessMode::Sequential);
    process.cancellation_token().cancel();

    let report = process.run(&mut graph, &agents).await.unwrap();

    assert_eq!(report.halt, Some(Halt::Cancelled));
    assert!(entries(&log).is_empty());
    assert!(report.results.iter().all(|r| r.state == TaskState::Pending));
}

/// Test: Run input reaches every task
#[tokio::test]
async fn test_sequential_input_in_every_prompt() {
    let log = call_log();
    let writer = RecordingAgent::new("writer", &log);
    let prompts = writer.prompts();
    let agents = AgentPool::new().with_agent("writer", writer);
    let mut graph = build(vec![task("a", "writer"), task("b", "writer")]);

    let report = process(ProcessMode::Sequential)
        .run_with_input(&mut graph, &agents, "topic: tide pools")
        .await
        .unwrap();

    assert!(prompts.lock().unwrap().iter().all(|p| p.contains("topic: tide pools")));
    assert_eq!(report.ledger.turns(), 2);
}

/// Test: Finished tasks are skipped, not restarted
/// Given [a, b] where a already completed with "earlier output"
/// When run sequentially, then run again
/// Then only b is dispatched, it sees a's output, and the second run calls
/// nothing
#[tokio::test]
async fn test_sequential_skips_finished_tasks() {
    let log = call_log();
    let writer = RecordingAgent::new("writer", &log);
    let prompts = writer.prompts();
    let agents = AgentPool::new().with_agent("writer", writer);
    let mut graph = build(vec![task("a", "writer"), task("b", "writer")]);
    let a = "a".into();
    graph.mark_ready(&a).unwrap();
    graph.mark_running(&a).unwrap();
    graph.mark_completed(&a, "earlier output".to_string()).unwrap();
    let process = process(ProcessMode::Sequential);

    let report = process.run(&mut graph, &agents).await.unwrap();

    assert!(report.is_success());
    assert_eq!(entries(&log), vec!["writer:b"]);
    assert!(prompts.lock().unwrap()[0].contains("[a]\nearlier output"));
    assert_eq!(graph.task(&"b".into()).unwrap().state, TaskState::Completed);

    let again = process.run(&mut graph, &agents).await.unwrap();
    assert!(again.is_success());
    assert_eq!(entries(&log).len(), 1);
}
