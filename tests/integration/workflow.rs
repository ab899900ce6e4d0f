//! Workflow dispatch tests: dependencies, gates, loops and cascades.

use std::time::Duration;

use tokio::sync::mpsc;

use maestro::agent::{AgentPool, FnAgent};
use maestro::core::TaskState;
use maestro::orchestration::{Halt, ProcessConfig, ProcessEvent, ProcessMode};
use maestro::workflow::{Gate, GateOutcome, Repeat};

use crate::fixtures::{
    build, call_log, diamond, entries, process, process_with, recording_pool, task, FailingAgent,
    RecordingAgent, SequenceAgent,
};

/// Test: Gate halt leaves dependents pending
/// Given T1 -> T2 with a gate on T1
/// When the gate evaluates false on T1's output
/// Then T2 never leaves pending and the run is halted at the gate
#[tokio::test]
async fn test_gate_halt_leaves_dependent_pending() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log);
    let mut graph = build(vec![task("T1", "writer"), task("T2", "writer").depends_on("T1")]);
    let process = process(ProcessMode::Workflow)
        .with_gate("T1", Gate::when(|out| out.contains("APPROVED")));

    let report = process.run(&mut graph, &agents).await.unwrap();

    assert_eq!(report.state_of(&"T1".into()), Some(TaskState::Completed));
    assert_eq!(report.state_of(&"T2".into()), Some(TaskState::Pending));
    assert_eq!(report.halt, Some(Halt::Gate { task: "T1".into() }));
    assert!(report.failed().is_empty());
    assert_eq!(entries(&log), vec!["writer:T1"]);
}

/// Test: Passing gate lets dependents run
#[tokio::test]
async fn test_gate_pass_continues() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log);
    let mut graph = build(vec![task("T1", "writer"), task("T2", "writer").depends_on("T1")]);
    let process = process(ProcessMode::Workflow)
        .with_gate("T1", Gate::when(|out| out.starts_with("writer did")));

    let report = process.run(&mut graph, &agents).await.unwrap();

    assert!(report.is_success());
    assert_eq!(entries(&log), vec!["writer:T1", "writer:T2"]);
}

/// Test: Failing gate routes to its alternate
/// Given draft -> publish and an alternate expand held behind a gate
/// When the gate fails
/// Then expand runs and publish stays pending
#[tokio::test]
async fn test_gate_routes_to_alternate() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log);
    let specs = vec![
        task("draft", "writer"),
        task("publish", "writer").depends_on("draft"),
        task("expand", "writer").depends_on("draft"),
    ];
    let gate = || Gate::when(|out| out.len() > 1000).or_route("expand");

    let mut graph = build(specs.clone());
    let report = process(ProcessMode::Workflow)
        .with_gate("draft", gate())
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert_eq!(entries(&log), vec!["writer:draft", "writer:expand"]);
    assert_eq!(report.state_of(&"publish".into()), Some(TaskState::Pending));
    assert_eq!(report.state_of(&"expand".into()), Some(TaskState::Completed));
    assert!(report.halt.is_none());

    // Passing path: the alternate is never released.
    let log = call_log();
    let agents = recording_pool(&["writer"], &log);
    let mut graph = build(specs);
    let report = process(ProcessMode::Workflow)
        .with_gate("draft", Gate::when(|_| true).or_route("expand"))
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert_eq!(entries(&log), vec!["writer:draft", "writer:publish"]);
    assert_eq!(report.state_of(&"expand".into()), Some(TaskState::Pending));
}

/// Test: Failure cascades only to dependents
/// Given a failing root with a dependent chain and an independent branch
/// When run as a workflow
/// Then the chain fails as upstream-failed and the branch completes
#[tokio::test]
async fn test_failure_cascades_to_dependents_only() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log).with_agent("broken", FailingAgent::new("down"));
    let mut graph = build(vec![
        task("root", "broken"),
        task("mid", "writer").depends_on("root"),
        task("leaf", "writer").depends_on("mid"),
        task("side", "writer"),
        task("side2", "writer").depends_on("side"),
    ]);

    let report = process(ProcessMode::Workflow)
        .run(&mut graph, &agents)
        .await
        .unwrap();

    assert_eq!(report.state_of(&"root".into()), Some(TaskState::Failed));
    for id in ["mid", "leaf"] {
        let result = report.result(&id.into()).unwrap();
        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.error.as_deref(), Some("upstream task root failed"));
    }
    assert_eq!(report.state_of(&"side2".into()), Some(TaskState::Completed));
    assert!(report.halt.is_none());
    assert_eq!(entries(&log), vec!["writer:side", "writer:side2"]);
}

/// Test: Concurrent waves report in declaration order
/// Given a diamond where b is slower than c
/// When run with max_concurrency 2
/// Then c finishes first but results stay in declaration order
#[tokio::test(start_paused = true)]
async fn test_concurrent_wave_keeps_declaration_order() {
    let log = call_log();
    let agents = AgentPool::new()
        .with_agent("fast", RecordingAgent::new("fast", &log))
        .with_agent("slow", RecordingAgent::new("slow", &log).with_delay(Duration::from_millis(200)));
    let mut specs = diamond("fast");
    specs[1].agent_id = "slow".into();

    let mut config = ProcessConfig::new(ProcessMode::Workflow);
    config.max_concurrency = 2;
    let mut graph = build(specs);
    let start = tokio::time::Instant::now();

    let report = process_with(config).run(&mut graph, &agents).await.unwrap();

    assert_eq!(entries(&log), vec!["fast:a", "fast:c", "slow:b", "fast:d"]);
    let ids: Vec<&str> = report.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    assert!(report.is_success());
    assert!(start.elapsed() < Duration::from_millis(400));
}

/// Test: Dependents see their dependencies' outputs
#[tokio::test]
async fn test_dependency_outputs_in_context() {
    let log = call_log();
    let writer = RecordingAgent::new("writer", &log);
    let prompts = writer.prompts();
    let agents = AgentPool::new().with_agent("writer", writer);
    let mut graph = build(diamond("writer"));

    process(ProcessMode::Workflow)
        .run(&mut graph, &agents)
        .await
        .unwrap();

    let prompts = prompts.lock().unwrap();
    let d = prompts.last().unwrap();
    assert!(d.starts_with("d\n"));
    assert!(d.contains("[b]\nwriter did b"));
    assert!(d.contains("[c]\nwriter did c"));
    assert!(!d.contains("[a]"));
}

/// Test: Loop task iterates until its condition holds
/// Given a task wrapped in a loop waiting for APPROVED
/// When the agent approves on the third attempt
/// Then the task completes with the final output and three iterations
#[tokio::test]
async fn test_loop_task_until_condition() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log).with_agent(
        "author",
        SequenceAgent::new(&["rough draft", "better draft", "APPROVED final"]),
    );
    let mut graph = build(vec![
        task("essay", "author"),
        task("review", "writer").depends_on("essay"),
    ]);
    let process = process(ProcessMode::Workflow).with_loop(
        "essay",
        Repeat::new().until_fn(|ctx| ctx.last_output.starts_with("APPROVED")),
    );

    let report = process.run(&mut graph, &agents).await.unwrap();

    let essay = report.result(&"essay".into()).unwrap();
    assert_eq!(essay.state, TaskState::Completed);
    assert_eq!(essay.output.as_deref(), Some("APPROVED final"));
    assert_eq!(essay.iterations, Some(3));
    assert!(report.is_success());
    // Two earlier attempts, the final essay and the review.
    assert_eq!(report.ledger.turns(), 4);
}

/// Test: Loop exhaustion fails the task and its dependents
#[tokio::test]
async fn test_loop_exhaustion_fails_task() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log)
        .with_agent("author", SequenceAgent::new(&["never good enough"]));
    let mut graph = build(vec![
        task("essay", "author"),
        task("review", "writer").depends_on("essay"),
    ]);
    let process = process(ProcessMode::Workflow).with_loop(
        "essay",
        Repeat::new()
            .with_max_iterations(2)
            .until_fn(|ctx| ctx.last_output.starts_with("APPROVED")),
    );

    let report = process.run(&mut graph, &agents).await.unwrap();

    let essay = report.result(&"essay".into()).unwrap();
    assert_eq!(essay.state, TaskState::Failed);
    assert!(essay.error.as_deref().unwrap().contains("Loop exhausted after 2 iterations"));
    assert_eq!(report.state_of(&"review".into()), Some(TaskState::Failed));
    assert!(entries(&log).is_empty());
}

/// Test: Lifecycle events are emitted in order
#[tokio::test]
async fn test_events_emitted() {
    let log = call_log();
    let agents = recording_pool(&["writer"], &log);
    let mut graph = build(vec![task("T1", "writer"), task("T2", "writer").depends_on("T1")]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let process = process(ProcessMode::Workflow)
        .with_gate("T1", Gate::when(|_| false))
        .with_events(tx);

    process.run(&mut graph, &agents).await.unwrap();
    drop(process);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            ProcessEvent::TaskStarted {
                task_id: "T1".into(),
                agent_id: "writer".into()
            },
            ProcessEvent::TaskCompleted {
                task_id: "T1".into()
            },
            ProcessEvent::GateEvaluated {
                task_id: "T1".into(),
                outcome: GateOutcome::Halted
            },
            ProcessEvent::Finished {
                halt: Some(Halt::Gate { task: "T1".into() })
            },
        ]
    );
}

/// Test: Cancelling mid-run stops before the next chunk
/// Given a and c ready, b after a, one task at a time
/// When a's agent cancels the run while it works
/// Then a completes, b and c stay pending, and the run reports cancellation
#[tokio::test]
async fn test_cancel_inside_agent_call() {
    let log = call_log();
    let config = ProcessConfig {
        max_concurrency: 1,
        ..ProcessConfig::new(ProcessMode::Workflow)
    };
    let process = process_with(config);
    let token = process.cancellation_token();
    let agents = recording_pool(&["writer"], &log).with_agent(
        "stopper",
        FnAgent::new(move |_| {
            token.cancel();
            async { Ok("stopped".to_string()) }
        }),
    );
    let mut graph = build(vec![
        task("a", "stopper"),
        task("b", "writer").depends_on("a"),
        task("c", "writer"),
    ]);

    let report = process.run(&mut graph, &agents).await.unwrap();

    assert_eq!(report.halt, Some(Halt::Cancelled));
    assert_eq!(graph.task(&"a".into()).unwrap().state, TaskState::Completed);
    assert_eq!(graph.task(&"b".into()).unwrap().state, TaskState::Pending);
    assert_eq!(graph.task(&"c".into()).unwrap().state, TaskState::Pending);
    assert!(entries(&log).is_empty());
}
