//! Orchestrator integration tests.
//!
//! These tests verify dispatch, dependent-skip propagation, critical
//! aborts, the concurrency bound and the per-stage shared context.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use stagehand::core::{ItemErrorKind, ItemKind, ItemStatus};
use stagehand::orchestration::{
    HandlerRegistry, Orchestrator, OrchestratorConfig, RunEvent, RunState,
};

use crate::fixtures::{exec, item, memory_context, registry, CountingProvider, Script, ScriptedHandler};

/// Test: Scenario 4, critical failure aborts the run
/// Given item 2 is critical and fails, and item 3 depends on item 2
/// When the run executes
/// Then item 1 succeeds, item 2 fails, item 3 is DependencyFailed without
/// running, and the run ends ABORTED
#[tokio::test]
async fn test_critical_failure_aborts_run() {
    let handler = Arc::new(ScriptedHandler::new().script("item2", Script::Fail("merge conflict")));
    let orch = Orchestrator::new(registry(&handler));
    let (ctx, store) = memory_context(
        "scenario-4",
        OrchestratorConfig::default().with_critical(ItemKind::Merge),
    );

    let items = vec![
        exec("item1", &[]),
        item("item2", ItemKind::Merge, &["item1"], &[]),
        exec("item3", &["item2"]),
    ];
    let outcome = orch.run(&ctx, items).await.unwrap();

    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.result("item1").unwrap().status, ItemStatus::Success);
    assert_eq!(
        outcome.result("item2").unwrap().error_kind(),
        Some(ItemErrorKind::TaskBodyFailure)
    );
    assert_eq!(
        outcome.result("item3").unwrap().error_kind(),
        Some(ItemErrorKind::DependencyFailed)
    );
    assert!(!handler.was_called("item3"));

    // Stage 0 stays checkpointed; the aborted stage is not.
    assert_eq!(store.len().await, 1);
    assert_eq!(outcome.report.state, RunState::Aborted);
    assert_eq!(outcome.report.counts.total, 3);
    assert_eq!(
        outcome.history.last().copied(),
        Some(RunState::Aborted)
    );
}

/// Test: Non-critical failure lets unrelated work continue
/// Given a failing item with a two-level dependent chain and an unrelated item
/// When the run executes
/// Then the whole chain is DependencyFailed, the unrelated item runs, and
/// the run is DONE
#[tokio::test]
async fn test_dependent_skip_propagates_through_chain() {
    let handler = Arc::new(ScriptedHandler::new().script("a", Script::Fail("bad input")));
    let orch = Orchestrator::new(registry(&handler));
    let (ctx, _store) = memory_context("chain", OrchestratorConfig::default());

    let outcome = orch
        .run(
            &ctx,
            vec![
                exec("a", &[]),
                exec("b", &["a"]),
                exec("c", &["b"]),
                exec("free", &[]),
                exec("after_free", &["free"]),
            ],
        )
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Done);
    for id in ["b", "c"] {
        assert_eq!(
            outcome.result(id).unwrap().error_kind(),
            Some(ItemErrorKind::DependencyFailed),
            "{id} should be skipped"
        );
        assert!(!handler.was_called(id));
    }
    assert_eq!(outcome.result("after_free").unwrap().status, ItemStatus::Success);
    assert_eq!(outcome.report.counts.failure, 3);
    assert_eq!(outcome.report.failed.len(), 3);
}

/// Test: Partial results satisfy dependents
/// Given an item that finishes partially
/// When its dependent is reached
/// Then the dependent still runs
#[tokio::test]
async fn test_partial_satisfies_dependents() {
    let handler = Arc::new(ScriptedHandler::new().script("gen", Script::Partial("1 of 3 sections")));
    let orch = Orchestrator::new(registry(&handler));
    let (ctx, _store) = memory_context("partial", OrchestratorConfig::default());

    let outcome = orch
        .run(
            &ctx,
            vec![
                item("gen", ItemKind::Generate, &[], &["doc.md"]),
                item("rev", ItemKind::Review, &["gen"], &[]),
            ],
        )
        .await
        .unwrap();

    assert_eq!(outcome.result("gen").unwrap().status, ItemStatus::Partial);
    assert_eq!(outcome.result("rev").unwrap().status, ItemStatus::Success);
    assert!(handler.was_called("rev"));
    // A review ran on a partial artifact.
    assert_eq!(outcome.report.findings.len(), 1);
}

/// Test: Critical failure cancels in-flight siblings
/// Given a critical item that fails next to an item that never finishes
/// When the stage runs
/// Then the hanging sibling is cancelled and the run aborts promptly
#[tokio::test]
async fn test_critical_failure_cancels_in_flight_siblings() {
    let handler = Arc::new(
        ScriptedHandler::new()
            .script("critical", Script::Fail("boom"))
            .script("slow", Script::Hang),
    );
    let orch = Orchestrator::new(registry(&handler));
    let (ctx, _store) = memory_context(
        "cancel",
        OrchestratorConfig::default().with_critical(ItemKind::Merge),
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        orch.run(
            &ctx,
            vec![
                item("critical", ItemKind::Merge, &[], &[]),
                exec("slow", &[]),
                exec("next", &["slow"]),
            ],
        ),
    )
    .await
    .expect("run should not hang")
    .unwrap();

    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(
        outcome.result("slow").unwrap().error_kind(),
        Some(ItemErrorKind::Cancelled)
    );
    assert_eq!(
        outcome.result("next").unwrap().error_kind(),
        Some(ItemErrorKind::DependencyFailed)
    );
}

/// Test: Unregistered kind
/// Given no handler for the merge kind
/// When a merge item is dispatched
/// Then it fails with UnsupportedKind, never as a silent success
#[tokio::test]
async fn test_unregistered_kind_is_unsupported() {
    let handler = Arc::new(ScriptedHandler::new());
    let registry = HandlerRegistry::new().with(ItemKind::Execute, handler.clone());
    let orch = Orchestrator::new(registry);
    let (ctx, _store) = memory_context("unsupported", OrchestratorConfig::default());

    let outcome = orch
        .run(
            &ctx,
            vec![
                item("m", ItemKind::Merge, &[], &[]),
                exec("after", &["m"]),
                exec("ok", &[]),
            ],
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.result("m").unwrap().error_kind(),
        Some(ItemErrorKind::UnsupportedKind)
    );
    assert_eq!(
        outcome.result("after").unwrap().error_kind(),
        Some(ItemErrorKind::DependencyFailed)
    );
    assert_eq!(outcome.result("ok").unwrap().status, ItemStatus::Success);
}

/// Test: Concurrency bound
/// Given eight independent slow items and a limit of three
/// When the single stage runs
/// Then no more than three task bodies ever run at once, and all finish
#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_is_respected() {
    let mut handler = ScriptedHandler::new();
    let ids: Vec<String> = (0..8).map(|i| format!("w{i}")).collect();
    for id in &ids {
        handler = handler.script(id, Script::Sleep(Duration::from_secs(1)));
    }
    let handler = Arc::new(handler);
    let orch = Orchestrator::new(registry(&handler));
    let (ctx, _store) = memory_context("bounded", OrchestratorConfig::default().with_concurrency(3));

    let items = ids.iter().map(|id| exec(id, &[])).collect();
    let outcome = orch.run(&ctx, items).await.unwrap();

    assert_eq!(outcome.stages.len(), 1);
    assert_eq!(outcome.report.counts.success, 8);
    assert_eq!(handler.peak_concurrency(), 3);
}

/// Test: Stages are strictly sequential
/// Given a slow item in stage 0 and its dependent in stage 1
/// When the run executes
/// Then the dependent starts only after the slow item finished
#[tokio::test(start_paused = true)]
async fn test_stages_run_strictly_in_order() {
    let handler = Arc::new(
        ScriptedHandler::new()
            .script("slow", Script::Sleep(Duration::from_secs(30)))
            .script("fast", Script::Succeed),
    );
    let orch = Orchestrator::new(registry(&handler));
    let (ctx, _store) = memory_context("ordered", OrchestratorConfig::default());

    orch.run(
        &ctx,
        vec![exec("slow", &[]), exec("fast", &[]), exec("then", &["slow"])],
    )
    .await
    .unwrap();

    let calls = handler.calls();
    let then = calls.iter().position(|c| c == "then").unwrap();
    assert!(calls.iter().position(|c| c == "slow").unwrap() < then);
    assert!(calls.iter().position(|c| c == "fast").unwrap() < then);
}

/// Test: Shared context is computed once per stage
/// Given two stages of several items and a counting provider
/// When the run executes
/// Then the provider is asked once per stage and every worker in a stage
/// sees the same value
#[tokio::test]
async fn test_shared_context_built_once_per_stage() {
    let handler = Arc::new(ScriptedHandler::new());
    let provider = Arc::new(CountingProvider::default());
    let orch = Orchestrator::new(registry(&handler)).with_context_provider(provider.clone());
    let (ctx, _store) = memory_context("shared", OrchestratorConfig::default());

    orch.run(
        &ctx,
        vec![
            exec("a1", &[]),
            exec("a2", &[]),
            exec("a3", &[]),
            exec("b1", &["a1"]),
            exec("b2", &["a2", "a3"]),
        ],
    )
    .await
    .unwrap();

    assert_eq!(*provider.builds.lock().unwrap(), vec![0, 1]);
    for (id, shared) in handler.shared_seen() {
        let expected_stage = if id.starts_with('a') { 0 } else { 1 };
        assert_eq!(shared["stage"], expected_stage, "{id}");
    }
    let stage_one: Vec<_> = handler
        .shared_seen()
        .into_iter()
        .filter(|(id, _)| id.starts_with('b'))
        .collect();
    assert_eq!(stage_one[0].1, stage_one[1].1);
    assert_eq!(stage_one[0].1["prior"], 3);
}

/// Test: Event stream
/// Given an event listener
/// When a two-stage run executes
/// Then it sees staging, both stages, both checkpoints, and the finish
#[tokio::test]
async fn test_events_cover_run_lifecycle() {
    let handler = Arc::new(ScriptedHandler::new());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let orch = Orchestrator::new(registry(&handler)).with_events(event_tx);
    let (ctx, _store) = memory_context("events", OrchestratorConfig::default());

    orch.run(&ctx, vec![exec("a", &[]), exec("b", &["a"])])
        .await
        .unwrap();
    drop(orch);

    let mut events = Vec::new();
    while let Some(event) = event_rx.recv().await {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(RunEvent::Staged { stages }) if stages.len() == 2));
    assert!(events.contains(&RunEvent::StageCheckpointed { index: 0 }));
    assert!(events.contains(&RunEvent::StageCheckpointed { index: 1 }));
    let finished = events
        .iter()
        .filter(|e| matches!(e, RunEvent::ItemFinished { .. }))
        .count();
    assert_eq!(finished, 2);
    assert_eq!(
        events.last(),
        Some(&RunEvent::Finished {
            state: RunState::Done
        })
    );
}
