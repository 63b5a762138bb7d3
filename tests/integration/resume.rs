//! Checkpoint and resume integration tests.
//!
//! These tests verify that a run resumed from its checkpoints produces the
//! same report as an uninterrupted run, and that a resume over changed
//! input is refused.

use std::sync::Arc;

use tempfile::TempDir;

use stagehand::core::{ItemKind, WorkItem};
use stagehand::orchestration::{
    CheckpointStore, FileCheckpointStore, Orchestrator, OrchestratorConfig, RunContext, RunId,
    RunState,
};
use stagehand::Error;

use crate::fixtures::{exec, item, memory_context, registry, Script, ScriptedHandler};

fn two_stage_items() -> Vec<WorkItem> {
    vec![
        item("draft", ItemKind::Generate, &[], &["docs/guide.md"]),
        item("extract", ItemKind::Generate, &[], &["docs/api.md"]),
        item("review", ItemKind::Review, &["draft", "extract"], &[]),
        item("publish", ItemKind::Merge, &["draft"], &["site"]),
    ]
}

fn scripted() -> ScriptedHandler {
    ScriptedHandler::new().script("extract", Script::Partial("2 endpoints undocumented"))
}

/// Test: Scenario 5, resume equivalence
/// Given a two-stage run checkpointed after its first stage
/// When it is restarted with the same items
/// Then it replays stage 0, runs only stage 1, and reports exactly what an
/// uninterrupted run reports
#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    // Uninterrupted reference run.
    let reference_handler = Arc::new(scripted());
    let (reference_ctx, _) = memory_context("reference", OrchestratorConfig::default());
    let reference = Orchestrator::new(registry(&reference_handler))
        .run(&reference_ctx, two_stage_items())
        .await
        .unwrap();
    assert_eq!(reference.stages.len(), 2);

    // Same run, interrupted after stage 0: only its checkpoint survives.
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let run_id = RunId::parse("interrupted").unwrap();
    let ctx = RunContext::new(run_id.clone(), store.clone(), OrchestratorConfig::default());
    let first_handler = Arc::new(scripted());
    Orchestrator::new(registry(&first_handler))
        .run(&ctx, two_stage_items())
        .await
        .unwrap();
    std::fs::remove_file(dir.path().join("interrupted").join("stage-0001.json")).unwrap();
    assert!(store.exists(&run_id, 0).await.unwrap());
    assert!(!store.exists(&run_id, 1).await.unwrap());

    let resumed_handler = Arc::new(scripted());
    let resumed = Orchestrator::new(registry(&resumed_handler))
        .resume(&ctx, two_stage_items())
        .await
        .unwrap();

    assert_eq!(resumed.state, RunState::Done);
    assert_eq!(resumed.report, reference.report);
    let mut calls = resumed_handler.calls();
    calls.sort();
    assert_eq!(calls, vec!["publish", "review"]);
    assert!(store.exists(&run_id, 1).await.unwrap());
}

/// Test: Resume of a finished run
/// Given a run whose every stage is checkpointed
/// When it is resumed
/// Then nothing is dispatched and the report is unchanged
#[tokio::test]
async fn test_resume_of_complete_run_replays_everything() {
    let handler = Arc::new(scripted());
    let (ctx, store) = memory_context("complete", OrchestratorConfig::default());
    let first = Orchestrator::new(registry(&handler))
        .run(&ctx, two_stage_items())
        .await
        .unwrap();

    let idle = Arc::new(scripted());
    let again = Orchestrator::new(registry(&idle))
        .resume(&ctx, two_stage_items())
        .await
        .unwrap();

    assert!(idle.calls().is_empty());
    assert_eq!(again.report, first.report);
    assert_eq!(again.results, first.results);
    assert_eq!(store.len().await, 2);
}

/// Test: Resume over changed input
/// Given checkpoints recorded for one item set
/// When the run is resumed with items that stage differently
/// Then the resume fails with ResumeMismatch and no worker runs
#[tokio::test]
async fn test_resume_with_changed_items_is_refused() {
    let handler = Arc::new(scripted());
    let (ctx, _store) = memory_context("changed", OrchestratorConfig::default());
    Orchestrator::new(registry(&handler))
        .run(&ctx, two_stage_items())
        .await
        .unwrap();

    // "extract" now depends on "draft", moving it out of stage 0.
    let mut changed = two_stage_items();
    changed[1] = item("extract", ItemKind::Generate, &["draft"], &["docs/api.md"]);

    let idle = Arc::new(scripted());
    let err = Orchestrator::new(registry(&idle))
        .resume(&ctx, changed)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ResumeMismatch { stage: 0, .. }), "got {err}");
    assert!(idle.calls().is_empty());
}

/// Test: Resume with an extra item
/// Given checkpoints for stage 0 of a smaller item set
/// When an independent item is added and the run resumed
/// Then the stage 0 item sets differ and the resume is refused
#[tokio::test]
async fn test_resume_with_added_item_is_refused() {
    let handler = Arc::new(ScriptedHandler::new());
    let (ctx, _store) = memory_context("added", OrchestratorConfig::default());
    Orchestrator::new(registry(&handler))
        .run(&ctx, vec![exec("a", &[])])
        .await
        .unwrap();

    let err = Orchestrator::new(registry(&handler))
        .resume(&ctx, vec![exec("a", &[]), exec("b", &[])])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not match current input"));
}

/// Test: Resume after a critical abort
/// Given a run aborted in stage 1 by a critical failure
/// When it is resumed with the failure fixed
/// Then stage 0 is replayed, stage 1 re-runs and the run completes
#[tokio::test]
async fn test_resume_after_abort_reruns_aborted_stage() {
    let config = OrchestratorConfig::default().with_critical(ItemKind::Merge);
    let (ctx, store) = memory_context("retry", config);

    let failing = Arc::new(scripted().script("publish", Script::Fail("site locked")));
    let aborted = Orchestrator::new(registry(&failing))
        .run(&ctx, two_stage_items())
        .await
        .unwrap();
    assert_eq!(aborted.state, RunState::Aborted);
    assert_eq!(store.len().await, 1);

    let fixed = Arc::new(scripted());
    let resumed = Orchestrator::new(registry(&fixed))
        .resume(&ctx, two_stage_items())
        .await
        .unwrap();
    assert_eq!(resumed.state, RunState::Done);
    assert!(!fixed.was_called("draft"));
    assert!(fixed.was_called("publish"));
}
