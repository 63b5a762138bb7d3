//! The run orchestrator.
//!
//! `Orchestrator::run` validates and stages an item set, then drives the
//! stages strictly one after another: dispatch a bounded pool of workers,
//! wait on the heartbeat monitor until every item is terminal, checkpoint,
//! and either advance or abort. The control loop itself only ever blocks on
//! the monitor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::{
    DependencyGraph, ItemErrorKind, ItemId, ItemKind, ItemResult, ItemStatus, Stage, WorkItem,
};
use crate::orchestration::checkpoint::{Checkpoint, CheckpointStore, RunId};
use crate::orchestration::heartbeat;
use crate::orchestration::monitor::{
    HeartbeatMonitor, InFlight, MonitorConfig, DEFAULT_POLL_INTERVAL, DEFAULT_STALL_TIMEOUT,
};
use crate::orchestration::report::{finalize, Report};
use crate::orchestration::state::{RunState, RunStateMachine};
use crate::orchestration::task::{HandlerRegistry, SharedContext, SharedContextProvider};
use crate::orchestration::worker::{self, Assignment, PoolSlot};
use crate::{Error, Result};

/// Default hard timeout for a task body.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(1800);

/// Runtime knobs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Workers allowed to run at once within a stage.
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    pub default_timeout: Duration,
    pub kind_timeouts: HashMap<ItemKind, Duration>,
    /// Kinds whose failure aborts the run.
    pub critical_kinds: HashSet<ItemKind>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            default_timeout: DEFAULT_TASK_TIMEOUT,
            kind_timeouts: HashMap::new(),
            critical_kinds: HashSet::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout_for(&self, kind: ItemKind) -> Duration {
        self.kind_timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn is_critical(&self, kind: ItemKind) -> bool {
        self.critical_kinds.contains(&kind)
    }

    pub fn with_critical(mut self, kind: ItemKind) -> Self {
        self.critical_kinds.insert(kind);
        self
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_timeout(mut self, kind: ItemKind, timeout: Duration) -> Self {
        self.kind_timeouts.insert(kind, timeout);
        self
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: self.poll_interval,
            stall_timeout: self.stall_timeout,
        }
    }
}

/// Explicit per-run context threaded through every call.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub store: Arc<dyn CheckpointStore>,
    pub config: OrchestratorConfig,
}

impl RunContext {
    pub fn new(run_id: RunId, store: Arc<dyn CheckpointStore>, config: OrchestratorConfig) -> Self {
        Self {
            run_id,
            store,
            config,
        }
    }
}

/// Progress notifications for callers that want to follow a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// Staging succeeded.
    Staged { stages: Vec<Stage> },
    StageStarted { index: usize, items: Vec<ItemId> },
    /// Results for a stage were taken from its checkpoint.
    StageReplayed { index: usize },
    /// A worker got its pool slot and sent its first heartbeat.
    ItemStarted { item: ItemId },
    ItemHeartbeat { item: ItemId, note: Option<String> },
    ItemFinished { item: ItemId, status: ItemStatus },
    StageCheckpointed { index: usize },
    /// A critical item failed; no further stages run.
    Aborted { stage: usize, item: ItemId },
    Finished { state: RunState },
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: RunState,
    pub stages: Vec<Stage>,
    /// One result per input item.
    pub results: BTreeMap<ItemId, ItemResult>,
    pub report: Report,
    pub history: Vec<RunState>,
}

impl RunOutcome {
    pub fn result(&self, id: &str) -> Option<&ItemResult> {
        self.results.get(&ItemId::new(id))
    }
}

pub struct Orchestrator {
    registry: Arc<HandlerRegistry>,
    context_provider: Option<Arc<dyn SharedContextProvider>>,
    event_tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            context_provider: None,
            event_tx: None,
        }
    }

    /// Compute a shared context once per stage with `provider`.
    pub fn with_context_provider(mut self, provider: Arc<dyn SharedContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run `items` from scratch.
    pub async fn run(&self, ctx: &RunContext, items: Vec<WorkItem>) -> Result<RunOutcome> {
        self.run_with_resume(ctx, items, Vec::new()).await
    }

    /// Resume `ctx.run_id` from whatever checkpoints its store holds.
    pub async fn resume(&self, ctx: &RunContext, items: Vec<WorkItem>) -> Result<RunOutcome> {
        let checkpoints = ctx.store.load_run(&ctx.run_id).await?;
        tracing::info!(run_id = %ctx.run_id, checkpoints = checkpoints.len(), "resuming run");
        self.run_with_resume(ctx, items, checkpoints).await
    }

    /// Run `items`, replaying `checkpoints` for the stages they cover.
    ///
    /// Checkpoints must describe stages `0..n` of the same run, each with
    /// exactly the item set staging computes now. Anything else is a
    /// `ResumeMismatch`, raised before any worker runs.
    pub async fn run_with_resume(
        &self,
        ctx: &RunContext,
        items: Vec<WorkItem>,
        checkpoints: Vec<Checkpoint>,
    ) -> Result<RunOutcome> {
        let mut sm = RunStateMachine::new();
        sm.transition(RunState::Staging)?;

        let graph = match DependencyGraph::build(items) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::error!(run_id = %ctx.run_id, error = %e, "staging failed");
                sm.transition(RunState::Aborted)?;
                return Err(e.into());
            }
        };
        let stages = graph.stages();
        tracing::info!(
            run_id = %ctx.run_id,
            items = graph.len(),
            stages = stages.len(),
            "staged run"
        );

        let replay = match verify_checkpoints(&ctx.run_id, &stages, checkpoints) {
            Ok(replay) => replay,
            Err(e) => {
                tracing::error!(run_id = %ctx.run_id, error = %e, "refusing to resume");
                sm.transition(RunState::Aborted)?;
                return Err(e);
            }
        };
        let first_live = replay.len();
        if first_live < stages.len() && ctx.store.exists(&ctx.run_id, first_live).await? {
            return Err(Error::CheckpointExists {
                run_id: ctx.run_id.to_string(),
                stage: first_live,
            });
        }
        self.emit(RunEvent::Staged {
            stages: stages.clone(),
        });

        let mut results: BTreeMap<ItemId, ItemResult> = BTreeMap::new();
        let mut aborted = false;

        for stage in &stages {
            sm.transition(RunState::RunningStage(stage.index))?;

            let replayed = replay.get(stage.index);
            let stage_results = match replayed {
                Some(checkpoint) => {
                    tracing::info!(run_id = %ctx.run_id, stage = stage.index, "replaying stage");
                    self.emit(RunEvent::StageReplayed { index: stage.index });
                    checkpoint.items.clone()
                }
                None => {
                    self.emit(RunEvent::StageStarted {
                        index: stage.index,
                        items: stage.items.clone(),
                    });
                    self.run_stage(ctx, &graph, stage, &results).await
                }
            };

            let critical = stage.items.iter().find(|id| {
                let failed = stage_results.get(*id).map_or(true, ItemResult::is_failure);
                let kind = graph.get(id).map(|item| item.kind());
                failed && kind.is_some_and(|k| ctx.config.is_critical(k))
            });

            if let Some(item) = critical.cloned() {
                results.extend(stage_results);
                tracing::warn!(run_id = %ctx.run_id, stage = stage.index, item = %item, "critical item failed, aborting run");
                sm.transition(RunState::Aborted)?;
                self.emit(RunEvent::Aborted {
                    stage: stage.index,
                    item,
                });
                aborted = true;
                break;
            }

            if replayed.is_none() {
                let checkpoint = Checkpoint::new(ctx.run_id.clone(), stage.index, stage_results.clone());
                ctx.store.write(&checkpoint).await?;
                self.emit(RunEvent::StageCheckpointed { index: stage.index });
            }
            results.extend(stage_results);
        }

        if aborted {
            fill_undispatched(&graph, &stages, &mut results);
        } else {
            sm.transition(RunState::Aggregating)?;
        }

        let state = if aborted {
            RunState::Aborted
        } else {
            RunState::Done
        };
        let report = finalize(state, &stages, &results, &graph);
        if !aborted {
            sm.transition(RunState::Done)?;
        }

        tracing::info!(
            run_id = %ctx.run_id,
            state = %state,
            success = report.counts.success,
            partial = report.counts.partial,
            failure = report.counts.failure,
            "run finished"
        );
        self.emit(RunEvent::Finished { state });

        Ok(RunOutcome {
            run_id: ctx.run_id.clone(),
            state,
            stages,
            results,
            report,
            history: sm.states(),
        })
    }

    /// Execute one stage and return a result for every item in it.
    async fn run_stage(
        &self,
        ctx: &RunContext,
        graph: &DependencyGraph,
        stage: &Stage,
        prior: &BTreeMap<ItemId, ItemResult>,
    ) -> BTreeMap<ItemId, ItemResult> {
        let mut results = BTreeMap::new();
        let mut ready: Vec<Arc<WorkItem>> = Vec::new();

        for id in &stage.items {
            let Some(item) = graph.get(id) else {
                continue;
            };
            let unsatisfied = item.dependencies().iter().find(|dep| {
                !prior
                    .get(*dep)
                    .is_some_and(|r| r.status.satisfies_dependents())
            });
            match unsatisfied {
                Some(dep) => {
                    tracing::info!(item = %id, dependency = %dep, "skipping item, dependency failed");
                    self.finish(
                        &mut results,
                        id.clone(),
                        ItemResult::failure(
                            ItemErrorKind::DependencyFailed,
                            format!("dependency {} did not succeed", dep),
                        ),
                    );
                }
                None => ready.push(Arc::clone(item)),
            }
        }

        if ready.is_empty() {
            return results;
        }

        let shared: SharedContext = match &self.context_provider {
            None => Arc::new(serde_json::Value::Null),
            Some(provider) => match provider.build(stage, &ready, prior).await {
                Ok(value) => Arc::new(value),
                Err(e) => {
                    tracing::error!(stage = stage.index, error = %e, "shared context failed");
                    for item in ready {
                        self.finish(
                            &mut results,
                            item.id().clone(),
                            ItemResult::failure(
                                ItemErrorKind::TaskBodyFailure,
                                format!("shared context: {}", e),
                            ),
                        );
                    }
                    return results;
                }
            },
        };

        tracing::info!(
            run_id = %ctx.run_id,
            stage = stage.index,
            dispatched = ready.len(),
            concurrency = ctx.config.max_concurrency,
            "dispatching stage"
        );

        let stage_cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(ctx.config.max_concurrency.max(1)));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let mut in_flight = Vec::with_capacity(ready.len());
        let mut handles = Vec::with_capacity(ready.len());

        for item in ready {
            let cancel = stage_cancel.child_token();
            let (beat, reader) = heartbeat::channel(item.id().clone());
            let slot = PoolSlot::new();
            let dependencies = item
                .dependencies()
                .iter()
                .filter_map(|dep| prior.get(dep).map(|r| (dep.clone(), r.clone())))
                .collect();

            in_flight.push(InFlight {
                item_id: item.id().clone(),
                critical: ctx.config.is_critical(item.kind()),
                heartbeat: reader,
                cancel: cancel.clone(),
                slot: slot.clone(),
            });
            let assignment = Assignment {
                timeout: ctx.config.timeout_for(item.kind()),
                item,
                shared: Arc::clone(&shared),
                dependencies,
                cancel,
                heartbeat: beat,
            };
            handles.push(worker::spawn(
                Arc::clone(&self.registry),
                Arc::clone(&permits),
                slot,
                assignment,
                result_tx.clone(),
            ));
        }
        // Workers hold the only senders now; the monitor sees the channel
        // close if one of them dies without reporting.
        drop(result_tx);

        let mut monitor = HeartbeatMonitor::new(ctx.config.monitor_config());
        if let Some(events) = &self.event_tx {
            monitor = monitor.with_events(events.clone());
        }
        let outcome = monitor.await_stage(in_flight, result_rx, &stage_cancel).await;

        if let Some(item) = &outcome.critical_failure {
            tracing::debug!(stage = stage.index, item = %item, "stage cancelled by critical failure");
        }
        // Anything still running was given up on by the monitor.
        stage_cancel.cancel();
        for handle in handles {
            handle.abort();
        }

        results.extend(outcome.results);
        results
    }

    fn finish(&self, results: &mut BTreeMap<ItemId, ItemResult>, id: ItemId, result: ItemResult) {
        self.emit(RunEvent::ItemFinished {
            item: id.clone(),
            status: result.status,
        });
        results.insert(id, result);
    }
}

/// Check supplied checkpoints against freshly computed stages.
///
/// Returns them ordered by stage index.
fn verify_checkpoints(
    run_id: &RunId,
    stages: &[Stage],
    mut checkpoints: Vec<Checkpoint>,
) -> Result<Vec<Checkpoint>> {
    checkpoints.sort_by_key(|c| c.stage_index);

    for (position, checkpoint) in checkpoints.iter().enumerate() {
        let stage = checkpoint.stage_index;
        let mismatch = |reason: String| Error::ResumeMismatch { stage, reason };

        if checkpoint.run_id != *run_id {
            return Err(mismatch(format!(
                "checkpoint belongs to run {}, not {}",
                checkpoint.run_id, run_id
            )));
        }
        if stage != position {
            return Err(mismatch(format!(
                "checkpoints are not contiguous: expected stage {}",
                position
            )));
        }
        let Some(expected) = stages.get(stage) else {
            return Err(mismatch(format!(
                "input now stages into only {} stages",
                stages.len()
            )));
        };
        let recorded: Vec<&ItemId> = checkpoint.items.keys().collect();
        let computed: Vec<&ItemId> = expected.items.iter().collect();
        if recorded != computed {
            return Err(mismatch(format!(
                "recorded items [{}] but staging now computes [{}]",
                join(&recorded),
                join(&computed)
            )));
        }
    }

    Ok(checkpoints)
}

fn join(ids: &[&ItemId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

/// Give every item left behind by an abort a terminal result.
fn fill_undispatched(
    graph: &DependencyGraph,
    stages: &[Stage],
    results: &mut BTreeMap<ItemId, ItemResult>,
) {
    for stage in stages {
        for id in &stage.items {
            if results.contains_key(id) {
                continue;
            }
            let failed_dep = graph.get(id).and_then(|item| {
                item.dependencies()
                    .iter()
                    .find(|dep| {
                        results.get(*dep).is_some_and(|r| {
                            r.is_failure() && r.error_kind() != Some(ItemErrorKind::Aborted)
                        })
                    })
                    .cloned()
            });
            let result = match failed_dep {
                Some(dep) => ItemResult::failure(
                    ItemErrorKind::DependencyFailed,
                    format!("dependency {} did not succeed", dep),
                ),
                None => ItemResult::failure(ItemErrorKind::Aborted, "run aborted before dispatch"),
            };
            results.insert(id.clone(), result);
        }
    }
}
