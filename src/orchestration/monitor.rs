//! Heartbeat monitor for the items of one stage.
//!
//! The `HeartbeatMonitor` is a single poll loop per stage. It collects the
//! terminal results workers send back, checks heartbeat age on a fixed
//! interval and fails any started item that has gone quiet for longer than
//! the stall timeout. That check is independent of the worker's own hard
//! timeout. A stalled item also hands its pool slot back, so a body that
//! blocks its thread cannot starve the items queued behind it.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::{ItemErrorKind, ItemId, ItemResult};
use crate::orchestration::heartbeat::HeartbeatReader;
use crate::orchestration::orchestrator::RunEvent;
use crate::orchestration::worker::PoolSlot;

/// Default interval between monitor polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default time without a heartbeat before an item is considered stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Shortest poll interval the monitor will use.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// One dispatched item as the monitor sees it.
#[derive(Debug)]
pub struct InFlight {
    pub item_id: ItemId,
    /// A failure of this item cancels the rest of the stage.
    pub critical: bool,
    pub heartbeat: HeartbeatReader,
    pub cancel: CancellationToken,
    pub slot: PoolSlot,
}

/// Everything the monitor learned about a stage.
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub results: BTreeMap<ItemId, ItemResult>,
    /// First critical item observed to fail.
    pub critical_failure: Option<ItemId>,
}

struct Tracked {
    entry: InFlight,
    started: bool,
}

pub struct HeartbeatMonitor {
    config: MonitorConfig,
    event_tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl HeartbeatMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            event_tx: None,
        }
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

    /// Wait until every item in `in_flight` has a terminal result.
    ///
    /// `results` carries worker reports. When a critical item fails,
    /// `stage_cancel` is cancelled so the remaining workers wind down; their
    /// (cancelled) results are still collected. A stalled item is cancelled
    /// and recorded as a timeout; anything it sends afterwards is ignored.
    pub async fn await_stage(
        &self,
        in_flight: Vec<InFlight>,
        mut results: mpsc::UnboundedReceiver<(ItemId, ItemResult)>,
        stage_cancel: &CancellationToken,
    ) -> StageOutcome {
        let mut pending: BTreeMap<ItemId, Tracked> = in_flight
            .into_iter()
            .map(|entry| {
                (
                    entry.item_id.clone(),
                    Tracked {
                        entry,
                        started: false,
                    },
                )
            })
            .collect();
        let mut outcome = StageOutcome::default();

        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !pending.is_empty() {
            tokio::select! {
                received = results.recv() => match received {
                    Some((id, result)) => {
                        match pending.remove(&id) {
                            Some(tracked) => {
                                self.record(&mut outcome, id, result, tracked.entry.critical, stage_cancel);
                            }
                            None => {
                                tracing::debug!(item = %id, "late result ignored");
                            }
                        }
                    }
                    None => {
                        // Every worker is gone; whatever is left never reported.
                        for (id, tracked) in std::mem::take(&mut pending) {
                            let result = ItemResult::failure(
                                ItemErrorKind::TaskBodyFailure,
                                "worker exited without reporting a result",
                            );
                            self.record(&mut outcome, id, result, tracked.entry.critical, stage_cancel);
                        }
                    }
                },
                _ = ticker.tick() => {
                    self.poll(&mut pending, &mut outcome, stage_cancel);
                }
            }
        }

        outcome
    }

    fn poll(
        &self,
        pending: &mut BTreeMap<ItemId, Tracked>,
        outcome: &mut StageOutcome,
        stage_cancel: &CancellationToken,
    ) {
        let now = Instant::now();
        let mut stalled = Vec::new();

        for (id, tracked) in pending.iter_mut() {
            if let Some(record) = tracked.entry.heartbeat.take_changed() {
                if !tracked.started {
                    tracked.started = true;
                    self.emit(RunEvent::ItemStarted { item: id.clone() });
                }
                self.emit(RunEvent::ItemHeartbeat {
                    item: id.clone(),
                    note: record.note.clone(),
                });
            }

            // Queued items have no record yet and cannot stall.
            let Some(record) = tracked.entry.heartbeat.latest() else {
                continue;
            };
            let age = record.age(now);
            if age > self.config.stall_timeout {
                stalled.push((id.clone(), age));
            }
        }

        tracing::trace!(pending = pending.len(), stalled = stalled.len(), "monitor poll");

        for (id, age) in stalled {
            if let Some(tracked) = pending.remove(&id) {
                tracing::warn!(item = %id, ?age, "no heartbeat within stall timeout");
                tracked.entry.cancel.cancel();
                if tracked.entry.slot.release() {
                    tracing::debug!(item = %id, "pool slot reclaimed from stalled worker");
                }
                let result = ItemResult::failure(
                    ItemErrorKind::Timeout,
                    format!("no heartbeat for {:?} (stall timeout {:?})", age, self.config.stall_timeout),
                )
                .with_wall_time(age);
                self.record(outcome, id, result, tracked.entry.critical, stage_cancel);
            }
        }
    }

    fn record(
        &self,
        outcome: &mut StageOutcome,
        id: ItemId,
        result: ItemResult,
        critical: bool,
        stage_cancel: &CancellationToken,
    ) {
        if critical && result.is_failure() && outcome.critical_failure.is_none() {
            tracing::warn!(item = %id, "critical item failed, cancelling stage");
            outcome.critical_failure = Some(id.clone());
            stage_cancel.cancel();
        }
        self.emit(RunEvent::ItemFinished {
            item: id.clone(),
            status: result.status,
        });
        outcome.results.insert(id, result);
    }
}
