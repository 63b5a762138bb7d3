//! Worker: runs one item's task body inside a hard timeout.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{ItemError, ItemErrorKind, ItemId, ItemResult, WorkItem};
use crate::orchestration::heartbeat::Heartbeat;
use crate::orchestration::task::{HandlerRegistry, SharedContext, TaskContext, TaskOutcome};

/// Everything needed to run one item.
pub struct Assignment {
    pub item: Arc<WorkItem>,
    pub shared: SharedContext,
    pub dependencies: BTreeMap<ItemId, ItemResult>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub heartbeat: Heartbeat,
}

/// Execute one assignment to a terminal result.
///
/// Never fails: unsupported kinds, task errors, panics, timeouts and
/// cancellation all become failure results.
pub async fn execute(registry: &HandlerRegistry, assignment: Assignment) -> ItemResult {
    let Assignment {
        item,
        shared,
        dependencies,
        timeout,
        cancel,
        heartbeat,
    } = assignment;
    let id = item.id().clone();
    let kind = item.kind();

    let Some(handler) = registry.get(kind).cloned() else {
        tracing::warn!(item = %id, %kind, "no handler registered");
        return ItemResult::failure(
            ItemErrorKind::UnsupportedKind,
            format!("no handler registered for kind {}", kind),
        );
    };

    heartbeat.beat("started");
    let started = Instant::now();
    let ctx = TaskContext::new(item, shared, dependencies, heartbeat, cancel.clone());
    let body = AssertUnwindSafe(handler.run(&ctx)).catch_unwind();

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(item = %id, "worker cancelled");
            ItemResult::failure(ItemErrorKind::Cancelled, "cancelled")
        }
        finished = tokio::time::timeout(timeout, body) => match finished {
            Err(_) => {
                tracing::warn!(item = %id, ?timeout, "task body timed out");
                ItemResult::failure(
                    ItemErrorKind::Timeout,
                    format!("task body exceeded {:?}", timeout),
                )
            }
            Ok(Err(_panic)) => {
                tracing::error!(item = %id, "task body panicked");
                ItemResult::failure(ItemErrorKind::TaskBodyFailure, "task body panicked")
            }
            Ok(Ok(Ok(TaskOutcome::Success(output)))) => ItemResult::success(output),
            Ok(Ok(Ok(TaskOutcome::Partial { output, detail }))) => ItemResult::partial(
                output,
                ItemError::new(ItemErrorKind::TaskBodyFailure, detail),
            ),
            Ok(Ok(Err(e))) => {
                tracing::warn!(item = %id, error = %e, "task body failed");
                ItemResult::failure(ItemErrorKind::TaskBodyFailure, e.to_string())
            }
        },
    };

    result.with_wall_time(started.elapsed())
}

/// The pool permit held by one worker.
///
/// Either side may give it back: the worker when its body returns, or the
/// monitor when it gives up on a stalled item whose body never yields.
/// The permit is released exactly once.
#[derive(Debug, Clone, Default)]
pub struct PoolSlot(Arc<Mutex<Option<OwnedSemaphorePermit>>>);

impl PoolSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn hold(&self, permit: OwnedSemaphorePermit) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(permit);
    }

    /// Returns true if a permit was held and is now back in the pool.
    pub fn release(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }
}

/// Spawn a worker that waits for a pool slot, executes, and reports its
/// result on `results`.
///
/// An item cancelled while still queued is reported as cancelled without
/// running its task body.
pub fn spawn(
    registry: Arc<HandlerRegistry>,
    permits: Arc<Semaphore>,
    slot: PoolSlot,
    assignment: Assignment,
    results: mpsc::UnboundedSender<(ItemId, ItemResult)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = assignment.item.id().clone();
        let cancel = assignment.cancel.clone();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = permits.acquire_owned() => permit.ok(),
        };

        let result = match permit {
            Some(permit) => {
                slot.hold(permit);
                let result = execute(&registry, assignment).await;
                slot.release();
                result
            }
            None => ItemResult::failure(ItemErrorKind::Cancelled, "cancelled before start"),
        };

        // The monitor may have already given up on this item.
        let _ = results.send((id, result));
    })
}
