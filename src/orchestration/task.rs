//! Task bodies and the kind → handler registry.
//!
//! The orchestrator never looks inside payloads or outputs. A handler gets a
//! `TaskContext` (item, shared stage context, results of its dependencies,
//! a heartbeat publisher and a cancellation signal) and returns a
//! `TaskOutcome` or a `TaskError`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{ItemId, ItemKind, ItemResult, Stage, WorkItem};
use crate::orchestration::heartbeat::Heartbeat;

/// Read-only data computed once per stage and shared by every worker in it.
pub type SharedContext = Arc<serde_json::Value>;

/// Failure reported by a task body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for TaskError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        Self(format!("io: {}", e))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("json: {}", e))
    }
}

/// What a task body produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// All work done.
    Success(serde_json::Value),
    /// Some work done; dependents may still run.
    Partial {
        output: serde_json::Value,
        detail: String,
    },
}

/// Everything a task body may read while it runs.
pub struct TaskContext {
    item: Arc<WorkItem>,
    shared: SharedContext,
    dependencies: BTreeMap<ItemId, ItemResult>,
    heartbeat: Heartbeat,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        item: Arc<WorkItem>,
        shared: SharedContext,
        dependencies: BTreeMap<ItemId, ItemResult>,
        heartbeat: Heartbeat,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            item,
            shared,
            dependencies,
            heartbeat,
            cancel,
        }
    }

    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn payload(&self) -> &serde_json::Value {
        self.item.payload()
    }

    pub fn shared(&self) -> &serde_json::Value {
        &self.shared
    }

    /// Result of a declared dependency.
    pub fn dependency(&self, id: &ItemId) -> Option<&ItemResult> {
        self.dependencies.get(id)
    }

    pub fn dependencies(&self) -> &BTreeMap<ItemId, ItemResult> {
        &self.dependencies
    }

    /// Publish a liveness signal with a progress note.
    pub fn heartbeat(&self, note: impl Into<String>) {
        self.heartbeat.beat(note);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the orchestrator cancels this item.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A task body for one item kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> std::result::Result<TaskOutcome, TaskError>;
}

/// Computes the per-stage shared context.
///
/// `prior` holds the results of every item resolved in earlier stages.
#[async_trait]
pub trait SharedContextProvider: Send + Sync {
    async fn build(
        &self,
        stage: &Stage,
        items: &[Arc<WorkItem>],
        prior: &BTreeMap<ItemId, ItemResult>,
    ) -> std::result::Result<serde_json::Value, TaskError>;
}

/// Registry of handlers (kind -> handler).
///
/// Built during initialization, read-only while a run is in progress.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ItemKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind, replacing any existing one.
    pub fn with(mut self, kind: ItemKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Use one handler for every kind.
    pub fn with_all(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        for kind in ItemKind::ALL {
            self.handlers.insert(kind, Arc::clone(&handler));
        }
        self
    }

    pub fn get(&self, kind: ItemKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&kind)
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<ItemKind> {
        ItemKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
