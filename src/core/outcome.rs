//! Per-item execution results.

use serde::{Deserialize, Serialize};

/// Terminal status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Partial,
    Failure,
}

impl ItemStatus {
    /// Whether dependents of an item with this status may run.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, ItemStatus::Success | ItemStatus::Partial)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Success => write!(f, "success"),
            ItemStatus::Partial => write!(f, "partial"),
            ItemStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Why an item did not fully succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Hard timeout or stalled heartbeat.
    Timeout,
    /// No handler registered for the item's kind.
    UnsupportedKind,
    /// The task body reported an error.
    TaskBodyFailure,
    /// A transitive dependency failed; the item was never dispatched.
    DependencyFailed,
    /// Cancelled in flight after a critical item in the same stage failed.
    Cancelled,
    /// Never dispatched because the run aborted.
    Aborted,
}

impl std::fmt::Display for ItemErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemErrorKind::Timeout => write!(f, "timeout"),
            ItemErrorKind::UnsupportedKind => write!(f, "unsupported_kind"),
            ItemErrorKind::TaskBodyFailure => write!(f, "task_body_failure"),
            ItemErrorKind::DependencyFailed => write!(f, "dependency_failed"),
            ItemErrorKind::Cancelled => write!(f, "cancelled"),
            ItemErrorKind::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Execution measurements. Not part of outcome equality in reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetrics {
    pub wall_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<serde_json::Value>,
}

/// The result envelope for one item.
///
/// Once the orchestrator receives a result it is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub metrics: ItemMetrics,
}

impl ItemResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            status: ItemStatus::Success,
            error: None,
            output,
            metrics: ItemMetrics::default(),
        }
    }

    pub fn partial(output: serde_json::Value, error: ItemError) -> Self {
        Self {
            status: ItemStatus::Partial,
            error: Some(error),
            output,
            metrics: ItemMetrics::default(),
        }
    }

    pub fn failure(kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Failure,
            error: Some(ItemError::new(kind, message)),
            output: serde_json::Value::Null,
            metrics: ItemMetrics::default(),
        }
    }

    pub fn with_wall_time(mut self, elapsed: std::time::Duration) -> Self {
        self.metrics.wall_time_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == ItemStatus::Failure
    }

    pub fn error_kind(&self) -> Option<ItemErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
