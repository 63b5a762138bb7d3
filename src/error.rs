use thiserror::Error;

use crate::core::ItemId;

/// Fatal problems with the shape of the input graph.
///
/// These are raised before any worker runs and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<ItemId> },

    #[error("Item {item} depends on unknown item {missing}")]
    UnknownDependency { item: ItemId, missing: ItemId },

    #[error("Duplicate item id: {0}")]
    DuplicateId(ItemId),
}

fn format_path(path: &[ItemId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" → ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Checkpoint for stage {stage} does not match current input: {reason}")]
    ResumeMismatch { stage: usize, reason: String },

    #[error("Checkpoint already exists for run {run_id} stage {stage}")]
    CheckpointExists { run_id: String, stage: usize },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, Error>;
