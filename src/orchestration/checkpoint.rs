//! Per-stage checkpoints and the stores that hold them.
//!
//! A checkpoint is written once, right after a stage resolves, and only read
//! back when a run is resumed. Stores are append-only: writing the same
//! `(run, stage)` twice is an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::{ItemId, ItemResult};
use crate::util::blocking;
use crate::{Error, Result};

/// Identifier of one orchestration run.
///
/// Generated ids are UUID v4. Caller-supplied ids are restricted to
/// `[A-Za-z0-9._-]` so they are safe to use as directory names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(Error::Validation(format!("invalid run id: {:?}", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for display.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// The durable record of one resolved stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub stage_index: usize,
    pub items: BTreeMap<ItemId, ItemResult>,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: RunId, stage_index: usize, items: BTreeMap<ItemId, ItemResult>) -> Self {
        Self {
            run_id,
            stage_index,
            items,
            written_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Whether a checkpoint exists, without reading it.
    async fn exists(&self, run_id: &RunId, stage: usize) -> Result<bool>;

    /// Persist a checkpoint. Fails if one already exists for that stage.
    async fn write(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn read(&self, run_id: &RunId, stage: usize) -> Result<Option<Checkpoint>>;

    /// All checkpoints of a run, sorted by stage index.
    async fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>>;
}

/// Checkpoints as JSON files: `<root>/<run_id>/stage-NNNN.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    fn stage_path(&self, run_id: &RunId, stage: usize) -> PathBuf {
        self.run_dir(run_id).join(stage_file_name(stage))
    }
}

fn stage_file_name(stage: usize) -> String {
    format!("stage-{:04}.json", stage)
}

fn parse_stage_file_name(name: &str) -> Option<usize> {
    name.strip_prefix("stage-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn exists(&self, run_id: &RunId, stage: usize) -> Result<bool> {
        let path = self.stage_path(run_id, stage);
        blocking(move || Ok(path.exists())).await
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.run_dir(&checkpoint.run_id);
        let path = self.stage_path(&checkpoint.run_id, checkpoint.stage_index);
        let contents = serde_json::to_string_pretty(checkpoint)?;
        let run_id = checkpoint.run_id.to_string();
        let stage = checkpoint.stage_index;

        blocking(move || {
            fs::create_dir_all(&dir)?;
            if path.exists() {
                return Err(Error::CheckpointExists { run_id, stage });
            }
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &path)?;
            tracing::debug!(path = %path.display(), "checkpoint written");
            Ok(())
        })
        .await
    }

    async fn read(&self, run_id: &RunId, stage: usize) -> Result<Option<Checkpoint>> {
        let path = self.stage_path(run_id, stage);
        blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            read_checkpoint(&path).map(Some)
        })
        .await
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        let dir = self.run_dir(run_id);
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut indexed = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                if let Some(stage) = name.to_str().and_then(parse_stage_file_name) {
                    indexed.push((stage, entry.path()));
                }
            }
            indexed.sort_by_key(|(stage, _)| *stage);
            indexed
                .into_iter()
                .map(|(_, path)| read_checkpoint(&path))
                .collect()
        })
        .await
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<BTreeMap<(RunId, usize), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn exists(&self, run_id: &RunId, stage: usize) -> Result<bool> {
        Ok(self
            .records
            .read()
            .await
            .contains_key(&(run_id.clone(), stage)))
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = (checkpoint.run_id.clone(), checkpoint.stage_index);
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(Error::CheckpointExists {
                run_id: checkpoint.run_id.to_string(),
                stage: checkpoint.stage_index,
            });
        }
        records.insert(key, checkpoint.clone());
        Ok(())
    }

    async fn read(&self, run_id: &RunId, stage: usize) -> Result<Option<Checkpoint>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(run_id.clone(), stage))
            .cloned())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|((run, _), _)| run == run_id)
            .map(|(_, cp)| cp.clone())
            .collect())
    }
}
