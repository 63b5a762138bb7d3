//! Run manifests: the item set for one run, read from JSON or TOML.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{DependencyGraph, ItemKind, WorkItem};
use crate::error::GraphError;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub items: Vec<WorkItem>,
    /// Overrides `critical_kinds` from the config file when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_kinds: Option<Vec<ItemKind>>,
}

impl Manifest {
    /// Load a manifest, choosing the format by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let manifest = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents)?,
            Some("toml") => Self::from_toml_str(&contents)?,
            other => {
                return Err(Error::Validation(format!(
                    "unsupported manifest extension {:?} (expected .json or .toml)",
                    other.unwrap_or("")
                )))
            }
        };
        tracing::debug!(path = %path.display(), items = manifest.items.len(), "manifest loaded");
        Ok(manifest)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(contents)?;
        manifest.check_ids()?;
        Ok(manifest)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(contents)?;
        manifest.check_ids()?;
        Ok(manifest)
    }

    fn check_ids(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if !seen.insert(item.id()) {
                return Err(GraphError::DuplicateId(item.id().clone()).into());
            }
        }
        Ok(())
    }

    /// Build the dependency graph, surfacing cycles and unknown ids.
    pub fn graph(&self) -> Result<DependencyGraph> {
        Ok(DependencyGraph::build(self.items.clone())?)
    }
}
