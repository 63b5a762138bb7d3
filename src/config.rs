use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::ItemKind;
use crate::orchestration::OrchestratorConfig;
use crate::util::expand_tilde;
use crate::{Error, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
    pub stall_timeout_secs: u64,
    pub default_timeout_secs: u64,
    pub critical_kinds: Vec<ItemKind>,
    pub checkpoint_dir: Option<String>,
    /// Keyed by kind name (`generate`, `execute`, `review`, `merge`).
    pub kind_timeouts_secs: BTreeMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            critical_kinds: Vec::new(),
            checkpoint_dir: None,
            kind_timeouts_secs: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn stagehand_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".stagehand"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::stagehand_dir()?.join("stagehand.toml"))
    }

    pub fn checkpoints_dir(&self) -> Result<PathBuf> {
        match &self.checkpoint_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::stagehand_dir()?.join("checkpoints")),
        }
    }

    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load_from");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_concurrency = config.max_concurrency,
            stall_timeout_secs = config.stall_timeout_secs,
            critical = ?config.critical_kinds,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms >= self.stall_timeout_secs.saturating_mul(1000) {
            return Err(Error::Validation(format!(
                "poll_interval_ms ({}) must be shorter than stall_timeout_secs ({})",
                self.poll_interval_ms, self.stall_timeout_secs
            )));
        }
        for kind in self.kind_timeouts_secs.keys() {
            kind.parse::<ItemKind>().map_err(Error::Validation)?;
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let kind_timeouts: HashMap<ItemKind, Duration> = self
            .kind_timeouts_secs
            .iter()
            .filter_map(|(kind, secs)| {
                let kind = kind.parse::<ItemKind>().ok()?;
                Some((kind, Duration::from_secs(*secs)))
            })
            .collect();
        OrchestratorConfig {
            max_concurrency: self.max_concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            kind_timeouts,
            critical_kinds: self.critical_kinds.iter().copied().collect::<HashSet<_>>(),
        }
    }
}
