//! Work item data model.
//!
//! A `WorkItem` is the immutable description of one unit of work: its id,
//! the ids it depends on, the resources it touches, its kind, and an opaque
//! payload handed to the task body untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a work item, unique within a run.
///
/// Ordering is lexicographic and is what staging uses to break ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A normalized resource identifier used for conflict detection.
///
/// Normalization trims whitespace, converts `\` to `/`, drops a leading
/// `./`, collapses repeated separators and strips a trailing `/`, so
/// `./docs//index.md` and `docs/index.md` name the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resource(String);

impl Resource {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let unified = raw.trim().replace('\\', "/");
        let mut rest = unified.as_str();
        while let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        }

        let mut normalized = String::with_capacity(rest.len());
        for segment in rest.split('/') {
            if segment.is_empty() {
                continue;
            }
            if !normalized.is_empty() || rest.starts_with('/') {
                normalized.push('/');
            }
            normalized.push_str(segment);
        }

        if normalized.is_empty() {
            return Err(format!("empty resource identifier: {:?}", raw));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Resource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Resource> for String {
    fn from(r: Resource) -> Self {
        r.0
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of work kinds the orchestrator knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Generate a new artifact.
    Generate,
    /// Execute implementation steps.
    Execute,
    /// Review a produced artifact.
    Review,
    /// Merge two content trees.
    Merge,
}

impl ItemKind {
    pub const ALL: [ItemKind; 4] = [
        ItemKind::Generate,
        ItemKind::Execute,
        ItemKind::Review,
        ItemKind::Merge,
    ];
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Generate => write!(f, "generate"),
            ItemKind::Execute => write!(f, "execute"),
            ItemKind::Review => write!(f, "review"),
            ItemKind::Merge => write!(f, "merge"),
        }
    }
}

impl std::str::FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(ItemKind::Generate),
            "execute" => Ok(ItemKind::Execute),
            "review" => Ok(ItemKind::Review),
            "merge" => Ok(ItemKind::Merge),
            other => Err(format!("unknown item kind: {}", other)),
        }
    }
}

/// One unit of work.
///
/// Fields are private: once an item has been accepted into a run it is
/// shared behind an `Arc` and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    id: ItemId,
    #[serde(default, alias = "deps")]
    dependencies: Vec<ItemId>,
    #[serde(default)]
    touches: BTreeSet<Resource>,
    kind: ItemKind,
    #[serde(default)]
    payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(id: impl Into<ItemId>, kind: ItemKind) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            touches: BTreeSet::new(),
            kind,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the touched resources.
    ///
    /// Entries that fail normalization (blank strings) are dropped.
    pub fn with_touches<I, S>(mut self, touches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.touches = touches
            .into_iter()
            .filter_map(|t| Resource::parse(t.as_ref()).ok())
            .collect();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn dependencies(&self) -> &[ItemId] {
        &self.dependencies
    }

    pub fn touches(&self) -> &BTreeSet<Resource> {
        &self.touches
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
