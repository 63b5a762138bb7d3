//! Run report: per-item outcomes, counts and consistency findings.
//!
//! A report deliberately carries no run id and no timing metrics, so two
//! runs of the same input with the same task results compare equal whether
//! or not one of them was resumed from checkpoints.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{
    DependencyGraph, ItemError, ItemErrorKind, ItemId, ItemKind, ItemResult, ItemStatus, Resource,
    Stage,
};
use crate::orchestration::state::RunState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub total: usize,
    pub success: usize,
    pub partial: usize,
    pub failure: usize,
}

impl OutcomeCounts {
    fn add(&mut self, status: ItemStatus) {
        self.total += 1;
        match status {
            ItemStatus::Success => self.success += 1,
            ItemStatus::Partial => self.partial += 1,
            ItemStatus::Failure => self.failure += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub stage: usize,
    pub kind: ItemKind,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: ItemId,
    pub stage: usize,
    pub error: ItemError,
}

/// Cross-item consistency problems the stage partition cannot rule out.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "finding", rename_all = "snake_case")]
pub enum Finding {
    /// Two items that both produced output touch the same resource but
    /// neither depends on the other, so their relative order was only a
    /// staging accident.
    UnorderedSharedResource {
        resource: Resource,
        first: ItemId,
        second: ItemId,
    },
    /// A review ran on top of an artifact that was only partially produced.
    ReviewOfPartialArtifact { review: ItemId, artifact: ItemId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub state: RunState,
    pub stage_count: usize,
    pub counts: OutcomeCounts,
    pub items: BTreeMap<ItemId, ItemOutcome>,
    pub failed: Vec<FailedItem>,
    pub findings: Vec<Finding>,
}

impl Report {
    pub fn has_failures(&self) -> bool {
        self.counts.failure > 0
    }
}

/// Reduce a run's results into a report.
///
/// Every item in `graph` appears in the report. An item with no result is
/// listed as aborted rather than dropped.
pub fn finalize(
    state: RunState,
    stages: &[Stage],
    results: &BTreeMap<ItemId, ItemResult>,
    graph: &DependencyGraph,
) -> Report {
    let stage_of: BTreeMap<&ItemId, usize> = stages
        .iter()
        .flat_map(|s| s.items.iter().map(move |id| (id, s.index)))
        .collect();

    let mut counts = OutcomeCounts::default();
    let mut items = BTreeMap::new();
    let mut failed = Vec::new();

    for item in graph.items() {
        let id = item.id();
        let stage = stage_of.get(id).copied().unwrap_or_default();
        let (status, error) = match results.get(id) {
            Some(result) => (result.status, result.error.clone()),
            None => (
                ItemStatus::Failure,
                Some(ItemError::new(ItemErrorKind::Aborted, "no result recorded")),
            ),
        };

        counts.add(status);
        if status == ItemStatus::Failure {
            if let Some(error) = &error {
                failed.push(FailedItem {
                    item: id.clone(),
                    stage,
                    error: error.clone(),
                });
            }
        }
        items.insert(
            id.clone(),
            ItemOutcome {
                stage,
                kind: item.kind(),
                status,
                error,
            },
        );
    }

    let is_review_run = graph.items().any(|i| i.kind() == ItemKind::Review);
    let findings = if is_review_run {
        consistency_findings(&items, graph)
    } else {
        Vec::new()
    };

    Report {
        state,
        stage_count: stages.len(),
        counts,
        items,
        failed,
        findings,
    }
}

fn consistency_findings(
    items: &BTreeMap<ItemId, ItemOutcome>,
    graph: &DependencyGraph,
) -> Vec<Finding> {
    let produced = |id: &ItemId| {
        items
            .get(id)
            .map(|o| o.status.satisfies_dependents())
            .unwrap_or(false)
    };
    let mut findings = BTreeSet::new();

    let mut by_resource: BTreeMap<&Resource, Vec<&ItemId>> = BTreeMap::new();
    for item in graph.items().filter(|i| produced(i.id())) {
        for resource in item.touches() {
            by_resource.entry(resource).or_default().push(item.id());
        }
    }
    for (resource, ids) in by_resource {
        for (i, first) in ids.iter().enumerate() {
            for second in &ids[i + 1..] {
                if !graph.depends_on(first, second) && !graph.depends_on(second, first) {
                    findings.insert(Finding::UnorderedSharedResource {
                        resource: resource.clone(),
                        first: (*first).clone(),
                        second: (*second).clone(),
                    });
                }
            }
        }
    }

    for (artifact, outcome) in items {
        if outcome.status != ItemStatus::Partial {
            continue;
        }
        for dependent in graph.transitive_dependents(artifact) {
            let ran = produced(&dependent);
            let is_review = items
                .get(&dependent)
                .map(|o| o.kind == ItemKind::Review)
                .unwrap_or(false);
            if ran && is_review {
                findings.insert(Finding::ReviewOfPartialArtifact {
                    review: dependent,
                    artifact: artifact.clone(),
                });
            }
        }
    }

    findings.into_iter().collect()
}
