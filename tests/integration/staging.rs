//! Staging integration tests.
//!
//! Scenario tests pin down concrete partitions; property tests sweep a
//! family of generated item sets and check the partition invariants on
//! each of them.

use std::collections::{BTreeSet, HashMap};

use stagehand::core::{stage, DependencyGraph, ItemId, ItemKind, Resource, WorkItem};
use stagehand::GraphError;

use crate::fixtures::{exec, item, stage_ids};

/// Small deterministic generator so the sweep needs no extra crates.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// An acyclic item set: item `i` may only depend on items `< i`.
fn generated_dag(seed: u64, size: usize) -> Vec<WorkItem> {
    let mut rng = Lcg(seed);
    let resources = ["a.md", "b.md", "c.md", "d.md"];
    (0..size)
        .map(|i| {
            let deps: Vec<String> = (0..i)
                .filter(|_| rng.below(4) == 0)
                .map(|d| format!("n{d:02}"))
                .collect();
            let touches: Vec<&str> = resources
                .iter()
                .copied()
                .filter(|_| rng.below(5) == 0)
                .collect();
            WorkItem::new(format!("n{i:02}"), ItemKind::Execute)
                .with_dependencies(deps)
                .with_touches(touches)
        })
        .collect()
}

/// Test: Scenario 1, fan-out
/// Given B and C both depending on A
/// When staged
/// Then A runs alone and B, C run together after it
#[test]
fn test_fan_out_scenario() {
    let stages = stage(vec![exec("A", &[]), exec("B", &["A"]), exec("C", &["A"])]).unwrap();
    assert_eq!(stage_ids(&stages), vec![vec!["A"], vec!["B", "C"]]);
}

/// Test: Scenario 2, two-item cycle
/// Given A depends on B and B depends on A
/// When staged
/// Then CycleDetected reports the full path A → B → A
#[test]
fn test_two_cycle_scenario() {
    let err = stage(vec![exec("A", &["B"]), exec("B", &["A"])]).unwrap_err();
    assert_eq!(
        err,
        GraphError::CycleDetected {
            path: vec![ItemId::new("A"), ItemId::new("B"), ItemId::new("A")]
        }
    );
}

/// Test: Scenario 3, conflict serialization
/// Given two layer-0 items touching the same file
/// When staged
/// Then the one with the larger id is deferred to the next stage
#[test]
fn test_conflict_scenario() {
    let stages = stage(vec![
        item("A", ItemKind::Generate, &[], &["f"]),
        item("B", ItemKind::Generate, &[], &["f"]),
    ])
    .unwrap();
    assert_eq!(stage_ids(&stages), vec![vec!["A"], vec!["B"]]);
}

/// Test: Input order is irrelevant
/// Given the same items in two different orders
/// When staged
/// Then the partitions are identical
#[test]
fn test_input_order_does_not_matter() {
    let forward = vec![
        item("A", ItemKind::Generate, &[], &["x"]),
        item("B", ItemKind::Generate, &[], &["x"]),
        exec("C", &["A"]),
    ];
    let mut backward = forward.clone();
    backward.reverse();
    assert_eq!(stage(forward).unwrap(), stage(backward).unwrap());
}

/// Test: Long cycle inside a larger graph
/// Given a 3-cycle reachable from an acyclic prefix
/// When staged
/// Then the reported path is exactly the cycle, not the prefix
#[test]
fn test_cycle_path_excludes_acyclic_prefix() {
    let err = stage(vec![
        exec("root", &[]),
        exec("x", &["root", "z"]),
        exec("y", &["x"]),
        exec("z", &["y"]),
    ])
    .unwrap_err();
    let GraphError::CycleDetected { path } = err else {
        panic!("expected a cycle");
    };
    assert_eq!(path.first(), path.last());
    assert_eq!(path.len(), 4);
    assert!(!path.contains(&ItemId::new("root")));
}

/// Test: Staging properties over generated inputs
/// Given many acyclic item sets with random dependencies and touches
/// When staged
/// Then every partition covers the input exactly once, orders
/// dependencies strictly earlier, never co-stages conflicting items,
/// and is reproducible
#[test]
fn test_partition_properties_hold_for_generated_sets() {
    for seed in 0..64u64 {
        let items = generated_dag(seed, 6 + (seed as usize % 10));
        let stages = stage(items.clone()).unwrap();
        let again = stage(items.clone()).unwrap();
        assert_eq!(stages, again, "seed {seed}: not deterministic");

        let mut stage_of: HashMap<&ItemId, usize> = HashMap::new();
        for s in &stages {
            assert!(!s.is_empty(), "seed {seed}: empty stage {}", s.index);
            for id in &s.items {
                assert!(stage_of.insert(id, s.index).is_none(), "seed {seed}: {id} staged twice");
            }
        }
        assert_eq!(stage_of.len(), items.len(), "seed {seed}: items dropped");

        for it in &items {
            for dep in it.dependencies() {
                assert!(
                    stage_of[dep] < stage_of[it.id()],
                    "seed {seed}: {} not after {}",
                    it.id(),
                    dep
                );
            }
        }

        let by_id: HashMap<&ItemId, &WorkItem> = items.iter().map(|i| (i.id(), i)).collect();
        for s in &stages {
            let mut claimed: BTreeSet<&Resource> = BTreeSet::new();
            for id in &s.items {
                for r in by_id[id].touches() {
                    assert!(claimed.insert(r), "seed {seed}: {r} shared in stage {}", s.index);
                }
            }
        }
    }
}

/// Test: Reported cycles are real
/// Given generated DAGs with one back edge added
/// When staged
/// Then the reported path is a closed walk along declared dependencies
#[test]
fn test_reported_cycles_follow_declared_edges() {
    for seed in 0..32u64 {
        let mut items = generated_dag(seed, 8);
        // Close a loop: n00 depends on n07, and n07 depends on n00.
        let first = items[0].clone().with_dependencies(["n07"]);
        let last = items[7].clone().with_dependencies(["n00"]);
        items[0] = first;
        items[7] = last;

        let err = stage(items.clone()).unwrap_err();
        let GraphError::CycleDetected { path } = err else {
            panic!("seed {seed}: expected a cycle");
        };
        assert!(path.len() >= 2);
        assert_eq!(path.first(), path.last());

        let graph_deps: HashMap<&ItemId, &[ItemId]> =
            items.iter().map(|i| (i.id(), i.dependencies())).collect();
        for pair in path.windows(2) {
            assert!(
                graph_deps[&pair[0]].contains(&pair[1]),
                "seed {seed}: {} does not depend on {}",
                pair[0],
                pair[1]
            );
        }
    }
}

/// Test: Pathological shared resource
/// Given five independent items all touching one file
/// When staged
/// Then each gets its own stage, in id order
#[test]
fn test_single_resource_degrades_to_one_per_stage() {
    let items: Vec<WorkItem> = ["e", "d", "c", "b", "a"]
        .into_iter()
        .map(|id| item(id, ItemKind::Merge, &[], &["shared/tree"]))
        .collect();
    let stages = stage(items).unwrap();
    assert_eq!(
        stage_ids(&stages),
        vec![vec!["a"], vec!["b"], vec!["c"], vec!["d"], vec!["e"]]
    );
}

/// Test: Graph queries used by reporting
/// Given a small chain with a side branch
/// When the graph is built
/// Then transitive dependents and reachability match the declared edges
#[test]
fn test_graph_reachability() {
    let graph = DependencyGraph::build(vec![
        exec("a", &[]),
        exec("b", &["a"]),
        exec("c", &["b"]),
        exec("side", &[]),
    ])
    .unwrap();
    let dependents: Vec<String> = graph
        .transitive_dependents(&ItemId::new("a"))
        .into_iter()
        .map(|i| i.as_str().to_string())
        .collect();
    assert_eq!(dependents, vec!["b", "c"]);
    assert!(graph.depends_on(&ItemId::new("c"), &ItemId::new("a")));
    assert!(!graph.depends_on(&ItemId::new("a"), &ItemId::new("c")));
    assert!(!graph.depends_on(&ItemId::new("side"), &ItemId::new("a")));
}
