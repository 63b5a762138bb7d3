//! Dependency graph analysis and staging.
//!
//! A `DependencyGraph` is derived fresh from an accepted item set and never
//! mutated afterwards. Nodes live in a petgraph arena; an edge `a -> b`
//! means `b` depends on `a`. Node indices follow id order, which is what
//! makes every traversal here deterministic.

use crate::core::item::{ItemId, Resource, WorkItem};
use crate::error::GraphError;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A group of items that may run concurrently.
///
/// Every dependency of an item in stage `k` lies in a stage `< k`, and no
/// two items in the same stage touch a common resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Zero-based position in the run.
    pub index: usize,
    /// Item ids, sorted.
    pub items: Vec<ItemId>,
}

impl Stage {
    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.binary_search(id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// DFS node coloring for cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

pub struct DependencyGraph {
    graph: DiGraph<Arc<WorkItem>, ()>,
    index: HashMap<ItemId, NodeIndex>,
}

impl DependencyGraph {
    /// Build and validate a graph from owned items.
    pub fn build(items: Vec<WorkItem>) -> Result<Self, GraphError> {
        Self::from_shared(items.into_iter().map(Arc::new).collect())
    }

    /// Build and validate a graph from shared items.
    ///
    /// # Errors
    /// - `DuplicateId` if two items share an id
    /// - `UnknownDependency` naming the first dependency that does not resolve
    /// - `CycleDetected` with the full cycle path
    pub fn from_shared(mut items: Vec<Arc<WorkItem>>) -> Result<Self, GraphError> {
        items.sort_by(|a, b| a.id().cmp(b.id()));
        for pair in items.windows(2) {
            if pair[0].id() == pair[1].id() {
                return Err(GraphError::DuplicateId(pair[0].id().clone()));
            }
        }

        let mut graph = DiGraph::with_capacity(items.len(), items.len());
        let mut index = HashMap::with_capacity(items.len());
        for item in items {
            let id = item.id().clone();
            let node = graph.add_node(item);
            index.insert(id, node);
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let item = &graph[node];
            for dep in item.dependencies() {
                let dep_node = index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    item: item.id().clone(),
                    missing: dep.clone(),
                })?;
                edges.push((*dep_node, node));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let dag = Self { graph, index };
        if let Some(path) = dag.find_cycle() {
            return Err(GraphError::CycleDetected { path });
        }
        Ok(dag)
    }

    /// Iterative DFS with recursion-stack coloring along "depends on" edges.
    ///
    /// Roots are visited in id order and dependencies in declared order, so
    /// the reported path is stable for a given input. The path starts and
    /// ends at the same id.
    fn find_cycle(&self) -> Option<Vec<ItemId>> {
        let mut color = vec![Color::White; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if color[root.index()] != Color::White {
                continue;
            }

            // (node, position of the next dependency to explore)
            let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];
            color[root.index()] = Color::Gray;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let deps = self.graph[node].dependencies();
                if top.1 >= deps.len() {
                    color[node.index()] = Color::Black;
                    stack.pop();
                    continue;
                }
                let dep = self.index[&deps[top.1]];
                top.1 += 1;

                match color[dep.index()] {
                    Color::White => {
                        color[dep.index()] = Color::Gray;
                        stack.push((dep, 0));
                    }
                    Color::Gray => {
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == dep)
                            .unwrap_or(0);
                        let mut path: Vec<ItemId> = stack[start..]
                            .iter()
                            .map(|(n, _)| self.graph[*n].id().clone())
                            .collect();
                        path.push(self.graph[dep].id().clone());
                        return Some(path);
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&Arc<WorkItem>> {
        self.index.get(id).map(|&n| &self.graph[n])
    }

    /// All items in id order.
    pub fn items(&self) -> impl Iterator<Item = &Arc<WorkItem>> {
        self.graph.node_weights()
    }

    /// Every item reachable from `id` along dependent edges, excluding `id`.
    pub fn transitive_dependents(&self, id: &ItemId) -> BTreeSet<ItemId> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return out;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                out.insert(self.graph[node].id().clone());
            }
        }
        out
    }

    /// Whether `later` (transitively) depends on `earlier`.
    pub fn depends_on(&self, later: &ItemId, earlier: &ItemId) -> bool {
        match (self.index.get(earlier), self.index.get(later)) {
            (Some(&from), Some(&to)) if from != to => {
                has_path_connecting(&self.graph, from, to, None)
            }
            _ => false,
        }
    }

    /// Topological layer of each item: 0 with no dependencies, otherwise
    /// one more than the deepest dependency.
    pub fn layers(&self) -> HashMap<ItemId, usize> {
        let mut layer = vec![0usize; self.graph.node_count()];
        // Acyclic by construction, so toposort cannot fail here.
        let order = toposort(&self.graph, None).unwrap_or_default();
        for node in order {
            let depth = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| layer[dep.index()] + 1)
                .max()
                .unwrap_or(0);
            layer[node.index()] = depth;
        }
        self.graph
            .node_indices()
            .map(|n| (self.graph[n].id().clone(), layer[n.index()]))
            .collect()
    }

    /// Partition the graph into ordered stages.
    ///
    /// Items are placed in (layer, id) order. Each goes into the first stage
    /// after all of its dependencies' stages whose already-claimed resources
    /// do not intersect its `touches`. A conflicting item is deferred one
    /// stage at a time until it fits, so it may end up several layers late.
    pub fn stages(&self) -> Vec<Stage> {
        let layers = self.layers();
        let mut order: Vec<NodeIndex> = self.graph.node_indices().collect();
        order.sort_by(|a, b| {
            let (ia, ib) = (self.graph[*a].id(), self.graph[*b].id());
            layers[ia].cmp(&layers[ib]).then_with(|| ia.cmp(ib))
        });

        let mut assigned = vec![0usize; self.graph.node_count()];
        let mut claimed: Vec<BTreeSet<&Resource>> = Vec::new();
        let mut buckets: Vec<Vec<ItemId>> = Vec::new();

        for node in order {
            let item = &self.graph[node];
            let mut stage = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| assigned[dep.index()] + 1)
                .max()
                .unwrap_or(0);

            while stage < claimed.len()
                && item.touches().iter().any(|r| claimed[stage].contains(r))
            {
                stage += 1;
            }

            if stage == claimed.len() {
                claimed.push(BTreeSet::new());
                buckets.push(Vec::new());
            }
            claimed[stage].extend(item.touches().iter());
            buckets[stage].push(item.id().clone());
            assigned[node.index()] = stage;
        }

        buckets
            .into_iter()
            .enumerate()
            .map(|(index, mut items)| {
                items.sort();
                Stage { index, items }
            })
            .collect()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("items", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}

/// Validate `items` and partition them into stages.
pub fn stage(items: Vec<WorkItem>) -> Result<Vec<Stage>, GraphError> {
    Ok(DependencyGraph::build(items)?.stages())
}
