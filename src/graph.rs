//! The explicit dependency graph.
//!
//! Tasks declare no edges of their own; the graph is derived by indexing
//! every task's targets into a `path -> producing task` map and resolving
//! each task's dependency paths against that map. The index is built once
//! per resolution pass, so staleness queries never fall back to linear
//! scans over the registry.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::error::ResolveError;
use crate::task::{Registry, Task};

#[derive(Debug)]
pub(crate) struct TaskGraph {
    graph: DiGraph<Arc<Task>, ()>,
    nodes: HashMap<Arc<str>, NodeIndex>,
    producers: HashMap<Utf8PathBuf, NodeIndex>,
}

impl TaskGraph {
    /// Indexes the registry and wires producer → consumer edges. Fails
    /// if the implied graph is cyclic.
    pub fn build(registry: &Registry) -> Result<Self, ResolveError> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        let mut producers: HashMap<Utf8PathBuf, NodeIndex> = HashMap::new();

        for task in registry.iter() {
            let index = graph.add_node(task.clone());
            nodes.insert(task.name_arc().clone(), index);

            for target in task.targets() {
                match producers.entry(target.clone()) {
                    Entry::Vacant(entry) => {
                        entry.insert(index);
                    }
                    Entry::Occupied(entry) => {
                        // First registrant wins, deterministically.
                        tracing::warn!(
                            "target '{}' is declared by both '{}' and '{}'",
                            target,
                            graph[*entry.get()].name(),
                            task.name(),
                        );
                    }
                }
            }
        }

        for task in registry.iter() {
            let consumer = nodes[task.name()];

            for dependency in task.dependencies() {
                if let Some(&producer) = producers.get(dependency)
                    && producer != consumer
                {
                    graph.add_edge(producer, consumer, ());
                }
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| ResolveError::Cycle(graph[cycle.node_id()].name().to_string()))?;

        Ok(Self {
            graph,
            nodes,
            producers,
        })
    }

    pub fn node(&self, task: &Task) -> Option<NodeIndex> {
        self.nodes.get(task.name()).copied()
    }

    pub fn task(&self, index: NodeIndex) -> &Arc<Task> {
        &self.graph[index]
    }

    /// The task producing a path, if any. `None` means the path is a
    /// plain external file.
    pub fn producer_of(&self, path: &Utf8Path) -> Option<NodeIndex> {
        self.producers.get(path).copied()
    }

    /// All nodes in insertion order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    /// Every node reachable by walking upstream from the given roots,
    /// roots included, sorted by insertion order for determinism.
    pub fn upstream_closure(&self, roots: impl IntoIterator<Item = NodeIndex>) -> Vec<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::empty(reversed);
        let mut closure = Vec::new();

        for root in roots {
            dfs.move_to(root);
            while let Some(index) = dfs.next(reversed) {
                closure.push(index);
            }
        }

        closure.sort_unstable();
        closure
    }

    /// Direct consumers of a node's targets.
    pub fn dependents_of(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    /// How many of a node's producers are inside the given set.
    pub fn incoming_within(&self, index: NodeIndex, set: &std::collections::HashSet<NodeIndex>) -> usize {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .filter(|producer| set.contains(producer))
            .count()
    }
}
