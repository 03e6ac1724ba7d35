//! # Process graph
//!
//! Task dependency graph over petgraph's `DiGraph`, with cycle detection and
//! topological ordering for the compiler.
//!
//! Cycle detection is a depth-first traversal that colours nodes:
//! - white: not yet visited
//! - gray: on the active DFS path
//! - black: fully explored
//!
//! An edge to a gray node is a back edge and closes a cycle. The traversal
//! keeps an explicit stack so deep graphs cannot overflow the call stack.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tbcspn_events::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed graph of task ids.
#[derive(Debug, Clone, Default)]
pub struct ProcessGraph {
    graph: DiGraph<TaskId, ()>,
    node_map: HashMap<TaskId, NodeIndex>,
}

impl ProcessGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the task is already present.
    pub fn add_task(&mut self, task_id: &str) -> bool {
        if self.node_map.contains_key(task_id) {
            return false;
        }
        let index = self.graph.add_node(task_id.to_string());
        self.node_map.insert(task_id.to_string(), index);
        true
    }

    /// Returns `false` if either endpoint is missing.
    pub fn add_link(&mut self, from: &str, to: &str) -> bool {
        match (self.node_map.get(from), self.node_map.get(to)) {
            (Some(&a), Some(&b)) => {
                self.graph.add_edge(a, b, ());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.node_map.contains_key(task_id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn sorted_neighbors(&self, node: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(node, direction).collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        neighbors
    }

    fn ids(&self, nodes: &[NodeIndex]) -> Vec<TaskId> {
        nodes
            .iter()
            .filter_map(|&n| self.graph.node_weight(n).cloned())
            .collect()
    }

    /// Direct predecessors, in task insertion order.
    pub fn predecessors(&self, task_id: &str) -> Vec<TaskId> {
        self.node_map
            .get(task_id)
            .map(|&n| self.ids(&self.sorted_neighbors(n, Direction::Incoming)))
            .unwrap_or_default()
    }

    /// Direct successors, in task insertion order.
    pub fn successors(&self, task_id: &str) -> Vec<TaskId> {
        self.node_map
            .get(task_id)
            .map(|&n| self.ids(&self.sorted_neighbors(n, Direction::Outgoing)))
            .unwrap_or_default()
    }

    /// The first cycle found, as a closed path `[a, b, .., a]`.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color = vec![Color::White; self.graph.node_count()];
        let paint = |color: &mut Vec<Color>, node: NodeIndex, to: Color| {
            if let Some(slot) = color.get_mut(node.index()) {
                *slot = to;
            }
        };

        for start in self.graph.node_indices() {
            if color.get(start.index()) != Some(&Color::White) {
                continue;
            }

            // Each frame: node and the index of the next neighbor to visit.
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
            paint(&mut color, start, Color::Gray);
            stack.push((start, self.sorted_neighbors(start, Direction::Outgoing), 0));

            while let Some((node, neighbors, next)) = stack.last_mut() {
                let Some(&neighbor) = neighbors.get(*next) else {
                    paint(&mut color, *node, Color::Black);
                    stack.pop();
                    continue;
                };
                *next = next.saturating_add(1);

                match color.get(neighbor.index()).copied() {
                    Some(Color::White) => {
                        paint(&mut color, neighbor, Color::Gray);
                        let children = self.sorted_neighbors(neighbor, Direction::Outgoing);
                        stack.push((neighbor, children, 0));
                    }
                    Some(Color::Gray) => {
                        let path: Vec<NodeIndex> = stack.iter().map(|(n, _, _)| *n).collect();
                        let begin = path.iter().position(|&n| n == neighbor).unwrap_or(0);
                        let mut cycle = path.get(begin..).map(<[_]>::to_vec).unwrap_or_default();
                        cycle.push(neighbor);
                        return Some(self.ids(&cycle));
                    }
                    Some(Color::Black) | None => {}
                }
            }
        }

        None
    }

    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// Topological order, or `None` if the graph is cyclic.
    pub fn topological_order(&self) -> Option<Vec<TaskId>> {
        toposort(&self.graph, None).ok().map(|order| self.ids(&order))
    }
}
