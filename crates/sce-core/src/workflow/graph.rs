//! Graph index, deterministic topological ordering, and structural checks.
//!
//! `GraphIndex` loads a `WorkflowGraph` into a `petgraph` arena: each node is
//! addressed by its position in the authored node list, each edge carries its
//! position in the authored edge list. All traversal orders derive from those
//! positions, never from hash iteration, so the same graph always yields the
//! same order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use sce_types::workflow::{NodeType, WorkflowGraph, WorkflowNode};
use thiserror::Error;

/// Structural problems found while indexing or ordering a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("workflow contains a cycle: {ordered} of {total} nodes could be ordered")]
    CycleDetected { ordered: usize, total: usize },

    #[error("invalid workflow graph: {0}")]
    Invalid(String),
}

/// Arena view over a borrowed `WorkflowGraph`.
///
/// Node weights are positions into `graph.nodes`, edge weights positions
/// into `graph.edges`.
#[derive(Debug)]
pub struct GraphIndex<'a> {
    source: &'a WorkflowGraph,
    arena: DiGraph<usize, usize>,
    by_id: HashMap<&'a str, NodeIndex>,
}

impl<'a> GraphIndex<'a> {
    /// Index a graph, rejecting duplicate node IDs and dangling edges.
    pub fn build(graph: &'a WorkflowGraph) -> Result<Self, GraphError> {
        let mut arena = DiGraph::with_capacity(graph.nodes.len(), graph.edges.len());
        let mut by_id = HashMap::with_capacity(graph.nodes.len());

        for (pos, node) in graph.nodes.iter().enumerate() {
            let idx = arena.add_node(pos);
            if by_id.insert(node.id.as_str(), idx).is_some() {
                return Err(GraphError::Invalid(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for (pos, edge) in graph.edges.iter().enumerate() {
            let lookup = |id: &str| {
                by_id.get(id).copied().ok_or_else(|| GraphError::UnknownNode {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    missing: id.to_string(),
                })
            };
            let from = lookup(&edge.source)?;
            let to = lookup(&edge.target)?;
            arena.add_edge(from, to, pos);
        }

        Ok(Self {
            source: graph,
            arena,
            by_id,
        })
    }

    pub fn graph(&self) -> &'a WorkflowGraph {
        self.source
    }

    pub fn len(&self) -> usize {
        self.source.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.nodes.is_empty()
    }

    /// Position of a node in the authored node list.
    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.by_id.get(node_id).map(|idx| self.arena[*idx])
    }

    pub fn node(&self, pos: usize) -> &'a WorkflowNode {
        &self.source.nodes[pos]
    }

    /// Incoming edge positions of a node, in authoring order.
    pub fn incoming_edges(&self, pos: usize) -> Vec<usize> {
        self.edge_positions(pos, Direction::Incoming)
    }

    /// Outgoing edge positions of a node, in authoring order.
    pub fn outgoing_edges(&self, pos: usize) -> Vec<usize> {
        self.edge_positions(pos, Direction::Outgoing)
    }

    fn edge_positions(&self, pos: usize, dir: Direction) -> Vec<usize> {
        let mut edges: Vec<usize> = self
            .arena
            .edges_directed(NodeIndex::new(pos), dir)
            .map(|e| *e.weight())
            .collect();
        // petgraph yields adjacency in reverse insertion order
        edges.sort_unstable();
        edges
    }

    /// Kahn's algorithm with ties broken by authored node position.
    ///
    /// Returns node positions. Fails with `CycleDetected` when fewer nodes
    /// than exist could be ordered.
    pub fn execution_order(&self) -> Result<Vec<usize>, GraphError> {
        let total = self.len();
        let mut in_degree: Vec<usize> = (0..total)
            .map(|pos| {
                self.arena
                    .edges_directed(NodeIndex::new(pos), Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(pos, _)| Reverse(pos))
            .collect();

        let mut order = Vec::with_capacity(total);
        while let Some(Reverse(pos)) = ready.pop() {
            order.push(pos);
            for edge in self
                .arena
                .edges_directed(NodeIndex::new(pos), Direction::Outgoing)
            {
                let target = self.arena[edge.target()];
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    ready.push(Reverse(target));
                }
            }
        }

        if order.len() < total {
            return Err(GraphError::CycleDetected {
                ordered: order.len(),
                total,
            });
        }
        Ok(order)
    }

    /// Nodes not reachable from any start node, in authored order.
    pub fn unreachable_from_start(&self) -> Vec<&'a str> {
        let mut seen = vec![false; self.len()];
        for (pos, node) in self.source.nodes.iter().enumerate() {
            if node.node_type != NodeType::Start {
                continue;
            }
            let mut bfs = Bfs::new(&self.arena, NodeIndex::new(pos));
            while let Some(idx) = bfs.next(&self.arena) {
                seen[self.arena[idx]] = true;
            }
        }
        self.source
            .nodes
            .iter()
            .zip(seen)
            .filter(|(_, reached)| !reached)
            .map(|(node, _)| node.id.as_str())
            .collect()
    }
}

/// Compute the execution order of a graph as node IDs.
pub fn execution_order(graph: &WorkflowGraph) -> Result<Vec<String>, GraphError> {
    let index = GraphIndex::build(graph)?;
    let order = index.execution_order()?;
    Ok(order
        .into_iter()
        .map(|pos| graph.nodes[pos].id.clone())
        .collect())
}

/// Check that a graph is well-formed and acyclic.
pub fn validate_structure(graph: &WorkflowGraph) -> Result<(), GraphError> {
    GraphIndex::build(graph)?.execution_order().map(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
