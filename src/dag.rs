//! Directed acyclic graph of task identifiers.
//!
//! The graph is the structural backbone of a workflow template: nodes are
//! task template ids, edges point from an upstream task to its downstream
//! tasks. Mutations go through [`Dag::add_node`], [`Dag::delete_node`],
//! [`Dag::add_edge`] and [`Dag::delete_edge`] only; `add_edge` is
//! transactional and rolls back any edge that would introduce a cycle.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("node '{node}' already exists"))]
    NodeExists { node: String },

    #[snafu(display("node '{node}' does not exist in graph"))]
    NodeNotFound { node: String },

    #[snafu(display("edge '{from}' -> '{to}' does not exist in graph"))]
    EdgeNotFound { from: String, to: String },

    #[snafu(display("no root node found"))]
    NoRoot,

    #[snafu(display("graph is not acyclic"))]
    Cycle,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A DAG of string node ids backed by an adjacency graph, with insertion
/// order of nodes preserved.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    graph: StableDiGraph<String, ()>,
    nodes: IndexMap<String, NodeIndex>,
}

impl Dag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    fn index(&self, node: &str) -> Result<NodeIndex> {
        self.nodes
            .get(node)
            .copied()
            .context(NodeNotFoundSnafu { node })
    }

    /// Add a new node to the graph.
    pub fn add_node(&mut self, node: &str) -> Result<()> {
        ensure!(!self.contains(node), NodeExistsSnafu { node });
        let index = self.graph.add_node(node.to_owned());
        self.nodes.insert(node.to_owned(), index);
        Ok(())
    }

    /// Delete a node and every edge referencing it.
    pub fn delete_node(&mut self, node: &str) -> Result<()> {
        let index = self.index(node)?;
        self.graph.remove_node(index);
        self.nodes.shift_remove(node);
        Ok(())
    }

    /// Add a directed edge from `from` to `to`. Both nodes must already
    /// exist. Adding an edge twice is a no-op. If the new edge introduces a
    /// cycle it is removed again and `Cycle` is returned, leaving the graph
    /// exactly as it was.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let up = self.index(from)?;
        let down = self.index(to)?;
        if self.graph.find_edge(up, down).is_some() {
            return Ok(());
        }
        let edge = self.graph.add_edge(up, down, ());
        if let Err(err) = self.validate() {
            // Rollback the last update if it breaks the DAG
            self.graph.remove_edge(edge);
            return Err(err);
        }
        Ok(())
    }

    /// Delete an edge from the graph.
    pub fn delete_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let up = self.index(from)?;
        let down = self.index(to)?;
        let edge = self
            .graph
            .find_edge(up, down)
            .context(EdgeNotFoundSnafu { from, to })?;
        self.graph.remove_edge(edge);
        Ok(())
    }

    /// All direct successors of `node`, in edge insertion order.
    pub fn successors(&self, node: &str) -> Result<Vec<String>> {
        let index = self.index(node)?;
        Ok(self.neighbors(index, Direction::Outgoing))
    }

    /// All direct predecessors of `node`, in edge insertion order.
    pub fn predecessors(&self, node: &str) -> Result<Vec<String>> {
        let index = self.index(node)?;
        Ok(self.neighbors(index, Direction::Incoming))
    }

    fn neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<String> {
        // petgraph walks adjacency lists most-recent first; reverse to get
        // back edge insertion order.
        let mut nodes: Vec<String> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect();
        nodes.reverse();
        nodes
    }

    /// All nodes without a predecessor, in node insertion order. A graph
    /// with nodes but no root is invalid (it must contain a cycle).
    pub fn roots(&self) -> Result<Vec<String>> {
        let roots: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, index)| {
                self.graph
                    .neighbors_directed(**index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(node, _)| node.clone())
            .collect();
        ensure!(!roots.is_empty(), NoRootSnafu);
        Ok(roots)
    }

    /// All nodes without a successor, in node insertion order.
    #[must_use]
    pub fn leaves(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, index)| {
                self.graph
                    .neighbors_directed(**index, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// All edges as `(from, to)` pairs.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        self.graph
            .edge_references()
            .filter_map(|edge| {
                let from = self.graph.node_weight(edge.source())?;
                let to = self.graph.node_weight(edge.target())?;
                Some((from.clone(), to.clone()))
            })
            .collect()
    }

    /// Validate the graph: at least one root and no cycle.
    pub fn validate(&self) -> Result<()> {
        self.toposort().map(|_| ())
    }

    /// `true` if the graph is a valid DAG.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Topological ordering using Kahn's algorithm on a working in-degree
    /// table. Detects cycles, hence ensures the graph is a DAG.
    fn toposort(&self) -> Result<Vec<String>> {
        let mut in_degrees: HashMap<NodeIndex, usize> = self
            .nodes
            .values()
            .map(|index| {
                let degree = self
                    .graph
                    .neighbors_directed(*index, Direction::Incoming)
                    .count();
                (*index, degree)
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .nodes
            .values()
            .filter(|index| in_degrees.get(index) == Some(&0))
            .copied()
            .collect();
        ensure!(!queue.is_empty(), NoRootSnafu);

        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(index) = queue.pop_front() {
            if let Some(node) = self.graph.node_weight(index) {
                sorted.push(node.clone());
            }
            for successor in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(degree) = in_degrees.get_mut(&successor) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(successor);
                    }
                }
            }
        }
        ensure!(sorted.len() == self.nodes.len(), CycleSnafu);
        Ok(sorted)
    }

    /// Build a new DAG from an adjacency map `{node: [successors]}`. Nodes
    /// are created first, then all edges.
    pub fn from_dict(graph: &IndexMap<String, Vec<String>>) -> Result<Self> {
        let mut dag = Self::new();
        for node in graph.keys() {
            dag.add_node(node)?;
        }
        for (node, successors) in graph {
            for successor in successors {
                dag.add_edge(node, successor)?;
            }
        }
        Ok(dag)
    }

    /// The adjacency map form of the graph, nodes in insertion order.
    #[must_use]
    pub fn as_dict(&self) -> IndexMap<String, Vec<String>> {
        self.nodes
            .iter()
            .map(|(node, index)| (node.clone(), self.neighbors(*index, Direction::Outgoing)))
            .collect()
    }
}
