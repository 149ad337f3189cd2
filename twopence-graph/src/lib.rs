//! Named inheritance graph for configuration objects.
//!
//! Platforms inherit from base platforms, builds from base builds. Both form a
//! directed acyclic graph keyed by name, where an edge points from a derived
//! object to one of its bases. This crate provides:
//!
//! - Name-keyed node registry with stable insertion order
//! - Base edges with immediate cycle detection (the error names the chain)
//! - Base-first linearization with diamond deduplication
//! - Topological sorting using Kahn's algorithm
//! - Optional serde support
//!
//! # Example
//!
//! ```
//! use twopence_graph::InheritanceGraph;
//!
//! let mut graph = InheritanceGraph::new();
//! let _ = graph.add_node("suse");
//! let _ = graph.add_node("leap");
//! let _ = graph.add_node("leap-15.3");
//!
//! graph.add_base("leap", "suse").unwrap();
//! graph.add_base("leap-15.3", "leap").unwrap();
//!
//! let order = graph.linearize("leap-15.3").unwrap();
//! assert_eq!(order, vec!["suse", "leap", "leap-15.3"]);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Node identifier in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Error types for graph operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Cycle detected; the chain starts and ends with the same name
    #[error("Cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// Node not found
    #[error("Node {0:?} not found in graph")]
    NodeNotFound(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct Node {
    name: String,
    // Bases in declaration order (this node -> base)
    bases: Vec<NodeId>,
    // Nodes declaring this one as a base
    derived: Vec<NodeId>,
}

/// Inheritance graph keyed by object name.
///
/// Edges are rejected as soon as they would close a cycle, so every
/// successfully built graph is acyclic and can be linearized.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InheritanceGraph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
}

impl InheritanceGraph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node by name and return its ID.
    ///
    /// Adding an existing name returns the existing ID.
    pub fn add_node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            bases: Vec::new(),
            derived: Vec::new(),
        });
        let _ = self.index.insert(name.to_string(), id);
        id
    }

    /// Look up the ID of a named node.
    #[must_use]
    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    /// Check whether a node with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Get the name of a node.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the ID is not part of this graph.
    pub fn name(&self, id: NodeId) -> GraphResult<&str> {
        self.nodes
            .get(id.0)
            .map(|node| node.name.as_str())
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    /// Declare `base` as a base of `node`.
    ///
    /// Bases keep their declaration order, which drives linearization.
    /// Declaring the same base twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `GraphError::NodeNotFound` if either node doesn't exist
    /// - `GraphError::CycleDetected` if `node` is already an ancestor of `base`
    pub fn add_base(&mut self, node: &str, base: &str) -> GraphResult<()> {
        let from = self.require(node)?;
        let to = self.require(base)?;

        if let Some(path) = self.ancestor_path(to, from) {
            let mut chain = vec![node.to_string()];
            chain.extend(path.into_iter().map(|id| self.nodes[id.0].name.clone()));
            return Err(GraphError::CycleDetected(chain));
        }

        if self.nodes[from.0].bases.contains(&to) {
            return Ok(());
        }
        self.nodes[from.0].bases.push(to);
        self.nodes[to.0].derived.push(from);
        Ok(())
    }

    fn require(&self, name: &str) -> GraphResult<NodeId> {
        self.id(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))
    }

    /// Path of base edges from `start` up to `target`, both included.
    fn ancestor_path(&self, start: NodeId, target: NodeId) -> Option<Vec<NodeId>> {
        let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let _ = visited.insert(start);

        while let Some(current) = queue.pop_front() {
            if current == target {
                let mut path = vec![current];
                let mut cursor = current;
                while let Some(&prev) = parent.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }

            for &base in &self.nodes[current.0].bases {
                if visited.insert(base) {
                    let _ = parent.insert(base, current);
                    queue.push_back(base);
                }
            }
        }

        None
    }

    /// Get the direct bases of a node, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn bases(&self, name: &str) -> GraphResult<Vec<&str>> {
        let id = self.require(name)?;
        Ok(self.nodes[id.0]
            .bases
            .iter()
            .map(|base| self.nodes[base.0].name.as_str())
            .collect())
    }

    /// Get the nodes that directly derive from this one.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn derived(&self, name: &str) -> GraphResult<Vec<&str>> {
        let id = self.require(name)?;
        Ok(self.nodes[id.0]
            .derived
            .iter()
            .map(|child| self.nodes[child.0].name.as_str())
            .collect())
    }

    /// Get the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the number of base edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|node| node.bases.len()).sum()
    }

    /// Linearize a node and all of its ancestors.
    ///
    /// Ancestors come before descendants and every node appears once, even
    /// when reachable through several paths. Bases are visited depth first in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn linearize(&self, name: &str) -> GraphResult<Vec<String>> {
        self.linearize_many([name])
    }

    /// Linearize several roots into one base-first sequence.
    ///
    /// Roots are processed in the given order; nodes shared between roots are
    /// emitted at their first position only.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if any root doesn't exist.
    pub fn linearize_many<'a, I>(&self, roots: I) -> GraphResult<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut visited = HashSet::new();
        let mut order = Vec::new();

        for root in roots {
            let id = self.require(root)?;
            self.post_order(id, &mut visited, &mut order);
        }

        Ok(order
            .into_iter()
            .map(|id| self.nodes[id.0].name.clone())
            .collect())
    }

    fn post_order(&self, id: NodeId, visited: &mut HashSet<NodeId>, order: &mut Vec<NodeId>) {
        if !visited.insert(id) {
            return;
        }
        for &base in &self.nodes[id.0].bases {
            self.post_order(base, visited, order);
        }
        order.push(id);
    }

    /// Perform topological sort using Kahn's algorithm.
    ///
    /// Returns every node name with bases before the nodes deriving from
    /// them. Ties are broken by insertion order, so the result is stable.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidOperation` if not every node could be
    /// ordered, which cannot happen for graphs built through `add_base`.
    pub fn topological_sort(&self) -> GraphResult<Vec<String>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|node| node.bases.len()).collect();

        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(index, _)| NodeId(index))
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            result.push(self.nodes[id.0].name.clone());

            for &child in &self.nodes[id.0].derived {
                let degree = &mut in_degree[child.0];
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }

        if result.len() == self.nodes.len() {
            Ok(result)
        } else {
            Err(GraphError::InvalidOperation(
                "Graph could not be fully ordered".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> InheritanceGraph {
        let mut graph = InheritanceGraph::new();
        for node in nodes {
            let _ = graph.add_node(node);
        }
        for (node, base) in edges {
            graph.add_base(node, base).unwrap();
        }
        graph
    }

    #[test]
    fn test_create_empty_graph() {
        let graph = InheritanceGraph::new();
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut graph = InheritanceGraph::new();
        let a = graph.add_node("a");
        let again = graph.add_node("a");

        assert_eq!(a, again);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.name(a).unwrap(), "a");
    }

    #[test]
    fn test_unknown_base() {
        let mut graph = graph(&["a"], &[]);
        let result = graph.add_base("a", "missing");
        assert_eq!(result, Err(GraphError::NodeNotFound("missing".to_string())));
    }

    #[test]
    fn test_cycle_names_chain() {
        let mut graph = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);

        let result = graph.add_base("c", "a");
        assert_eq!(
            result,
            Err(GraphError::CycleDetected(vec![
                "c".to_string(),
                "a".to_string(),
                "b".to_string(),
                "c".to_string()
            ]))
        );
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_self_cycle() {
        let mut graph = graph(&["a"], &[]);
        let result = graph.add_base("a", "a");
        assert!(matches!(result, Err(GraphError::CycleDetected(chain)) if chain == ["a", "a"]));
    }

    #[test]
    fn test_duplicate_base_ignored() {
        let mut graph = graph(&["a", "b"], &[("a", "b")]);
        graph.add_base("a", "b").unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.bases("a").unwrap(), vec!["b"]);
        assert_eq!(graph.derived("b").unwrap(), vec!["a"]);
    }

    #[test]
    fn test_linearize_diamond() {
        // leaf -> {left, right} -> root
        let graph = graph(
            &["root", "left", "right", "leaf"],
            &[
                ("left", "root"),
                ("right", "root"),
                ("leaf", "left"),
                ("leaf", "right"),
            ],
        );

        let order = graph.linearize("leaf").unwrap();
        assert_eq!(order, vec!["root", "left", "right", "leaf"]);
    }

    #[test]
    fn test_linearize_many_shares_ancestors() {
        let graph = graph(
            &["base", "selinux", "fips"],
            &[("selinux", "base"), ("fips", "base")],
        );

        let order = graph.linearize_many(["selinux", "fips"]).unwrap();
        assert_eq!(order, vec!["base", "selinux", "fips"]);
    }

    #[test]
    fn test_topological_sort() {
        let graph = graph(&["c", "b", "a"], &[("c", "b"), ("b", "a")]);
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
