//! Dependency graph for step scheduling.
//!
//! Steps declare the steps that must run before them. The graph orders them
//! into layers: every node of layer N has all of its dependencies in layers
//! before N, so the nodes of one layer may run in any order, or concurrently.
//!
//! # Sequential nodes
//!
//! Nodes added with [`DependencyGraph::add_sequential`] (derivers) run first,
//! one per layer, in the order they were added. Every node without declared
//! dependencies waits for the last of them.
//!
//! # Removal
//!
//! [`DependencyGraph::remove`] also removes every node that transitively
//! depends on the removed one. When a subtree divides, the steps that served
//! the mother are cleared together and the daughters' steps are added fresh.

mod topology;

#[cfg(test)]
mod tests;

use std::fmt::Debug;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};

pub use topology::GraphError;

/// Nodes and their declared predecessors.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    nodes: IndexMap<K, Vec<K>>,
    sequential: Vec<K>,
}

impl<K: Clone + Eq + Hash + Debug> DependencyGraph<K> {
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            sequential: Vec::new(),
        }
    }

    /// Add `node` to run after every node in `dependencies`.
    ///
    /// Re-adding a node replaces its dependencies.
    pub fn add(&mut self, node: K, dependencies: impl IntoIterator<Item = K>) {
        self.nodes.insert(node, dependencies.into_iter().collect());
    }

    /// Add `node` to the chain of nodes that run ahead of everything else.
    pub fn add_sequential(&mut self, node: K) {
        if !self.sequential.contains(&node) {
            self.sequential.push(node.clone());
        }
        self.nodes.insert(node, Vec::new());
    }

    /// Remove `node` and every node depending on it, directly or not.
    ///
    /// Returns the removed nodes, `node` first. Removing an absent node
    /// removes nothing.
    pub fn remove(&mut self, node: &K) -> Vec<K> {
        if !self.nodes.contains_key(node) {
            return Vec::new();
        }
        let mut removed: IndexSet<K> = IndexSet::new();
        removed.insert(node.clone());
        loop {
            let before = removed.len();
            for (candidate, dependencies) in &self.nodes {
                if !removed.contains(candidate) && dependencies.iter().any(|d| removed.contains(d)) {
                    removed.insert(candidate.clone());
                }
            }
            if removed.len() == before {
                break;
            }
        }
        for gone in &removed {
            self.nodes.shift_remove(gone);
        }
        self.sequential.retain(|n| !removed.contains(n));
        removed.into_iter().collect()
    }

    pub fn contains(&self, node: &K) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &K> {
        self.nodes.keys()
    }

    /// Declared dependencies of `node`.
    pub fn dependencies(&self, node: &K) -> Option<&[K]> {
        self.nodes.get(node).map(Vec::as_slice)
    }

    /// Order every node into execution layers.
    ///
    /// Missing dependencies and cycles are reported before any layer is
    /// produced. Within a layer nodes keep insertion order. Each call
    /// recomputes the layers from the current graph.
    pub fn get_execution_layers(&self) -> Result<Vec<Vec<K>>, GraphError<K>> {
        for (node, dependencies) in &self.nodes {
            if let Some(missing) = dependencies.iter().find(|d| !self.nodes.contains_key(*d)) {
                return Err(GraphError::MissingDependency {
                    node: node.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let last_sequential = self.sequential.last();
        let mut edges: IndexMap<&K, Vec<&K>> = IndexMap::new();
        for (node, dependencies) in &self.nodes {
            let mut effective: Vec<&K> = dependencies.iter().collect();
            if let Some(position) = self.sequential.iter().position(|s| s == node) {
                if position > 0 {
                    effective.push(&self.sequential[position - 1]);
                }
            } else if effective.is_empty()
                && let Some(last) = last_sequential
            {
                effective.push(last);
            }
            edges.insert(node, effective);
        }
        topology::layers(&edges)
    }
}

impl<K: Clone + Eq + Hash + Debug> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self::new()
    }
}
