//! Layering and cycle detection.

use std::fmt::Debug;
use std::hash::Hash;

use indexmap::IndexMap;

/// Error returned when the graph cannot be ordered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError<K: Debug> {
    /// Nodes that could not be scheduled because they form, or wait on, a
    /// circular dependency chain.
    #[error("dependency cycle among {involved:?}")]
    Cycle { involved: Vec<K> },

    /// A node names a dependency that is not in the graph.
    #[error("{node:?} depends on missing node {dependency:?}")]
    MissingDependency { node: K, dependency: K },
}

/// Compute layers using Kahn's algorithm.
///
/// `edges` maps every node to its predecessors, all of which are nodes.
pub(super) fn layers<K: Clone + Eq + Hash + Debug>(
    edges: &IndexMap<&K, Vec<&K>>,
) -> Result<Vec<Vec<K>>, GraphError<K>> {
    let mut in_degree: IndexMap<&K, usize> = IndexMap::new();
    let mut dependents: IndexMap<&K, Vec<&K>> = IndexMap::new();
    for (node, predecessors) in edges {
        let mut count = 0;
        for predecessor in predecessors {
            let list = dependents.entry(*predecessor).or_default();
            if !list.contains(node) {
                list.push(*node);
                count += 1;
            }
        }
        in_degree.insert(*node, count);
    }

    let mut layers = Vec::new();
    let mut current: Vec<&K> = edges
        .keys()
        .copied()
        .filter(|node| in_degree.get(node) == Some(&0))
        .collect();
    let mut processed = 0;

    while !current.is_empty() {
        processed += current.len();
        let mut next = Vec::new();
        for node in &current {
            if let Some(waiting) = dependents.get(node) {
                for dependent in waiting {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
        }
        // keep insertion order within a layer
        next.sort_by_key(|node| edges.get_index_of(*node));
        layers.push(current.into_iter().cloned().collect());
        current = next;
    }

    if processed != edges.len() {
        let involved = edges
            .keys()
            .filter(|node| in_degree.get(*node).is_some_and(|d| *d > 0))
            .map(|node| (*node).clone())
            .collect();
        return Err(GraphError::Cycle { involved });
    }
    Ok(layers)
}
