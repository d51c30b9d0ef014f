//! Tests for layering, sequential priming and cascading removal.

use super::{DependencyGraph, GraphError};

fn graph(edges: &[(&'static str, &[&'static str])]) -> DependencyGraph<&'static str> {
    let mut graph = DependencyGraph::new();
    for (node, dependencies) in edges {
        graph.add(*node, dependencies.iter().copied());
    }
    graph
}

#[test]
fn test_layers_follow_dependencies() {
    let graph = graph(&[("a", &[]), ("b", &[]), ("c", &["a", "b"]), ("d", &["c"])]);
    let layers = graph.get_execution_layers().unwrap();
    assert_eq!(layers, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
}

#[test]
fn test_layers_are_restartable() {
    let graph = graph(&[("a", &[]), ("b", &["a"])]);
    let first = graph.get_execution_layers().unwrap();
    let second = graph.get_execution_layers().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_sequential_node_runs_first() {
    let mut graph = graph(&[("a", &[]), ("b", &[])]);
    graph.add_sequential("c");
    let layers = graph.get_execution_layers().unwrap();
    assert_eq!(layers, vec![vec!["c"], vec!["a", "b"]]);
}

#[test]
fn test_sequential_nodes_chain_in_order() {
    let mut graph = DependencyGraph::new();
    graph.add_sequential("first");
    graph.add_sequential("second");
    graph.add("step", []);
    let layers = graph.get_execution_layers().unwrap();
    assert_eq!(layers, vec![vec!["first"], vec!["second"], vec!["step"]]);
}

#[test]
fn test_removal_cascades_to_dependents() {
    let mut graph = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
    let removed = graph.remove(&"a");
    assert_eq!(removed, vec!["a", "b", "c"]);
    assert!(graph.is_empty());
    assert!(graph.get_execution_layers().unwrap().is_empty());
}

#[test]
fn test_removal_spares_independent_nodes() {
    let mut graph = graph(&[("a", &[]), ("b", &["a"]), ("x", &[])]);
    graph.remove(&"a");
    assert_eq!(graph.get_execution_layers().unwrap(), vec![vec!["x"]]);
}

#[test]
fn test_cycle_is_detected() {
    let graph = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("free", &[])]);
    match graph.get_execution_layers() {
        Err(GraphError::Cycle { involved }) => {
            assert_eq!(involved, vec!["a", "b", "c"]);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[test]
fn test_missing_dependency_is_detected() {
    let graph = graph(&[("a", &["ghost"])]);
    assert_eq!(
        graph.get_execution_layers(),
        Err(GraphError::MissingDependency {
            node: "a",
            dependency: "ghost",
        })
    );
}

#[test]
fn test_empty_graph_has_no_layers() {
    let graph: DependencyGraph<String> = DependencyGraph::new();
    assert!(graph.get_execution_layers().unwrap().is_empty());
}
