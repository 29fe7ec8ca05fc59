mod common;

use std::collections::HashMap;

use graphtune::graph::{GraphAttrs, MultiGraph, SubgraphKey};

fn diamond() -> MultiGraph {
    // 0 -> {1, 2} -> 3
    let mut graph = common::independent(&["a", "b", "c", "d"]);
    let edges: HashMap<SubgraphKey, GraphAttrs> = [
        (
            SubgraphKey(0),
            GraphAttrs {
                num_predecessors: 0,
                successors: vec![SubgraphKey(1), SubgraphKey(2)],
            },
        ),
        (
            SubgraphKey(1),
            GraphAttrs {
                num_predecessors: 1,
                successors: vec![SubgraphKey(3)],
            },
        ),
        (
            SubgraphKey(2),
            GraphAttrs {
                num_predecessors: 1,
                successors: vec![SubgraphKey(3)],
            },
        ),
        (
            SubgraphKey(3),
            GraphAttrs {
                num_predecessors: 2,
                successors: Vec::new(),
            },
        ),
    ]
    .into_iter()
    .collect();
    graph.attrs = edges;
    graph
}

fn assert_topological(graph: &MultiGraph, order: &[SubgraphKey]) {
    let position: HashMap<SubgraphKey, usize> =
        order.iter().enumerate().map(|(i, k)| (*k, i)).collect();
    assert_eq!(position.len(), graph.len(), "order visits every subgraph once");
    for (key, attrs) in &graph.attrs {
        for succ in &attrs.successors {
            assert!(
                position[key] < position[succ],
                "{key} must precede its successor {succ}"
            );
        }
    }
}

#[test]
fn static_order_of_a_diamond_is_topological() {
    let graph = diamond();
    let order = graph.static_order().expect("acyclic graph");
    assert_topological(&graph, &order);
    assert_eq!(order[0], SubgraphKey(0));
    assert_eq!(order[3], SubgraphKey(3));
}

#[test]
fn static_order_of_a_chain_is_the_chain() {
    let graph = common::chain(&["a", "b", "c"]);
    let order = graph.static_order().expect("acyclic graph");
    assert_eq!(
        order,
        vec![SubgraphKey(0), SubgraphKey(1), SubgraphKey(2)]
    );
}

#[test]
fn cyclic_graphs_are_rejected() {
    let mut graph = common::chain(&["a", "b"]);
    // Close the loop: 1 -> 0.
    graph.attrs.get_mut(&SubgraphKey(1)).unwrap().successors = vec![SubgraphKey(0)];
    graph.attrs.get_mut(&SubgraphKey(0)).unwrap().num_predecessors = 1;
    assert!(graph.static_order().is_err());
    assert!(graph.validate().is_err());
}

#[test]
fn unknown_successors_are_rejected() {
    let mut graph = common::chain(&["a"]);
    graph.attrs.get_mut(&SubgraphKey(0)).unwrap().successors = vec![SubgraphKey(42)];
    assert!(graph.validate().is_err());
}
