mod common;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use graphtune::graph::{GraphAttrs, GraphTensors, MultiGraph, SubgraphKey, TensorId};
use graphtune_backend_ref::{buffer_from_vec, read_buffer, RefBackend};

/// One training-style subgraph: input t0, output t1, weight t2 updated in
/// place through t3.
fn training_graph() -> (MultiGraph, GraphTensors) {
    let mut subgraph = common::subgraph("train", 0, 1);
    subgraph.weights = vec![TensorId(2)];
    subgraph.updates = vec![TensorId(3)];
    subgraph.tensors = vec![
        common::tensor(0),
        common::tensor(1),
        common::tensor(2),
        common::tensor(3),
    ];

    let mut graphs = HashMap::new();
    graphs.insert(SubgraphKey(0), subgraph);
    let mut attrs = HashMap::new();
    attrs.insert(SubgraphKey(0), GraphAttrs::default());
    let tensor_index: HashMap<TensorId, TensorId> =
        (0..4).map(|i| (TensorId(i), TensorId(i))).collect();

    let graph_tensors = GraphTensors {
        weights: vec![common::tensor(2)],
        gradients: Vec::new(),
        updates: vec![TensorId(3)],
        loss: None,
    };
    (
        MultiGraph {
            graphs,
            attrs,
            tensor_index,
        },
        graph_tensors,
    )
}

#[test]
fn updates_share_their_weight_buffer() -> Result<()> {
    let backend = RefBackend::with_seed(307);
    let session = common::new_session(&backend, common::fast_options());
    let (graph, graph_tensors) = training_graph();

    let weight_buffer = buffer_from_vec(vec![5.0; common::TENSOR_ELEMENTS as usize]);
    session.initialize_weights(&graph_tensors, vec![weight_buffer])?;

    let data = session.get_data(&[TensorId(2), TensorId(3)])?;
    assert!(
        Arc::ptr_eq(&data[0], &data[1]),
        "weight and update must alias one device buffer"
    );

    let task = session.add_task(graph)?;
    session.begin_tuning(task, 5, None, 1, 0.5)?;
    session.end_tuning(task)?;

    // The reference kernel adds one to every element of every argument; the
    // aliased weight appears twice in the argument vector, so one iteration
    // moves it by two.
    let bindings = common::bindings_for(1, &[0]);
    session.run(task, &bindings, "", 0)?;
    let weights = read_buffer(&data[0]).expect("ref buffer");
    assert!(weights.iter().all(|&v| (v - 7.0).abs() < 1e-6));
    Ok(())
}

#[test]
fn weight_binding_count_must_match() {
    let backend = RefBackend::with_seed(311);
    let session = common::new_session(&backend, common::fast_options());
    let (_, graph_tensors) = training_graph();
    let err = session
        .initialize_weights(&graph_tensors, Vec::new())
        .unwrap_err();
    assert!(matches!(err, graphtune::Error::BadConfig { .. }));
}

#[test]
fn missing_argument_buffers_fail_the_run() -> Result<()> {
    let backend = RefBackend::with_seed(313);
    let session = common::new_session(&backend, common::fast_options());
    let (graph, graph_tensors) = training_graph();
    let weight_buffer = buffer_from_vec(vec![0.0; common::TENSOR_ELEMENTS as usize]);
    session.initialize_weights(&graph_tensors, vec![weight_buffer])?;
    let task = session.add_task(graph)?;
    session.begin_tuning(task, 3, None, 1, 0.5)?;
    session.end_tuning(task)?;

    // No binding for the input tensor.
    let bindings = vec![HashMap::new()];
    let err = session.run(task, &bindings, "", 0).unwrap_err();
    assert!(matches!(err, graphtune::Error::MissingFunction { .. }));
    Ok(())
}
