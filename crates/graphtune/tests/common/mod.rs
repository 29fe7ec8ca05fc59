//! Shared fixtures for the integration tests: tiny multigraphs over the
//! reference backend.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use graphtune::graph::{
    DType, GraphAttrs, MultiGraph, Subgraph, SubgraphKey, TensorId, TensorMeta,
};
use graphtune::session::{Session, SessionOption};
use graphtune::spec::{JudgePolicy, Target};
use graphtune_backend_ref::RefBackend;

pub const TENSOR_ELEMENTS: i64 = 16;

pub fn tensor(id: u32) -> TensorMeta {
    TensorMeta::new(TensorId(id), vec![TENSOR_ELEMENTS], DType::F32)
}

/// A one-input one-output subgraph worth one GFLOP.
pub fn subgraph(tag: &str, input: u32, output: u32) -> Subgraph {
    Subgraph {
        inputs: vec![TensorId(input)],
        labels: Vec::new(),
        outputs: vec![TensorId(output)],
        weights: Vec::new(),
        gradients: Vec::new(),
        updates: Vec::new(),
        loss: None,
        lr: None,
        tag: tag.to_string(),
        op_bodies: vec![format!("compute_{tag}")],
        flops: 1e9,
        tensors: vec![tensor(input), tensor(output)],
    }
}

fn identity_index(graphs: &HashMap<SubgraphKey, Subgraph>) -> HashMap<TensorId, TensorId> {
    let mut index = HashMap::new();
    for subgraph in graphs.values() {
        for meta in &subgraph.tensors {
            index.insert(meta.id, meta.id);
        }
    }
    index
}

/// `tags[i]` becomes subgraph key `i`; key `i` feeds key `i + 1`.
pub fn chain(tags: &[&str]) -> MultiGraph {
    let mut graphs = HashMap::new();
    let mut attrs = HashMap::new();
    for (i, tag) in tags.iter().enumerate() {
        let key = SubgraphKey(i as u32);
        graphs.insert(key, subgraph(tag, i as u32, i as u32 + 1));
        let successors = if i + 1 < tags.len() {
            vec![SubgraphKey(i as u32 + 1)]
        } else {
            Vec::new()
        };
        attrs.insert(
            key,
            GraphAttrs {
                num_predecessors: usize::from(i > 0),
                successors,
            },
        );
    }
    let tensor_index = identity_index(&graphs);
    MultiGraph {
        graphs,
        attrs,
        tensor_index,
    }
}

/// `tags[i]` becomes subgraph key `i`; no edges, disjoint tensors.
pub fn independent(tags: &[&str]) -> MultiGraph {
    let mut graphs = HashMap::new();
    let mut attrs = HashMap::new();
    for (i, tag) in tags.iter().enumerate() {
        let key = SubgraphKey(i as u32);
        graphs.insert(key, subgraph(tag, 2 * i as u32, 2 * i as u32 + 1));
        attrs.insert(key, GraphAttrs::default());
    }
    let tensor_index = identity_index(&graphs);
    MultiGraph {
        graphs,
        attrs,
        tensor_index,
    }
}

/// Random-policy options with no log files and generous job budgets.
pub fn fast_options() -> SessionOption {
    SessionOption {
        autoschedule_policy: JudgePolicy::Random,
        autoschedule_timeout_ms: 10_000,
        build_timeout_ms: 10_000,
        ..SessionOption::default()
    }
}

/// Honours `RUST_LOG` so a failing pipeline test can be rerun with engine
/// diagnostics.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn new_session(backend: &RefBackend, options: SessionOption) -> Arc<Session> {
    init_tracing();
    Arc::new(
        Session::new(Target::llvm(), 0, options, backend.collaborators())
            .expect("session construction"),
    )
}

/// Per-iteration bindings feeding `input_ids`.
pub fn bindings_for(
    iterations: usize,
    input_ids: &[u32],
) -> Vec<HashMap<TensorId, graphtune::spec::BufferHandle>> {
    (0..iterations)
        .map(|_| {
            input_ids
                .iter()
                .map(|id| {
                    (
                        TensorId(*id),
                        graphtune_backend_ref::buffer_from_vec(vec![1.0; TENSOR_ELEMENTS as usize]),
                    )
                })
                .collect()
        })
        .collect()
}
