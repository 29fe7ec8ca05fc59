//! Pre-partitioned tensor compute graphs.
//!
//! Partitioning itself happens upstream; the engine consumes a [`MultiGraph`]
//! whose per-key attributes (`num_predecessors`, `successors`) form a DAG.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable identifier of a partitioned subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubgraphKey(pub u32);

impl fmt::Display for SubgraphKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tensor, unique within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
}

impl DType {
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
        }
    }
}

/// Shape and dtype of a tensor argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub id: TensorId,
    pub shape: Vec<i64>,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn new(id: TensorId, shape: Vec<i64>, dtype: DType) -> Self {
        TensorMeta { id, shape, dtype }
    }

    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }
}

/// One partitioned subgraph, compiled and launched as a single kernel.
///
/// `tag` is a structural hash: two subgraphs with equal tags are
/// interchangeable for schedule reuse. `tensors` carries argument metadata in
/// the canonical call order (inputs, labels, outputs, weights, loss,
/// gradients, lr, updates).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subgraph {
    pub inputs: Vec<TensorId>,
    pub labels: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub weights: Vec<TensorId>,
    pub gradients: Vec<TensorId>,
    pub updates: Vec<TensorId>,
    pub loss: Option<TensorId>,
    pub lr: Option<TensorId>,
    pub tag: String,
    pub op_bodies: Vec<String>,
    pub flops: f64,
    pub tensors: Vec<TensorMeta>,
}

impl Subgraph {
    pub fn gflop(&self) -> f64 {
        self.flops / 1e9
    }

    /// Tensor ids in canonical call order.
    pub fn call_order_ids(&self) -> Vec<TensorId> {
        let mut ids = Vec::with_capacity(self.tensors.len());
        ids.extend(&self.inputs);
        ids.extend(&self.labels);
        ids.extend(&self.outputs);
        ids.extend(&self.weights);
        ids.extend(&self.loss);
        ids.extend(&self.gradients);
        ids.extend(&self.lr);
        ids.extend(&self.updates);
        ids
    }

    pub fn tensor_meta(&self, id: TensorId) -> Option<&TensorMeta> {
        self.tensors.iter().find(|m| m.id == id)
    }
}

/// DAG attributes of one subgraph within the multigraph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphAttrs {
    pub num_predecessors: usize,
    pub successors: Vec<SubgraphKey>,
}

/// Weight/gradient/update/loss metadata of the original (unpartitioned)
/// graph, used to set up persistent device buffers.
#[derive(Debug, Clone, Default)]
pub struct GraphTensors {
    pub weights: Vec<TensorMeta>,
    pub gradients: Vec<TensorMeta>,
    /// `updates[i]` aliases `weights[i]` (in-place update).
    pub updates: Vec<TensorId>,
    pub loss: Option<TensorMeta>,
}

/// A pre-partitioned graph: subgraphs plus DAG attributes plus the map from
/// subgraph-local tensors back to the original graph's tensors.
#[derive(Debug, Clone, Default)]
pub struct MultiGraph {
    pub graphs: HashMap<SubgraphKey, Subgraph>,
    pub attrs: HashMap<SubgraphKey, GraphAttrs>,
    pub tensor_index: HashMap<TensorId, TensorId>,
}

impl MultiGraph {
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Resolves a subgraph-local tensor to the original graph tensor.
    pub fn resolve(&self, local: TensorId) -> TensorId {
        self.tensor_index.get(&local).copied().unwrap_or(local)
    }

    /// Checks that every subgraph has attributes, every successor exists,
    /// and the attribute DAG is acyclic.
    pub fn validate(&self) -> Result<()> {
        for key in self.graphs.keys() {
            if !self.attrs.contains_key(key) {
                return Err(Error::bad_config(format!(
                    "subgraph {key} has no graph attributes"
                )));
            }
        }
        for (key, attrs) in &self.attrs {
            for succ in &attrs.successors {
                if !self.graphs.contains_key(succ) {
                    return Err(Error::bad_config(format!(
                        "subgraph {key} lists unknown successor {succ}"
                    )));
                }
            }
        }
        let order = self.static_order()?;
        debug_assert_eq!(order.len(), self.graphs.len());
        Ok(())
    }

    /// Kahn topological order over `num_predecessors`/`successors`.
    ///
    /// Waves are sorted by key so the order is deterministic across runs.
    pub fn static_order(&self) -> Result<Vec<SubgraphKey>> {
        let mut order = Vec::with_capacity(self.graphs.len());
        let mut remaining: HashMap<SubgraphKey, usize> = HashMap::new();
        let mut free_set: Vec<SubgraphKey> = Vec::new();
        for (key, attrs) in &self.attrs {
            remaining.insert(*key, attrs.num_predecessors);
            if attrs.num_predecessors == 0 {
                free_set.push(*key);
            }
        }

        while !free_set.is_empty() {
            free_set.sort_unstable();
            let mut update_set: HashSet<SubgraphKey> = HashSet::new();
            for key in free_set.drain(..) {
                order.push(key);
                for succ in &self.attrs[&key].successors {
                    if let Some(count) = remaining.get_mut(succ) {
                        if *count > 0 {
                            *count -= 1;
                            if *count == 0 {
                                update_set.insert(*succ);
                            }
                        }
                    }
                }
            }
            free_set.extend(update_set);
        }

        if order.len() != self.graphs.len() {
            return Err(Error::bad_config(
                "multigraph contains a cycle, no topological order exists",
            ));
        }
        Ok(order)
    }
}
