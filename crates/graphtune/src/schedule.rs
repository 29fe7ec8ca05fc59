//! Schedule points, realised schedules, and compiled functions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{Subgraph, TensorMeta};
use crate::spec::{EntryPoint, Module};

/// A point in the schedule search space, serialised as one line of text.
///
/// The text never contains `|` or newlines so it can be embedded in
/// reference-file records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduleEntity(Arc<str>);

impl ScheduleEntity {
    pub fn new(text: impl AsRef<str>) -> Result<Self> {
        let text = text.as_ref();
        if text.is_empty() {
            return Err(Error::bad_config("schedule entity must not be empty"));
        }
        if text.contains('|') || text.contains('\n') || text.contains('\r') {
            return Err(Error::bad_config(format!(
                "schedule entity must not contain '|' or newlines: {text:?}"
            )));
        }
        Ok(ScheduleEntity(Arc::from(text)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ScheduleEntity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ScheduleEntity::new(s)
    }
}

/// A schedule under construction: the subgraph's root op bodies plus the
/// entity realised into it by the interpreter collaborator.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub root_ops: Vec<String>,
    pub entity: Option<ScheduleEntity>,
}

impl Schedule {
    /// Fresh empty schedule over the subgraph's root operations.
    pub fn empty(subgraph: &Subgraph) -> Self {
        Schedule {
            root_ops: subgraph.op_bodies.clone(),
            entity: None,
        }
    }
}

/// The outcome of one sampling round: a realised schedule, the tensor
/// argument metadata, and the entity it came from.
#[derive(Clone)]
pub struct ScheduleResult {
    pub schedule: Arc<Schedule>,
    pub tensors: Arc<[TensorMeta]>,
    pub entity: ScheduleEntity,
}

impl fmt::Debug for ScheduleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleResult")
            .field("entity", &self.entity)
            .field("tensors", &self.tensors.len())
            .finish()
    }
}

/// A compiled schedule with its resolved entry point.
#[derive(Clone)]
pub struct BuiltFunction {
    pub result: ScheduleResult,
    pub module: Arc<dyn Module>,
    pub entry: EntryPoint,
}

/// A built function with a measured (or seeded) performance.
#[derive(Clone)]
pub struct ScoredFunction {
    pub func: BuiltFunction,
    pub gflops: f64,
    pub elapsed_ms: f64,
}

/// Heap entry of the per-subgraph top-k cache, ordered by score.
#[derive(Clone)]
pub struct EvaluatedSchedule {
    pub result: ScheduleResult,
    pub score: f64,
}

impl PartialEq for EvaluatedSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score) == Ordering::Equal
    }
}

impl Eq for EvaluatedSchedule {}

impl PartialOrd for EvaluatedSchedule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvaluatedSchedule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score)
    }
}
