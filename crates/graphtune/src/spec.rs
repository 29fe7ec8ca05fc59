//! Collaborator contracts for the tuning engine.
//!
//! The engine core depends only on these narrow capability interfaces; the
//! schedule-space sampler, the cost model, the code generator, and the device
//! runtime are injected at session construction and may live in external
//! crates (see `graphtune-backend-ref` for a reference implementation).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Subgraph, TensorId, TensorMeta};
use crate::schedule::{Schedule, ScheduleEntity};

/// Errors raised by collaborator implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("execution error: {0}")]
    Execution(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        BackendError::Unsupported(message.into())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Type-erased device buffer. Collaborators downcast to their concrete
/// storage type; the engine only moves these around.
pub type BufferHandle = Arc<dyn Any + Send + Sync>;

/// Compilation target. `cuda` and `llvm` are the names the session engine
/// recognises when picking a device context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub arch: Option<String>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Target {
            name: name.into(),
            arch: None,
        }
    }

    pub fn cuda() -> Self {
        Target::new("cuda")
    }

    pub fn llvm() -> Self {
        Target::new("llvm")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arch {
            Some(arch) => write!(f, "{} -arch={}", self.name, arch),
            None => write!(f, "{}", self.name),
        }
    }
}

/// How candidate schedules are scored during sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgePolicy {
    /// Measure on the device via the profiler collaborator.
    Profile,
    /// Uniform random scores, no measurement.
    Random,
    /// External learned cost model.
    Model,
}

impl JudgePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            JudgePolicy::Profile => "profile",
            JudgePolicy::Random => "random",
            JudgePolicy::Model => "model",
        }
    }
}

impl fmt::Display for JudgePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JudgePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(JudgePolicy::Profile),
            "random" => Ok(JudgePolicy::Random),
            "model" => Ok(JudgePolicy::Model),
            other => Err(format!("unknown judge policy '{other}'")),
        }
    }
}

/// Options forwarded to the code generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub opt_level: u8,
    pub fast_math: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            opt_level: 2,
            fast_math: false,
        }
    }
}

/// Optional binding of subgraph tensors to named device buffers, forwarded
/// verbatim to the code generator.
pub type BufferMap = HashMap<TensorId, String>;

/// A callable compiled entry point. Arguments arrive in the subgraph's
/// canonical order (inputs, labels, outputs, weights, loss, gradients, lr,
/// updates).
pub type EntryPoint = Arc<dyn Fn(&[BufferHandle]) -> BackendResult<()> + Send + Sync>;

/// A loadable compiled module.
pub trait Module: Send + Sync {
    /// Resolves an entry point by symbol name.
    fn entry(&self, name: &str) -> Option<EntryPoint>;

    /// Generated source, if the backend keeps it around. Logged when an
    /// evaluation fails.
    fn source(&self) -> Option<String> {
        None
    }

    /// Downcast hook so a device runtime can recover its concrete module
    /// type.
    fn as_any(&self) -> &dyn Any;
}

/// Entry-point symbol for a subgraph.
pub fn entry_symbol(key: crate::graph::SubgraphKey) -> String {
    format!("subgraph_{}", key.0)
}

/// The schedule search space of a subgraph.
pub trait ScheduleSpace: Send + Sync {
    /// Samples one point uniformly from the space.
    fn choose_one(&self, subgraph: &Subgraph) -> BackendResult<ScheduleEntity>;

    /// Samples one point in the neighbourhood of `seed`.
    fn choose_one_near(
        &self,
        subgraph: &Subgraph,
        seed: &ScheduleEntity,
    ) -> BackendResult<ScheduleEntity>;

    /// Realises `entity` into `schedule`.
    fn interpret(
        &self,
        schedule: &mut Schedule,
        tensors: &[TensorMeta],
        subgraph: &Subgraph,
        target: &Target,
        entity: &ScheduleEntity,
    ) -> BackendResult<()>;
}

/// Scores candidate schedules. `Random` never reaches the collaborator; the
/// engine scores it in-process.
pub trait Judge: Send + Sync {
    fn judge(
        &self,
        schedules: &[Schedule],
        tensors: &[TensorMeta],
        target: &Target,
        gflop: f64,
        policy: JudgePolicy,
    ) -> BackendResult<Vec<f64>>;

    /// Per-loop-nest feature vectors for the profile log.
    fn feature(
        &self,
        schedule: &Schedule,
        tensors: &[TensorMeta],
        target: &Target,
    ) -> Vec<Vec<f64>>;
}

/// Lowers a realised schedule into a loadable module.
pub trait CodeGenerator: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        schedule: &Schedule,
        tensors: &[TensorMeta],
        device_target: &Target,
        host_target: &Target,
        entry_name: &str,
        buffer_map: &BufferMap,
        config: &BuildConfig,
    ) -> BackendResult<Arc<dyn Module>>;
}

/// Device memory and measurement.
pub trait DeviceRuntime: Send + Sync {
    /// Allocates a zero-initialised buffer for `meta`.
    fn alloc_zeroed(&self, meta: &TensorMeta) -> BackendResult<BufferHandle>;

    /// Runs `entry_name` from `module` on freshly bound buffers and returns
    /// elapsed milliseconds, or a value `<= 0` on failure or timeout.
    fn evaluate_performance(
        &self,
        module: &Arc<dyn Module>,
        entry_name: &str,
        tensors: &[TensorMeta],
    ) -> f64;

    /// Synchronises the device stream.
    fn stream_sync(&self) -> BackendResult<()>;
}

/// The collaborator bundle injected at session construction.
#[derive(Clone)]
pub struct Collaborators {
    pub space: Arc<dyn ScheduleSpace>,
    pub judge: Arc<dyn Judge>,
    pub codegen: Arc<dyn CodeGenerator>,
    pub device: Arc<dyn DeviceRuntime>,
}
