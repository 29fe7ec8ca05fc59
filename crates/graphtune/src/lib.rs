//! Online auto-tuning runtime for tensor compute graphs.
//!
//! Given a pre-partitioned multigraph of tensor operators, a session
//! concurrently searches schedule spaces, compiles candidates into loadable
//! modules, measures them on a device, and executes the best-known function
//! per subgraph while tuning keeps improving them in the background.
//!
//! The crate owns the pipeline; the schedule space, cost model, code
//! generator, and device runtime are injected through the contracts in
//! [`spec`].

pub mod autoschedule;
pub mod builder;
pub mod catalog;
pub mod error;
pub mod graph;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod reference;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod spec;

pub use error::{Error, Result};
pub use graph::{DType, GraphAttrs, GraphTensors, MultiGraph, Subgraph, SubgraphKey, TensorId,
    TensorMeta};
pub use schedule::{BuiltFunction, Schedule, ScheduleEntity, ScheduleResult, ScoredFunction};
pub use session::{DeviceContext, DeviceKind, Session, SessionOption, TaskId};
pub use spec::{Collaborators, JudgePolicy, Target};
