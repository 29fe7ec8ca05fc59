use thiserror::Error;

use crate::graph::SubgraphKey;
use crate::pool::PoolError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the tuning engine.
///
/// Schedule, build, and evaluation failures are absorbed by the pipeline
/// loops (logged and fed back as zero GFLOPS); the remaining kinds abort the
/// calling API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("schedule sampling failed for subgraph {key}: {reason}")]
    ScheduleFailed { key: SubgraphKey, reason: String },

    #[error("build failed for subgraph {key}: {reason}")]
    BuildFailed { key: SubgraphKey, reason: String },

    #[error("evaluation failed for subgraph {key}")]
    EvalFailed { key: SubgraphKey },

    #[error("job exceeded its wall-clock budget")]
    Timeout,

    #[error("missing function or buffer: {what}")]
    MissingFunction { what: String },

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("bad configuration: {reason}")]
    BadConfig { reason: String },

    #[error("no such task {task_id}")]
    TaskNotFound { task_id: usize },

    #[error("no such session {session_id}")]
    SessionNotFound { session_id: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] crate::spec::BackendError),
}

impl Error {
    pub fn bad_config(reason: impl Into<String>) -> Self {
        Error::BadConfig {
            reason: reason.into(),
        }
    }

    pub fn missing(what: impl Into<String>) -> Self {
        Error::MissingFunction { what: what.into() }
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout(_) => Error::Timeout,
            PoolError::Shutdown | PoolError::Spawn(_) => Error::PoolShutdown,
        }
    }
}
