//! Compiles scored schedules into loadable modules on a dedicated pool.

use std::sync::Arc;

use crate::autoschedule::Priority;
use crate::error::{Error, Result};
use crate::graph::SubgraphKey;
use crate::pool::{JobHandle, WorkerPool};
use crate::schedule::ScheduleResult;
use crate::spec::{BackendResult, BuildConfig, BufferMap, CodeGenerator, Module, Target};

pub struct FunctionBuilder {
    codegen: Arc<dyn CodeGenerator>,
    pool: WorkerPool,
}

impl FunctionBuilder {
    pub fn new(codegen: Arc<dyn CodeGenerator>, parallel: usize, timeout_ms: u64) -> Self {
        FunctionBuilder {
            codegen,
            pool: WorkerPool::new(parallel, timeout_ms),
        }
    }

    /// Submits a code-generation job; the handle yields the module or the
    /// generator's failure.
    #[allow(clippy::too_many_arguments)]
    pub fn build_for(
        &self,
        result: &ScheduleResult,
        device_target: &Target,
        host_target: &Target,
        entry_name: &str,
        buffer_map: &BufferMap,
        config: &BuildConfig,
        priority: Priority,
    ) -> Result<(ScheduleResult, JobHandle<BackendResult<Arc<dyn Module>>>)> {
        let codegen = Arc::clone(&self.codegen);
        let job_result = result.clone();
        let device_target = device_target.clone();
        let host_target = host_target.clone();
        let entry_name = entry_name.to_string();
        let buffer_map = buffer_map.clone();
        let config = config.clone();
        let job = move || {
            codegen.build(
                &job_result.schedule,
                &job_result.tensors,
                &device_target,
                &host_target,
                &entry_name,
                &buffer_map,
                &config,
            )
        };
        let handle = match priority {
            Priority::Normal => self.pool.push_back(job)?,
            Priority::Emergency => self.pool.push_front(job)?,
        };
        Ok((result.clone(), handle))
    }

    /// Synchronous build, used when seeding from a reference file.
    #[allow(clippy::too_many_arguments)]
    pub fn build_func(
        &self,
        key: SubgraphKey,
        result: &ScheduleResult,
        device_target: &Target,
        host_target: &Target,
        entry_name: &str,
        buffer_map: &BufferMap,
        config: &BuildConfig,
    ) -> Result<Arc<dyn Module>> {
        self.codegen
            .build(
                &result.schedule,
                &result.tensors,
                device_target,
                host_target,
                entry_name,
                buffer_map,
                config,
            )
            .map_err(|err| Error::BuildFailed {
                key,
                reason: err.to_string(),
            })
    }
}
