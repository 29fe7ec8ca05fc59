//! Reference CPU collaborators for the graphtune engine.
//!
//! Everything here is deterministic and in-process: the schedule space is a
//! small tiling grid, "compiling" produces an in-memory module whose entry
//! point runs an elementwise kernel over `Vec<f32>` buffers, and the device
//! timer derives elapsed time from the tiling instead of wall clock, so
//! tuning converges the same way on every run. Failure injection hooks
//! (`fail_next_schedules`, `fail_next_evaluations`) script the engine's
//! rescue paths for tests.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use graphtune::graph::{Subgraph, TensorMeta};
use graphtune::schedule::{Schedule, ScheduleEntity};
use graphtune::spec::{
    BackendError, BackendResult, BufferHandle, BufferMap, BuildConfig, CodeGenerator,
    Collaborators, DeviceRuntime, EntryPoint, Judge, JudgePolicy, Module, ScheduleSpace, Target,
};

const TILE_FACTORS: &[u32] = &[1, 2, 4, 8, 16, 32];
const VEC_FACTORS: &[u32] = &[1, 2, 4, 8];
const UNROLL_FACTORS: &[u32] = &[1, 2, 4];

/// A point in the reference schedule space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tiling {
    tile: u32,
    vec: u32,
    unroll: u32,
}

impl Tiling {
    fn parse(entity: &ScheduleEntity) -> BackendResult<Self> {
        let mut tile = None;
        let mut vec = None;
        let mut unroll = None;
        for part in entity.as_str().split(';') {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                BackendError::execution(format!("malformed schedule entity: {entity}"))
            })?;
            let value: u32 = value.parse().map_err(|_| {
                BackendError::execution(format!("malformed schedule entity: {entity}"))
            })?;
            match name {
                "tile" => tile = Some(value),
                "vec" => vec = Some(value),
                "unroll" => unroll = Some(value),
                other => {
                    return Err(BackendError::execution(format!(
                        "unknown schedule knob '{other}'"
                    )))
                }
            }
        }
        match (tile, vec, unroll) {
            (Some(tile), Some(vec), Some(unroll)) => Ok(Tiling { tile, vec, unroll }),
            _ => Err(BackendError::execution(format!(
                "incomplete schedule entity: {entity}"
            ))),
        }
    }

    fn entity(self) -> ScheduleEntity {
        ScheduleEntity::new(format!(
            "tile={};vec={};unroll={}",
            self.tile, self.vec, self.unroll
        ))
        .expect("tiling text is a valid entity")
    }

    /// Deterministic elapsed time. The optimum sits at tile=16, vec=4,
    /// unroll=2; everything else pays a penalty, so measured feedback pulls
    /// the search toward one point.
    fn simulated_elapsed_ms(self, elements: i64) -> f64 {
        let tile_penalty = ((self.tile as f64).log2() - 4.0).abs();
        let vec_penalty = ((self.vec as f64).log2() - 2.0).abs();
        let unroll_penalty = ((self.unroll as f64).log2() - 1.0).abs();
        let base = 0.05 + elements as f64 * 1e-7;
        base * (1.0 + 0.3 * tile_penalty + 0.2 * vec_penalty + 0.1 * unroll_penalty)
    }
}

fn total_elements(tensors: &[TensorMeta]) -> i64 {
    tensors.iter().map(TensorMeta::num_elements).sum()
}

/// In-memory compiled module: the tiling plus the expected argument list.
struct RefModule {
    entry_name: String,
    tiling: Tiling,
    tensors: Vec<TensorMeta>,
}

impl Module for RefModule {
    fn entry(&self, name: &str) -> Option<EntryPoint> {
        if name != self.entry_name {
            return None;
        }
        let expected = self.tensors.len();
        let entry: EntryPoint = Arc::new(move |args: &[BufferHandle]| {
            if args.len() != expected {
                return Err(BackendError::execution(format!(
                    "expected {expected} arguments, got {}",
                    args.len()
                )));
            }
            for arg in args {
                let buffer = arg
                    .downcast_ref::<Mutex<Vec<f32>>>()
                    .ok_or_else(|| BackendError::execution("argument is not a ref buffer"))?;
                let mut data = buffer.lock().expect("ref buffer poisoned");
                for value in data.iter_mut() {
                    *value += 1.0;
                }
            }
            Ok(())
        });
        Some(entry)
    }

    fn source(&self) -> Option<String> {
        Some(format!(
            "// ref kernel {} tile={} vec={} unroll={}",
            self.entry_name, self.tiling.tile, self.tiling.vec, self.tiling.unroll
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared state behind every clone of a [`RefBackend`].
struct RefState {
    rng: Mutex<StdRng>,
    /// tag -> remaining scripted sampling failures.
    schedule_failures: Mutex<HashMap<String, u32>>,
    /// entry name -> remaining scripted evaluation failures.
    eval_failures: Mutex<HashMap<String, u32>>,
}

/// The reference collaborator bundle. One instance implements all four
/// engine contracts; clones share the rng and the failure scripts.
#[derive(Clone)]
pub struct RefBackend {
    state: Arc<RefState>,
}

impl Default for RefBackend {
    fn default() -> Self {
        RefBackend::new()
    }
}

impl RefBackend {
    pub fn new() -> Self {
        RefBackend::with_seed(0x9e3779b9)
    }

    pub fn with_seed(seed: u64) -> Self {
        RefBackend {
            state: Arc::new(RefState {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                schedule_failures: Mutex::new(HashMap::new()),
                eval_failures: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            space: Arc::new(self.clone()) as Arc<dyn ScheduleSpace>,
            judge: Arc::new(self.clone()) as Arc<dyn Judge>,
            codegen: Arc::new(self.clone()) as Arc<dyn CodeGenerator>,
            device: Arc::new(self.clone()) as Arc<dyn DeviceRuntime>,
        }
    }

    /// The next `count` sampling attempts for subgraphs with `tag` fail.
    pub fn fail_next_schedules(&self, tag: &str, count: u32) {
        self.state
            .schedule_failures
            .lock()
            .expect("failure plan poisoned")
            .insert(tag.to_string(), count);
    }

    /// The next `count` measurements of `entry_name` report failure.
    pub fn fail_next_evaluations(&self, entry_name: &str, count: u32) {
        self.state
            .eval_failures
            .lock()
            .expect("failure plan poisoned")
            .insert(entry_name.to_string(), count);
    }

    fn pick<T: Copy>(&self, options: &[T]) -> T {
        let mut rng = self.state.rng.lock().expect("ref rng poisoned");
        options[rng.gen_range(0..options.len())]
    }

    fn take_scripted_failure(map: &Mutex<HashMap<String, u32>>, key: &str) -> bool {
        let mut map = map.lock().expect("failure plan poisoned");
        match map.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl ScheduleSpace for RefBackend {
    fn choose_one(&self, subgraph: &Subgraph) -> BackendResult<ScheduleEntity> {
        if Self::take_scripted_failure(&self.state.schedule_failures, &subgraph.tag) {
            return Err(BackendError::execution(format!(
                "scripted sampling failure for tag {}",
                subgraph.tag
            )));
        }
        let tiling = Tiling {
            tile: self.pick(TILE_FACTORS),
            vec: self.pick(VEC_FACTORS),
            unroll: self.pick(UNROLL_FACTORS),
        };
        Ok(tiling.entity())
    }

    fn choose_one_near(
        &self,
        subgraph: &Subgraph,
        seed: &ScheduleEntity,
    ) -> BackendResult<ScheduleEntity> {
        if Self::take_scripted_failure(&self.state.schedule_failures, &subgraph.tag) {
            return Err(BackendError::execution(format!(
                "scripted sampling failure for tag {}",
                subgraph.tag
            )));
        }
        let mut tiling = Tiling::parse(seed)?;
        let step: i32 = if self.pick(&[true, false]) { 1 } else { -1 };
        match self.pick(&[0u8, 1, 2]) {
            0 => tiling.tile = neighbour(TILE_FACTORS, tiling.tile, step),
            1 => tiling.vec = neighbour(VEC_FACTORS, tiling.vec, step),
            _ => tiling.unroll = neighbour(UNROLL_FACTORS, tiling.unroll, step),
        }
        Ok(tiling.entity())
    }

    fn interpret(
        &self,
        schedule: &mut Schedule,
        _tensors: &[TensorMeta],
        _subgraph: &Subgraph,
        _target: &Target,
        entity: &ScheduleEntity,
    ) -> BackendResult<()> {
        Tiling::parse(entity)?;
        schedule.entity = Some(entity.clone());
        Ok(())
    }
}

fn neighbour(options: &[u32], current: u32, step: i32) -> u32 {
    let index = options
        .iter()
        .position(|&v| v == current)
        .unwrap_or(0) as i32;
    let next = (index + step).clamp(0, options.len() as i32 - 1);
    options[next as usize]
}

impl Judge for RefBackend {
    fn judge(
        &self,
        schedules: &[Schedule],
        tensors: &[TensorMeta],
        _target: &Target,
        gflop: f64,
        _policy: JudgePolicy,
    ) -> BackendResult<Vec<f64>> {
        let elements = total_elements(tensors);
        schedules
            .iter()
            .map(|schedule| {
                let entity = schedule.entity.as_ref().ok_or_else(|| {
                    BackendError::execution("schedule was not realised before judging")
                })?;
                let elapsed = Tiling::parse(entity)?.simulated_elapsed_ms(elements);
                Ok(gflop / (elapsed / 1e3 + 1e-8))
            })
            .collect()
    }

    fn feature(
        &self,
        schedule: &Schedule,
        tensors: &[TensorMeta],
        _target: &Target,
    ) -> Vec<Vec<f64>> {
        let Some(entity) = schedule.entity.as_ref() else {
            return Vec::new();
        };
        let Ok(tiling) = Tiling::parse(entity) else {
            return Vec::new();
        };
        vec![vec![
            tiling.tile as f64,
            tiling.vec as f64,
            tiling.unroll as f64,
            total_elements(tensors) as f64,
        ]]
    }
}

impl CodeGenerator for RefBackend {
    fn build(
        &self,
        schedule: &Schedule,
        tensors: &[TensorMeta],
        _device_target: &Target,
        _host_target: &Target,
        entry_name: &str,
        _buffer_map: &BufferMap,
        _config: &BuildConfig,
    ) -> BackendResult<Arc<dyn Module>> {
        let entity = schedule
            .entity
            .as_ref()
            .ok_or_else(|| BackendError::execution("schedule was not realised before build"))?;
        let tiling = Tiling::parse(entity)?;
        Ok(Arc::new(RefModule {
            entry_name: entry_name.to_string(),
            tiling,
            tensors: tensors.to_vec(),
        }))
    }
}

impl DeviceRuntime for RefBackend {
    fn alloc_zeroed(&self, meta: &TensorMeta) -> BackendResult<BufferHandle> {
        let elements = usize::try_from(meta.num_elements().max(0))
            .map_err(|_| BackendError::execution("tensor is too large for the ref device"))?;
        Ok(Arc::new(Mutex::new(vec![0.0f32; elements])) as BufferHandle)
    }

    fn evaluate_performance(
        &self,
        module: &Arc<dyn Module>,
        entry_name: &str,
        tensors: &[TensorMeta],
    ) -> f64 {
        if Self::take_scripted_failure(&self.state.eval_failures, entry_name) {
            return -1.0;
        }
        let Some(module) = module.as_any().downcast_ref::<RefModule>() else {
            return -1.0;
        };
        if module.entry(entry_name).is_none() {
            return -1.0;
        }
        module.tiling.simulated_elapsed_ms(total_elements(tensors))
    }

    fn stream_sync(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Wraps host data as a device buffer the reference kernels understand.
pub fn buffer_from_vec(data: Vec<f32>) -> BufferHandle {
    Arc::new(Mutex::new(data)) as BufferHandle
}

/// Reads a reference buffer back to the host.
pub fn read_buffer(handle: &BufferHandle) -> Option<Vec<f32>> {
    handle
        .downcast_ref::<Mutex<Vec<f32>>>()
        .map(|buffer| buffer.lock().expect("ref buffer poisoned").clone())
}
