//! The session execution engine.
//!
//! A session owns the auto-scheduler, the function builder, the catalog of
//! per-subgraph result queues, and the device buffers of its tasks. Each
//! tuning task runs three long-lived threads (schedule / build / evaluate)
//! that walk the task DAG in topological waves and communicate only through
//! the catalog queues, the emergency key queues, and the shared finish flag.
//! The threads share an [`Engine`] with the session rather than the session
//! itself, so dropping the session can still tear the pipeline down.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::autoschedule::{AutoScheduler, Priority};
use crate::builder::FunctionBuilder;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::graph::{GraphTensors, MultiGraph, Subgraph, SubgraphKey, TensorId};
use crate::logging::{profile_log_path, LogStream};
use crate::reference::{self, ReferenceRecord};
use crate::schedule::{BuiltFunction, ScoredFunction};
use crate::spec::{
    entry_symbol, BufferHandle, BufferMap, BuildConfig, Collaborators, JudgePolicy, Target,
};

pub type TaskId = usize;

/// Score recorded for functions seeded from a reference file, before any
/// real measurement replaces them.
const SEED_SCORE: f64 = -999.0;

/// How many 1 ms waits `run_functions` tolerates on an empty best queue
/// before giving up on the subgraph.
const BEST_WAIT_RETRIES: usize = 10_000;

/// Chance that a second-stage iteration walks the full DAG anyway.
const FIRST_STAGE_FALLBACK_PROBABILITY: f64 = 0.1;

/// Session configuration. Every knob of the tuning engine is set here;
/// collaborators receive the options relevant to them at construction.
#[derive(Debug, Clone)]
pub struct SessionOption {
    pub report_profile: bool,
    pub report_iteration: bool,
    pub report_iteration_period: usize,
    pub autoschedule_trial_ratio: f64,
    pub autoschedule_topk: usize,
    pub autoschedule_new_trial: usize,
    pub autoschedule_policy: JudgePolicy,
    pub autoschedule_parallel: usize,
    pub autoschedule_timeout_ms: u64,
    pub autoschedule_log_file: String,
    pub profile_parallel: usize,
    pub profile_timeout_ms: u64,
    pub build_parallel: usize,
    pub build_timeout_ms: u64,
    pub build_log_file: String,
    pub evaluate_log_file: String,
    pub execution_explore_probability: f64,
    pub execution_parallel: usize,
    pub execution_timeout_ms: u64,
    pub synchronize_subgraph: bool,
    pub execution_log_file: String,
}

impl Default for SessionOption {
    fn default() -> Self {
        SessionOption {
            report_profile: false,
            report_iteration: true,
            report_iteration_period: 1,
            autoschedule_trial_ratio: 1.0,
            autoschedule_topk: 10,
            autoschedule_new_trial: 4,
            autoschedule_policy: JudgePolicy::Profile,
            autoschedule_parallel: 1,
            autoschedule_timeout_ms: 10_000,
            autoschedule_log_file: String::new(),
            profile_parallel: 1,
            profile_timeout_ms: 5_000,
            build_parallel: 1,
            build_timeout_ms: 10_000,
            build_log_file: String::new(),
            evaluate_log_file: String::new(),
            execution_explore_probability: 0.0,
            execution_parallel: 1,
            execution_timeout_ms: 10_000,
            synchronize_subgraph: false,
            execution_log_file: String::new(),
        }
    }
}

impl SessionOption {
    pub fn validate(&self) -> Result<()> {
        if self.report_iteration_period == 0 {
            return Err(Error::bad_config("report_iteration_period must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.autoschedule_trial_ratio) {
            return Err(Error::bad_config(
                "autoschedule_trial_ratio must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.execution_explore_probability) {
            return Err(Error::bad_config(
                "execution_explore_probability must be within [0, 1]",
            ));
        }
        if self.autoschedule_topk == 0 || self.autoschedule_new_trial == 0 {
            return Err(Error::bad_config(
                "autoschedule_topk and autoschedule_new_trial must be >= 1",
            ));
        }
        if self.autoschedule_timeout_ms == 0
            || self.profile_timeout_ms == 0
            || self.build_timeout_ms == 0
            || self.execution_timeout_ms == 0
        {
            return Err(Error::bad_config("timeouts must be >= 1 ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Cpu,
}

/// Device the session measures and executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    pub kind: DeviceKind,
    pub dev_id: usize,
}

impl DeviceContext {
    fn for_target(target: &Target, dev_id: usize) -> Result<Self> {
        let kind = match target.name.as_str() {
            "cuda" => DeviceKind::Cuda,
            "llvm" => DeviceKind::Cpu,
            other => {
                return Err(Error::bad_config(format!(
                    "only cuda/llvm targets are supported, got '{other}'"
                )))
            }
        };
        Ok(DeviceContext { kind, dev_id })
    }
}

#[derive(Clone)]
struct PhaseLogs {
    autoschedule: LogStream,
    build: LogStream,
    evaluate: LogStream,
    exec: LogStream,
}

#[derive(Default)]
struct TaskFlags {
    finish: HashMap<TaskId, bool>,
    in_tuning: HashMap<TaskId, bool>,
}

#[derive(Default)]
struct TaskThreads {
    schedule: Option<JoinHandle<()>>,
    build: Option<JoinHandle<()>>,
    evaluate: Option<JoinHandle<()>>,
}

/// State shared between the session and its pipeline threads.
struct Engine {
    target: Target,
    host_target: Target,
    collab: Collaborators,
    auto_scheduler: AutoScheduler,
    builder: FunctionBuilder,
    catalog: Catalog,
    logs: PhaseLogs,
    /// `finish` and `in_tuning` share one mutex; the pipeline loops poll
    /// `finish` through it at every subgraph step.
    flags: Mutex<TaskFlags>,
    cached_all_functions: Mutex<HashSet<TaskId>>,
}

pub struct Session {
    ctx: DeviceContext,
    options: SessionOption,
    engine: Arc<Engine>,
    tasks: Mutex<HashMap<TaskId, Arc<MultiGraph>>>,
    static_call_order: Mutex<HashMap<TaskId, Vec<SubgraphKey>>>,
    persistent_tensors: Mutex<HashMap<TensorId, BufferHandle>>,
    volatile_tensors: Mutex<HashMap<TensorId, BufferHandle>>,
    task_count: AtomicUsize,
    threads: Mutex<HashMap<TaskId, TaskThreads>>,
}

impl Session {
    pub fn new(
        target: Target,
        dev_id: usize,
        options: SessionOption,
        collab: Collaborators,
    ) -> Result<Self> {
        options.validate()?;
        let ctx = DeviceContext::for_target(&target, dev_id)?;

        let logs = PhaseLogs {
            autoschedule: LogStream::open(&options.autoschedule_log_file)?,
            build: LogStream::open(&options.build_log_file)?,
            evaluate: LogStream::open(&options.evaluate_log_file)?,
            exec: LogStream::open(&options.execution_log_file)?,
        };
        let profile_log = LogStream::open(&profile_log_path(&options.autoschedule_log_file))?;

        // A profiled sampling round includes the measurement, so its budget
        // covers both phases.
        let schedule_timeout = options.autoschedule_timeout_ms
            + if options.autoschedule_policy == JudgePolicy::Profile {
                options.profile_timeout_ms
            } else {
                0
            };
        let auto_scheduler = AutoScheduler::new(
            Arc::clone(&collab.space),
            Arc::clone(&collab.judge),
            options.autoschedule_policy,
            options.autoschedule_topk,
            options.autoschedule_new_trial,
            options.autoschedule_parallel,
            schedule_timeout,
            options.report_profile,
            logs.autoschedule.clone(),
            profile_log,
        );
        let builder = FunctionBuilder::new(
            Arc::clone(&collab.codegen),
            options.build_parallel,
            options.build_timeout_ms,
        );

        Ok(Session {
            ctx,
            options,
            engine: Arc::new(Engine {
                target,
                host_target: Target::llvm(),
                collab,
                auto_scheduler,
                builder,
                catalog: Catalog::new(),
                logs,
                flags: Mutex::new(TaskFlags::default()),
                cached_all_functions: Mutex::new(HashSet::new()),
            }),
            tasks: Mutex::new(HashMap::new()),
            static_call_order: Mutex::new(HashMap::new()),
            persistent_tensors: Mutex::new(HashMap::new()),
            volatile_tensors: Mutex::new(HashMap::new()),
            task_count: AtomicUsize::new(0),
            threads: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_context(&self) -> DeviceContext {
        self.ctx
    }

    pub fn auto_scheduler(&self) -> &AutoScheduler {
        &self.engine.auto_scheduler
    }

    pub fn catalog(&self) -> &Catalog {
        &self.engine.catalog
    }

    fn task(&self, task_id: TaskId) -> Result<Arc<MultiGraph>> {
        self.tasks
            .lock()
            .expect("session tasks poisoned")
            .get(&task_id)
            .cloned()
            .ok_or(Error::TaskNotFound { task_id })
    }

    fn is_in_tuning(&self, task_id: TaskId) -> bool {
        self.engine
            .flags
            .lock()
            .expect("session flags poisoned")
            .in_tuning
            .get(&task_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn all_cached(&self, task_id: TaskId) -> bool {
        self.engine.all_cached(task_id)
    }

    /// Binds user buffers to the graph's weights, allocates zeroed gradient
    /// buffers, aliases every update onto its weight (in-place update), and
    /// allocates the loss buffer when present.
    pub fn initialize_weights(
        &self,
        graph: &GraphTensors,
        bindings: Vec<BufferHandle>,
    ) -> Result<()> {
        if graph.weights.len() != bindings.len() {
            return Err(Error::bad_config(format!(
                "initialize weights size mismatch: {} weights, {} bindings",
                graph.weights.len(),
                bindings.len()
            )));
        }
        let device = &self.engine.collab.device;
        let mut persistent = self
            .persistent_tensors
            .lock()
            .expect("persistent tensors poisoned");
        for (meta, buffer) in graph.weights.iter().zip(bindings) {
            persistent.insert(meta.id, buffer);
        }
        for meta in &graph.gradients {
            persistent.insert(meta.id, device.alloc_zeroed(meta)?);
        }
        for (index, update) in graph.updates.iter().enumerate() {
            let weight = graph.weights.get(index).ok_or_else(|| {
                Error::bad_config(format!("update {update} has no matching weight"))
            })?;
            let buffer = persistent
                .get(&weight.id)
                .cloned()
                .ok_or_else(|| Error::missing(format!("weight {} is not bound", weight.id)))?;
            // Update and weight share the device buffer.
            persistent.insert(*update, buffer);
        }
        if let Some(loss) = &graph.loss {
            if !persistent.contains_key(&loss.id) {
                persistent.insert(loss.id, device.alloc_zeroed(loss)?);
            }
        }
        Ok(())
    }

    /// Registers a pre-partitioned multigraph as a task: allocates volatile
    /// output buffers, computes the static call order, returns a fresh id.
    pub fn add_task(&self, graph: MultiGraph) -> Result<TaskId> {
        graph.validate()?;
        {
            let mut volatile = self
                .volatile_tensors
                .lock()
                .expect("volatile tensors poisoned");
            for subgraph in graph.graphs.values() {
                for local in &subgraph.outputs {
                    let tensor = graph.resolve(*local);
                    if !volatile.contains_key(&tensor) {
                        let meta = subgraph.tensor_meta(*local).ok_or_else(|| {
                            Error::bad_config(format!("output {local} has no tensor metadata"))
                        })?;
                        volatile.insert(tensor, self.engine.collab.device.alloc_zeroed(meta)?);
                    }
                }
            }
        }
        let order = graph.static_order()?;
        let task_id = self.task_count.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .expect("session tasks poisoned")
            .insert(task_id, Arc::new(graph));
        self.static_call_order
            .lock()
            .expect("call order poisoned")
            .insert(task_id, order);
        Ok(task_id)
    }

    /// Returns the device buffers currently bound to `keys`.
    pub fn get_data(&self, keys: &[TensorId]) -> Result<Vec<BufferHandle>> {
        let persistent = self
            .persistent_tensors
            .lock()
            .expect("persistent tensors poisoned");
        let volatile = self
            .volatile_tensors
            .lock()
            .expect("volatile tensors poisoned");
        keys.iter()
            .map(|key| {
                persistent
                    .get(key)
                    .or_else(|| volatile.get(key))
                    .cloned()
                    .ok_or_else(|| Error::missing(format!("can't find the array for tensor {key}")))
            })
            .collect()
    }

    /// Drops all queued pending schedules and built functions.
    pub fn clear_autoschedule_context(&self) {
        self.engine.catalog.clear_pending_built();
    }

    /// Seeds built and best functions from a reference file. Subgraphs the
    /// file does not cover share a neighbour's function through the tag
    /// cache. Seeded entries carry sentinel scores until measured.
    pub fn prepare_for_test(&self, task_id: TaskId, reference_path: &Path) -> Result<()> {
        let graph = self.task(task_id)?;
        let engine = &self.engine;
        let records = reference::load_records(reference_path)?;
        let mut cache: HashMap<String, SubgraphKey> = HashMap::new();

        for record in records {
            let subgraph = graph.graphs.get(&record.key).ok_or_else(|| {
                Error::bad_config(format!(
                    "reference file names unknown subgraph {}",
                    record.key
                ))
            })?;
            let result = engine.auto_scheduler.schedule_with_entity(
                record.key,
                subgraph,
                &engine.target,
                record.entity.clone(),
            )?;
            let name = entry_symbol(record.key);
            let module = engine.builder.build_func(
                record.key,
                &result,
                &engine.target,
                &engine.host_target,
                &name,
                &BufferMap::new(),
                &BuildConfig::default(),
            )?;
            let entry = module.entry(&name).ok_or_else(|| Error::BuildFailed {
                key: record.key,
                reason: format!("module has no entry point {name}"),
            })?;
            let built = BuiltFunction {
                result,
                module,
                entry,
            };
            engine.catalog.built(record.key).push(built.clone());
            engine.catalog.best(record.key).replace(ScoredFunction {
                func: built,
                gflops: SEED_SCORE,
                elapsed_ms: SEED_SCORE,
            });
            cache.entry(subgraph.tag.clone()).or_insert(record.key);
        }

        for (key, subgraph) in &graph.graphs {
            if engine.catalog.best(*key).is_empty() {
                let repeat = cache.get(&subgraph.tag).ok_or_else(|| {
                    Error::missing(format!(
                        "reference covers no function for subgraph tag {}",
                        subgraph.tag
                    ))
                })?;
                let scored = engine
                    .catalog
                    .best(*repeat)
                    .peek()
                    .ok_or_else(|| Error::missing(format!("seeded best for {repeat} vanished")))?;
                engine.catalog.best(*key).replace(scored);
            }
        }

        engine.mark_cached(task_id);
        Ok(())
    }

    /// Starts tuning: clears the finish flag, emits the phase banners,
    /// optionally seeds from a reference file, and spawns the three pipeline
    /// threads for this task.
    pub fn begin_tuning(
        &self,
        task_id: TaskId,
        advance_number: usize,
        reference: Option<&Path>,
        first_stage_number: usize,
        second_stage_topk_ratio: f64,
    ) -> Result<()> {
        let graph = self.task(task_id)?;
        let engine = &self.engine;
        engine
            .flags
            .lock()
            .expect("session flags poisoned")
            .finish
            .insert(task_id, false);

        engine.logs.autoschedule.banner("autoschedule");
        engine.logs.build.banner("build");
        engine.logs.evaluate.banner("evaluate");
        engine.logs.exec.banner("execution");

        if let Some(reference) = reference {
            self.prepare_for_test(task_id, reference)?;
        }

        {
            let mut threads = self.threads.lock().expect("session threads poisoned");
            let entry = threads.entry(task_id).or_default();
            if entry.schedule.is_none() {
                let engine = Arc::clone(engine);
                let graph = Arc::clone(&graph);
                entry.schedule = Some(
                    thread::Builder::new()
                        .name(format!("graphtune-schedule-{task_id}"))
                        .spawn(move || {
                            engine.run_autoschedule(
                                task_id,
                                &graph,
                                advance_number,
                                first_stage_number,
                                second_stage_topk_ratio,
                            )
                        })?,
                );
            }
            if entry.build.is_none() {
                let engine = Arc::clone(engine);
                let graph = Arc::clone(&graph);
                entry.build = Some(
                    thread::Builder::new()
                        .name(format!("graphtune-build-{task_id}"))
                        .spawn(move || engine.run_build(task_id, &graph, advance_number))?,
                );
            }
            if entry.evaluate.is_none() {
                let engine = Arc::clone(engine);
                let graph = Arc::clone(&graph);
                entry.evaluate = Some(
                    thread::Builder::new()
                        .name(format!("graphtune-evaluate-{task_id}"))
                        .spawn(move || engine.run_evaluate(task_id, &graph))?,
                );
            }
        }

        engine
            .flags
            .lock()
            .expect("session flags poisoned")
            .in_tuning
            .insert(task_id, true);
        Ok(())
    }

    /// Stops tuning: waits until every subgraph has a best function, raises
    /// the finish flag, and joins the three pipeline threads.
    pub fn end_tuning(&self, task_id: TaskId) -> Result<()> {
        let _ = self.task(task_id)?;
        while !self.engine.all_cached(task_id) {
            thread::yield_now();
        }
        {
            let mut flags = self.engine.flags.lock().expect("session flags poisoned");
            flags.finish.insert(task_id, true);
            flags.in_tuning.remove(&task_id);
        }
        let threads = self
            .threads
            .lock()
            .expect("session threads poisoned")
            .remove(&task_id);
        if let Some(threads) = threads {
            for handle in [threads.schedule, threads.build, threads.evaluate]
                .into_iter()
                .flatten()
            {
                let _ = handle.join();
            }
        }
        Ok(())
    }

    /// Synchronously executes the task over `bindings.len()` iterations.
    pub fn run(
        &self,
        task_id: TaskId,
        bindings: &[HashMap<TensorId, BufferHandle>],
        save_to: &str,
        profile_level: u32,
    ) -> Result<()> {
        let graph = self.task(task_id)?;
        if !self.engine.all_cached(task_id) && !self.is_in_tuning(task_id) {
            return Err(Error::missing(format!(
                "functions of task {task_id} are not ready, but the tuning is stopped"
            )));
        }
        debug!(task_id, iterations = bindings.len(), "advancing task");
        self.run_functions(task_id, &graph, bindings, save_to, profile_level)
    }

    /// Waits for `best[key]` with a bounded retry instead of spinning
    /// forever.
    fn wait_best(&self, key: SubgraphKey) -> Result<ScoredFunction> {
        let queue = self.engine.catalog.best(key);
        for _ in 0..BEST_WAIT_RETRIES {
            if let Some(scored) = queue.peek() {
                return Ok(scored);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(Error::missing(format!(
            "no compiled function became available for subgraph {key}"
        )))
    }

    /// Argument vector for one subgraph in canonical order, drawn from the
    /// iteration bindings, the volatile outputs, and the persistent tensors.
    fn assemble_args(
        &self,
        graph: &MultiGraph,
        subgraph: &Subgraph,
        binding: &HashMap<TensorId, BufferHandle>,
    ) -> Result<Vec<BufferHandle>> {
        let persistent = self
            .persistent_tensors
            .lock()
            .expect("persistent tensors poisoned");
        let volatile = self
            .volatile_tensors
            .lock()
            .expect("volatile tensors poisoned");
        let mut args = Vec::with_capacity(subgraph.tensors.len());

        for local in &subgraph.inputs {
            let tensor = graph.resolve(*local);
            let buffer = binding
                .get(&tensor)
                .or_else(|| volatile.get(&tensor))
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find input {tensor}")))?;
            args.push(buffer);
        }
        for local in &subgraph.labels {
            let tensor = graph.resolve(*local);
            let buffer = binding
                .get(&tensor)
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find label {tensor}")))?;
            args.push(buffer);
        }
        for local in &subgraph.outputs {
            let tensor = graph.resolve(*local);
            let buffer = volatile
                .get(&tensor)
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find output {tensor}")))?;
            args.push(buffer);
        }
        for local in &subgraph.weights {
            let tensor = graph.resolve(*local);
            let buffer = persistent
                .get(&tensor)
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find weight {tensor}")))?;
            args.push(buffer);
        }
        if let Some(local) = subgraph.loss {
            let tensor = graph.resolve(local);
            let buffer = persistent
                .get(&tensor)
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find loss {tensor}")))?;
            args.push(buffer);
        }
        for local in &subgraph.gradients {
            let tensor = graph.resolve(*local);
            let buffer = persistent
                .get(&tensor)
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find gradient {tensor}")))?;
            args.push(buffer);
        }
        if let Some(local) = subgraph.lr {
            let tensor = graph.resolve(local);
            let buffer = binding
                .get(&tensor)
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find lr {tensor}")))?;
            args.push(buffer);
        }
        for local in &subgraph.updates {
            let tensor = graph.resolve(*local);
            let buffer = persistent
                .get(&tensor)
                .cloned()
                .ok_or_else(|| Error::missing(format!("can't find update {tensor}")))?;
            args.push(buffer);
        }
        Ok(args)
    }

    fn run_functions(
        &self,
        task_id: TaskId,
        graph: &MultiGraph,
        bindings: &[HashMap<TensorId, BufferHandle>],
        save_to: &str,
        profile_level: u32,
    ) -> Result<()> {
        let engine = &self.engine;
        let order = self
            .static_call_order
            .lock()
            .expect("call order poisoned")
            .get(&task_id)
            .cloned()
            .ok_or(Error::TaskNotFound { task_id })?;
        let advance_number = bindings.len();

        // The argument vectors do not change while tuning mutates the
        // catalog, so assemble them all up front.
        let mut ad_arrays: Vec<HashMap<SubgraphKey, Vec<BufferHandle>>> =
            Vec::with_capacity(advance_number);
        for binding in bindings {
            let mut arrays = HashMap::with_capacity(order.len());
            for key in &order {
                let subgraph = graph
                    .graphs
                    .get(key)
                    .ok_or(Error::TaskNotFound { task_id })?;
                arrays.insert(*key, self.assemble_args(graph, subgraph, binding)?);
            }
            ad_arrays.push(arrays);
        }

        let mut times: Vec<f64> = Vec::new();
        for (ad, arrays) in ad_arrays.iter().enumerate() {
            if self.options.report_iteration && ad % self.options.report_iteration_period == 0 {
                engine.logs.exec.line(format!("Iteration: {ad}"));
            }
            let begin = Instant::now();

            for key in &order {
                let args = &arrays[key];
                let scored = self.wait_best(*key)?;
                if profile_level >= 2 {
                    let sub_begin = Instant::now();
                    (scored.func.entry)(args).map_err(|_| Error::EvalFailed { key: *key })?;
                    let _ = engine.collab.device.stream_sync();
                    let elapsed = sub_begin.elapsed().as_secs_f64() * 1e3;
                    engine.logs.exec.line(format!(
                        "Subgraph: {key}\n-------------------------------------------------"
                    ));
                    for body in &graph.graphs[key].op_bodies {
                        engine.logs.exec.line(body);
                    }
                    engine.logs.exec.line(format!("Time cost: {elapsed} ms."));
                } else {
                    (scored.func.entry)(args).map_err(|_| Error::EvalFailed { key: *key })?;
                }
                if self.options.synchronize_subgraph {
                    let _ = engine.collab.device.stream_sync();
                }
            }

            if profile_level >= 1 {
                let _ = engine.collab.device.stream_sync();
                let elapsed = begin.elapsed().as_secs_f64() * 1e3;
                times.push(elapsed);
                engine.logs.exec.line(format!("time cost: {elapsed} ms."));
            }
        }

        if profile_level >= 1 && !times.is_empty() {
            let mut sorted = times.clone();
            sorted.sort_by(f64::total_cmp);
            let min = sorted[0];
            let max = sorted[sorted.len() - 1];
            let median = sorted[sorted.len() / 2];
            engine.logs.exec.line(format!(
                "Time report: min=[{min} ms], med=[{median} ms], max=[{max} ms]\n\n"
            ));
        }

        if !save_to.is_empty() {
            let records: Vec<ReferenceRecord> = engine
                .catalog
                .best_snapshot()
                .into_iter()
                .map(|(key, scored)| ReferenceRecord {
                    key,
                    entity: scored.func.result.entity.clone(),
                    gflops: Some(scored.gflops),
                    elapsed_ms: Some(scored.elapsed_ms),
                })
                .collect();
            reference::save_records(save_to, &records)?;
        }

        let _ = engine.collab.device.stream_sync();
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        {
            let mut flags = self.engine.flags.lock().expect("session flags poisoned");
            for finished in flags.finish.values_mut() {
                *finished = true;
            }
        }
        let threads: Vec<TaskThreads> = self
            .threads
            .lock()
            .expect("session threads poisoned")
            .drain()
            .map(|(_, threads)| threads)
            .collect();
        for task in threads {
            for handle in [task.schedule, task.build, task.evaluate]
                .into_iter()
                .flatten()
            {
                let _ = handle.join();
            }
        }
    }
}

fn advance_successors(
    graph: &MultiGraph,
    key: SubgraphKey,
    order: &mut HashMap<SubgraphKey, usize>,
    update_set: &mut HashSet<SubgraphKey>,
) {
    if let Some(attrs) = graph.attrs.get(&key) {
        for succ in &attrs.successors {
            if let Some(count) = order.get_mut(succ) {
                if *count > 0 {
                    *count -= 1;
                    if *count == 0 {
                        update_set.insert(*succ);
                    }
                }
            }
        }
    }
}

fn dag_roots(graph: &MultiGraph) -> (HashMap<SubgraphKey, usize>, HashSet<SubgraphKey>) {
    let mut order = HashMap::new();
    let mut free_set = HashSet::new();
    for (key, attrs) in &graph.attrs {
        order.insert(*key, attrs.num_predecessors);
        if attrs.num_predecessors == 0 {
            free_set.insert(*key);
        }
    }
    (order, free_set)
}

impl Engine {
    fn is_finished(&self, task_id: TaskId) -> bool {
        self.flags
            .lock()
            .expect("session flags poisoned")
            .finish
            .get(&task_id)
            .copied()
            .unwrap_or(false)
    }

    fn all_cached(&self, task_id: TaskId) -> bool {
        self.cached_all_functions
            .lock()
            .expect("session cache flags poisoned")
            .contains(&task_id)
    }

    fn mark_cached(&self, task_id: TaskId) {
        self.cached_all_functions
            .lock()
            .expect("session cache flags poisoned")
            .insert(task_id);
    }

    /// One sampling round plus build submission for `key`, feeding
    /// `pending[key]`.
    fn schedule_subgraph(&self, key: SubgraphKey, subgraph: &Subgraph) -> Result<()> {
        let handle =
            self.auto_scheduler
                .schedule_for(key, subgraph, &self.target, Priority::Normal)?;
        let result = handle.join()??;
        let (result, module_handle) = self.builder.build_for(
            &result,
            &self.target,
            &self.host_target,
            &entry_symbol(key),
            &BufferMap::new(),
            &BuildConfig::default(),
            Priority::Normal,
        )?;
        if !self.catalog.pending(key).push((result, module_handle)) {
            self.logs.autoschedule.line("Too many schedules to do...");
            warn!(key = key.0, "too many schedules for subgraph, dropping");
        }
        Ok(())
    }

    /// Rescues one key from the emergency schedule queue: reschedule and
    /// rebuild at emergency priority. The key is popped only once the
    /// schedule succeeds; failures leave it queued for the next attempt.
    fn drain_emergency_schedule(&self, graph: &MultiGraph) {
        let Some(key) = self.catalog.emergency_schedule.peek() else {
            return;
        };
        let Some(subgraph) = graph.graphs.get(&key) else {
            self.catalog.emergency_schedule.pop();
            return;
        };
        self.logs
            .autoschedule
            .line(format!("Waiting for emergency schedule for {key}..."));
        let rescued = self
            .auto_scheduler
            .schedule_for(key, subgraph, &self.target, Priority::Emergency)
            .and_then(|handle| Ok(handle.join()??));
        match rescued {
            Ok(result) => {
                self.catalog.emergency_schedule.pop();
                self.logs
                    .autoschedule
                    .line(format!("Get emergency schedule for {key}!"));
                match self.builder.build_for(
                    &result,
                    &self.target,
                    &self.host_target,
                    &entry_symbol(key),
                    &BufferMap::new(),
                    &BuildConfig::default(),
                    Priority::Emergency,
                ) {
                    Ok(pending) => {
                        self.catalog.pending(key).push(pending);
                        self.catalog.emergency_build.push(key);
                    }
                    Err(err) => self
                        .logs
                        .autoschedule
                        .line(format!("Can't get schedule for emergency: {err}")),
                }
            }
            Err(err) => self
                .logs
                .autoschedule
                .line(format!("Can't get schedule for emergency: {err}")),
        }
    }

    fn run_autoschedule(
        &self,
        task_id: TaskId,
        graph: &MultiGraph,
        advance_number: usize,
        first_stage_number: usize,
        second_stage_topk_ratio: f64,
    ) {
        let num_subgraphs = graph.len();
        let second_stage_topk = ((num_subgraphs as f64) * second_stage_topk_ratio).ceil() as usize;

        for ad in 0..advance_number {
            self.logs
                .autoschedule
                .line(format!("Schedule iteration {ad}"));
            let mut scheduled_tags: HashSet<String> = HashSet::new();
            let in_first_stage = ad < first_stage_number
                || !self.all_cached(task_id)
                || rand::thread_rng().gen::<f64>() < FIRST_STAGE_FALLBACK_PROBABILITY;
            self.logs
                .autoschedule
                .line(format!("In first stage {in_first_stage}"));

            let (mut order, mut free_set) = if in_first_stage {
                dag_roots(graph)
            } else {
                // Revisit only the slowest subgraphs.
                let mut by_time: Vec<(f64, SubgraphKey)> = graph
                    .graphs
                    .keys()
                    .filter_map(|key| {
                        self.catalog
                            .best(*key)
                            .peek()
                            .map(|scored| (scored.elapsed_ms, *key))
                    })
                    .collect();
                by_time.sort_by(|a, b| b.0.total_cmp(&a.0));
                let free_set = by_time
                    .into_iter()
                    .take(second_stage_topk)
                    .map(|(_, key)| key)
                    .collect();
                (HashMap::new(), free_set)
            };

            let mut schedule_count = 0usize;
            while !free_set.is_empty() {
                let mut update_set: HashSet<SubgraphKey> = HashSet::new();
                let mut delete_set: HashSet<SubgraphKey> = HashSet::new();

                for key in free_set.iter().copied() {
                    if self.is_finished(task_id) {
                        return;
                    }
                    self.drain_emergency_schedule(graph);

                    let Some(subgraph) = graph.graphs.get(&key) else {
                        delete_set.insert(key);
                        continue;
                    };
                    if scheduled_tags.contains(&subgraph.tag) {
                        delete_set.insert(key);
                        if in_first_stage {
                            advance_successors(graph, key, &mut order, &mut update_set);
                        }
                        schedule_count += 1;
                        continue;
                    }

                    match self.schedule_subgraph(key, subgraph) {
                        Ok(()) => {
                            delete_set.insert(key);
                            if in_first_stage {
                                advance_successors(graph, key, &mut order, &mut update_set);
                            }
                            schedule_count += 1;
                            scheduled_tags.insert(subgraph.tag.clone());
                        }
                        Err(err) => {
                            // Stays in the free set; retried on the next wave.
                            self.logs
                                .autoschedule
                                .line(format!("Can't get schedule: {err}"));
                            thread::yield_now();
                        }
                    }
                }

                for key in &delete_set {
                    free_set.remove(key);
                }
                free_set.extend(update_set);
            }
            self.logs.autoschedule.line(format!(
                "Schedule {schedule_count} subgraphs out of {num_subgraphs}"
            ));
        }

        // All iterations submitted; keep rescuing until the task finishes.
        while !self.is_finished(task_id) {
            self.drain_emergency_schedule(graph);
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Awaits a pending module and resolves its entry point.
    fn finish_build(
        &self,
        key: SubgraphKey,
        pending: crate::catalog::PendingBuild,
    ) -> Result<BuiltFunction> {
        let (result, handle) = pending;
        let module = handle.join()?.map_err(|err| Error::BuildFailed {
            key,
            reason: err.to_string(),
        })?;
        let name = entry_symbol(key);
        let entry = module.entry(&name).ok_or_else(|| Error::BuildFailed {
            key,
            reason: format!("module has no entry point {name}"),
        })?;
        Ok(BuiltFunction {
            result,
            module,
            entry,
        })
    }

    fn drain_emergency_build(&self) {
        let Some(key) = self.catalog.emergency_build.peek() else {
            return;
        };
        let Some(pending) = self.catalog.pending(key).pop() else {
            return;
        };
        self.logs
            .build
            .line(format!("Waiting for emergency build for {key}..."));
        match self.finish_build(key, pending) {
            Ok(built) => {
                self.catalog.emergency_build.pop();
                self.logs
                    .build
                    .line(format!("Get emergency build for {key}!"));
                self.catalog.built(key).push(built);
            }
            Err(err) => {
                // The pending entry is spent either way.
                self.catalog.emergency_build.pop();
                self.logs
                    .build
                    .line(format!("Can't get build for emergency: {err}"));
            }
        }
    }

    fn run_build(&self, task_id: TaskId, graph: &MultiGraph, advance_number: usize) {
        let num_subgraphs = graph.len();
        for ad in 0..advance_number {
            self.logs.build.line(format!("Build iteration {ad}"));
            let allow_missing = self.all_cached(task_id);
            if self.is_finished(task_id) {
                return;
            }

            let mut built_tags: HashSet<String> = HashSet::new();
            let (mut order, mut free_set) = dag_roots(graph);
            let mut build_count = 0usize;

            while !free_set.is_empty() {
                let mut update_set: HashSet<SubgraphKey> = HashSet::new();
                let mut delete_set: HashSet<SubgraphKey> = HashSet::new();

                for key in free_set.iter().copied() {
                    if self.is_finished(task_id) {
                        return;
                    }
                    self.drain_emergency_build();

                    let Some(subgraph) = graph.graphs.get(&key) else {
                        delete_set.insert(key);
                        continue;
                    };
                    if built_tags.contains(&subgraph.tag) {
                        self.logs
                            .build
                            .line(format!("Find repeated function {}.", subgraph.tag));
                        delete_set.insert(key);
                        advance_successors(graph, key, &mut order, &mut update_set);
                        build_count += 1;
                        continue;
                    }

                    if let Some(pending) = self.catalog.pending(key).pop() {
                        match self.finish_build(key, pending) {
                            Ok(built) => {
                                if !self.catalog.built(key).push(built) {
                                    self.logs.build.line("Too many built functions, dropping...");
                                    warn!(
                                        key = key.0,
                                        "too many built functions for subgraph, dropping"
                                    );
                                }
                                delete_set.insert(key);
                                advance_successors(graph, key, &mut order, &mut update_set);
                                build_count += 1;
                                built_tags.insert(subgraph.tag.clone());
                            }
                            Err(err) => {
                                self.logs.build.line(format!("Can't get build: {err}"));
                                if allow_missing {
                                    delete_set.insert(key);
                                    advance_successors(graph, key, &mut order, &mut update_set);
                                }
                            }
                        }
                    } else if allow_missing {
                        delete_set.insert(key);
                        advance_successors(graph, key, &mut order, &mut update_set);
                    }
                    // Otherwise the producer has not caught up yet; the key
                    // stays in the free set.
                }

                let stalled = delete_set.is_empty() && update_set.is_empty();
                for key in &delete_set {
                    free_set.remove(key);
                }
                free_set.extend(update_set);
                if stalled {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            self.logs.build.line(format!(
                "Build {build_count} subgraphs out of {num_subgraphs} subgraphs"
            ));
        }

        while !self.is_finished(task_id) {
            self.drain_emergency_build();
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_subgraph(
        &self,
        graph: &MultiGraph,
        key: SubgraphKey,
        allow_missing: bool,
        eval_cache: &mut HashMap<String, SubgraphKey>,
        order: &mut HashMap<SubgraphKey, usize>,
        update_set: &mut HashSet<SubgraphKey>,
        delete_set: &mut HashSet<SubgraphKey>,
    ) {
        let Some(subgraph) = graph.graphs.get(&key) else {
            delete_set.insert(key);
            return;
        };
        let mut succ = false;
        let mut taken = false;

        if let Some(built) = self.catalog.built(key).pop() {
            taken = true;
            let elapsed = self.collab.device.evaluate_performance(
                &built.module,
                &entry_symbol(key),
                &built.result.tensors,
            );
            self.logs
                .evaluate
                .line(format!("evaluate result for {key} is {elapsed}ms."));

            if elapsed > 0.0 {
                let gflops = subgraph.gflop() / (elapsed / 1e3 + 1e-8);
                self.auto_scheduler
                    .feedback_for(key, subgraph, &built.result, gflops);

                let best = self.catalog.best(key);
                match best.peek() {
                    None => {
                        self.logs
                            .evaluate
                            .line(format!("set best function for {key}: {gflops} GFLOPS."));
                        best.replace(ScoredFunction {
                            func: built,
                            gflops,
                            elapsed_ms: elapsed,
                        });
                    }
                    Some(current) if gflops > current.gflops => {
                        self.logs.evaluate.line(format!(
                            "replace best function for {key}: {gflops} GFLOPS. (original {} GFLOPS)",
                            current.gflops
                        ));
                        best.replace(ScoredFunction {
                            func: built,
                            gflops,
                            elapsed_ms: elapsed,
                        });
                    }
                    Some(_) => {}
                }
                succ = true;
                eval_cache.insert(subgraph.tag.clone(), key);
            } else {
                self.logs
                    .evaluate
                    .line(format!("Can't evaluate function for {key}"));
                if let Some(source) = built.module.source() {
                    self.logs.evaluate.line(format!("Check source:\n{source}"));
                }
                self.auto_scheduler
                    .feedback_for(key, subgraph, &built.result, 0.0);
            }
        }

        // Share a measured neighbour through the tag cache.
        if !succ {
            if let Some(repeat) = eval_cache.get(&subgraph.tag) {
                if let Some(scored) = self.catalog.best(*repeat).peek() {
                    self.catalog.best(key).replace(scored);
                    self.logs.evaluate.line("Push cache function.");
                    succ = true;
                }
            }
        }

        // A function was taken and lost, and nothing is left to run this
        // subgraph with: ask for a priority reschedule.
        if !succ && taken && self.catalog.best(key).is_empty() {
            self.catalog.emergency_schedule.push(key);
        }

        if succ || allow_missing {
            delete_set.insert(key);
            advance_successors(graph, key, order, update_set);
        }
    }

    fn run_evaluate(&self, task_id: TaskId, graph: &MultiGraph) {
        loop {
            let allow_missing = self.all_cached(task_id);
            if self.is_finished(task_id) {
                return;
            }

            let mut eval_cache: HashMap<String, SubgraphKey> = HashMap::new();
            let (mut order, mut free_set) = dag_roots(graph);

            while !free_set.is_empty() {
                if self.is_finished(task_id) {
                    return;
                }
                let mut update_set: HashSet<SubgraphKey> = HashSet::new();
                let mut delete_set: HashSet<SubgraphKey> = HashSet::new();
                for key in free_set.iter().copied() {
                    self.evaluate_subgraph(
                        graph,
                        key,
                        allow_missing,
                        &mut eval_cache,
                        &mut order,
                        &mut update_set,
                        &mut delete_set,
                    );
                }
                let stalled = delete_set.is_empty() && update_set.is_empty();
                for key in &delete_set {
                    free_set.remove(key);
                }
                free_set.extend(update_set);
                if stalled {
                    thread::sleep(Duration::from_millis(1));
                }
            }

            if graph
                .graphs
                .keys()
                .all(|key| !self.catalog.best(*key).is_empty())
            {
                self.mark_cached(task_id);
            }
        }
    }
}
