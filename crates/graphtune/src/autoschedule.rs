//! The schedule-space sampler.
//!
//! One [`AutoScheduleContext`] per subgraph remembers the k best measured
//! schedules (a capped min-heap used as the seed pool), every entity it has
//! ever met, and how many rounds it has run. Sampling rounds execute on the
//! scheduler's worker pool; measurement feedback arrives from the evaluate
//! loop through [`AutoScheduler::feedback_for`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{Subgraph, SubgraphKey, TensorMeta};
use crate::logging::LogStream;
use crate::pool::{JobHandle, WorkerPool};
use crate::schedule::{EvaluatedSchedule, Schedule, ScheduleEntity, ScheduleResult};
use crate::spec::{Judge, JudgePolicy, ScheduleSpace, Target};

/// Rounds before seeded sampling switches on; until then every candidate is
/// drawn uniformly from the space.
const WARM_UP_TRIALS: u64 = 20;

/// Seeds are taken with this probability once warmed up.
const SEED_PROBABILITY: f64 = 0.7;

/// `knowing_schedules` rotates into `known_schedules` past this size.
const KNOWING_ROTATE_LIMIT: usize = 500;

/// Per-subgraph search memory.
pub struct AutoScheduleContext {
    pub key: SubgraphKey,
    pub target: Target,
    topk: usize,
    topk_schedules: BinaryHeap<Reverse<EvaluatedSchedule>>,
    known_schedules: HashSet<ScheduleEntity>,
    knowing_schedules: HashSet<ScheduleEntity>,
    counts: u64,
}

impl AutoScheduleContext {
    fn new(key: SubgraphKey, target: Target, topk: usize) -> Self {
        AutoScheduleContext {
            key,
            target,
            topk: topk.max(1),
            topk_schedules: BinaryHeap::new(),
            known_schedules: HashSet::new(),
            knowing_schedules: HashSet::new(),
            counts: 0,
        }
    }

    fn is_known(&self, entity: &ScheduleEntity) -> bool {
        self.known_schedules.contains(entity) || self.knowing_schedules.contains(entity)
    }

    /// Records one measurement. Positive scores compete for the top-k heap;
    /// every entity lands in the known sets so novelty checks see it.
    pub fn add_feedback(&mut self, result: ScheduleResult, evaluation: f64) {
        if evaluation > 0.0 {
            let evaluated = EvaluatedSchedule {
                result: result.clone(),
                score: evaluation,
            };
            if self.topk_schedules.len() < self.topk {
                self.topk_schedules.push(Reverse(evaluated));
            } else if let Some(Reverse(worst)) = self.topk_schedules.peek() {
                if evaluated.score > worst.score {
                    self.topk_schedules.pop();
                    self.topk_schedules.push(Reverse(evaluated));
                }
            }
        }

        self.knowing_schedules.insert(result.entity);
        if self.knowing_schedules.len() > KNOWING_ROTATE_LIMIT {
            self.known_schedules = std::mem::take(&mut self.knowing_schedules);
        }
    }

    pub fn counts(&self) -> u64 {
        self.counts
    }

    pub fn topk_len(&self) -> usize {
        self.topk_schedules.len()
    }

    pub fn best_score(&self) -> Option<f64> {
        self.topk_schedules
            .iter()
            .map(|Reverse(e)| e.score)
            .max_by(f64::total_cmp)
    }

    /// Drains the heap worst-first, hands the ranking to `f`, then restores
    /// the heap. The seed pool is persistent state, not a one-shot.
    fn with_ranked<R>(&mut self, f: impl FnOnce(&[EvaluatedSchedule]) -> R) -> R {
        let mut ranked = Vec::with_capacity(self.topk_schedules.len());
        while let Some(Reverse(entry)) = self.topk_schedules.pop() {
            ranked.push(entry);
        }
        let out = f(&ranked);
        for entry in ranked {
            self.topk_schedules.push(Reverse(entry));
        }
        out
    }
}

/// Submission priority for sampling and build jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Emergency,
}

/// Scheduler state shared with the sampling jobs on the worker pool.
struct SchedulerShared {
    space: Arc<dyn ScheduleSpace>,
    judge: Arc<dyn Judge>,
    policy: JudgePolicy,
    topk: usize,
    new_trial: usize,
    report_profile: bool,
    contexts: Mutex<HashMap<SubgraphKey, Arc<Mutex<AutoScheduleContext>>>>,
    log: LogStream,
    profile_log: LogStream,
}

pub struct AutoScheduler {
    shared: Arc<SchedulerShared>,
    pool: WorkerPool,
}

impl AutoScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        space: Arc<dyn ScheduleSpace>,
        judge: Arc<dyn Judge>,
        policy: JudgePolicy,
        topk: usize,
        new_trial: usize,
        parallel: usize,
        timeout_ms: u64,
        report_profile: bool,
        log: LogStream,
        profile_log: LogStream,
    ) -> Self {
        AutoScheduler {
            shared: Arc::new(SchedulerShared {
                space,
                judge,
                policy,
                topk: topk.max(1),
                new_trial: new_trial.max(1),
                report_profile,
                contexts: Mutex::new(HashMap::new()),
                log,
                profile_log,
            }),
            pool: WorkerPool::new(parallel, timeout_ms),
        }
    }

    /// Submits one sampling round for `key` to the worker pool.
    pub fn schedule_for(
        &self,
        key: SubgraphKey,
        subgraph: &Subgraph,
        target: &Target,
        priority: Priority,
    ) -> Result<JobHandle<Result<ScheduleResult>>> {
        let shared = Arc::clone(&self.shared);
        let subgraph = subgraph.clone();
        let target = target.clone();
        let job = move || shared.schedule_func(key, &subgraph, &target);
        let handle = match priority {
            Priority::Normal => self.pool.push_back(job)?,
            Priority::Emergency => self.pool.push_front(job)?,
        };
        Ok(handle)
    }

    /// Deterministic realisation of a known entity (the reference-seeding
    /// path). Touches the context so later feedback finds it, but records no
    /// attempt.
    pub fn schedule_with_entity(
        &self,
        key: SubgraphKey,
        subgraph: &Subgraph,
        target: &Target,
        entity: ScheduleEntity,
    ) -> Result<ScheduleResult> {
        let _ctx = self.shared.context(key, target);
        let tensors: Arc<[TensorMeta]> = subgraph.tensors.clone().into();
        let mut schedule = Schedule::empty(subgraph);
        self.shared
            .space
            .interpret(&mut schedule, &tensors, subgraph, target, &entity)
            .map_err(|err| Error::ScheduleFailed {
                key,
                reason: err.to_string(),
            })?;
        Ok(ScheduleResult {
            schedule: Arc::new(schedule),
            tensors,
            entity,
        })
    }

    /// Measurement feedback from the evaluate loop. Updates the context and
    /// appends one JSON feature record to the profile log.
    pub fn feedback_for(
        &self,
        key: SubgraphKey,
        subgraph: &Subgraph,
        result: &ScheduleResult,
        evaluation: f64,
    ) {
        self.shared.feedback_for(key, subgraph, result, evaluation);
    }

    pub fn context_counts(&self, key: SubgraphKey) -> Option<u64> {
        self.shared
            .existing_context(key)
            .map(|ctx| ctx.lock().expect("schedule context poisoned").counts())
    }

    pub fn context_topk_len(&self, key: SubgraphKey) -> Option<usize> {
        self.shared
            .existing_context(key)
            .map(|ctx| ctx.lock().expect("schedule context poisoned").topk_len())
    }
}

impl SchedulerShared {
    fn context(&self, key: SubgraphKey, target: &Target) -> Arc<Mutex<AutoScheduleContext>> {
        let mut contexts = self.contexts.lock().expect("scheduler contexts poisoned");
        Arc::clone(contexts.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(AutoScheduleContext::new(
                key,
                target.clone(),
                self.topk,
            )))
        }))
    }

    fn existing_context(&self, key: SubgraphKey) -> Option<Arc<Mutex<AutoScheduleContext>>> {
        self.contexts
            .lock()
            .expect("scheduler contexts poisoned")
            .get(&key)
            .cloned()
    }

    /// One full sampling round: rank the seed pool, draw candidates, realise
    /// and judge them, return the argmax.
    fn schedule_func(
        &self,
        key: SubgraphKey,
        subgraph: &Subgraph,
        target: &Target,
    ) -> Result<ScheduleResult> {
        let ctx = self.context(key, target);
        let mut ctx = ctx.lock().expect("schedule context poisoned");
        let mut rng = rand::thread_rng();

        // Rank the seed pool worst to best and compute per-seed acceptance
        // probabilities relative to the current best score.
        let (ranked, probabilities) = ctx.with_ranked(|ranked| {
            let best = ranked.last().map(|e| e.score).unwrap_or(0.0);
            let upper = SEED_PROBABILITY * ranked.len() as f64 / self.topk as f64;
            let probabilities: Vec<f64> = ranked
                .iter()
                .map(|e| (e.score - best).exp() * upper)
                .collect();
            (ranked.to_vec(), probabilities)
        });

        let warmed_up = ctx.counts() > WARM_UP_TRIALS;
        let mut candidates: Vec<ScheduleEntity> = Vec::new();
        let mut must_new = true;
        while candidates.is_empty() {
            for _ in 0..self.new_trial {
                let mut seed = None;
                if warmed_up && rng.gen::<f64>() < SEED_PROBABILITY {
                    // Scan best-first; each seed is accepted with its own
                    // probability.
                    for j in (0..ranked.len()).rev() {
                        if rng.gen::<f64>() < probabilities[j] {
                            seed = Some(&ranked[j]);
                            break;
                        }
                    }
                }
                let chosen = match seed {
                    Some(seed) => self.space.choose_one_near(subgraph, &seed.result.entity),
                    None => self.space.choose_one(subgraph),
                };
                let entity = chosen.map_err(|err| Error::ScheduleFailed {
                    key,
                    reason: err.to_string(),
                })?;
                if !must_new || !ctx.is_known(&entity) {
                    candidates.push(entity);
                }
            }
            // The second and later rounds relax the novelty requirement.
            must_new = false;
        }

        let tensors: Arc<[TensorMeta]> = subgraph.tensors.clone().into();
        let mut schedules = Vec::with_capacity(candidates.len());
        for entity in &candidates {
            let mut schedule = Schedule::empty(subgraph);
            self.space
                .interpret(&mut schedule, &tensors, subgraph, target, entity)
                .map_err(|err| Error::ScheduleFailed {
                    key,
                    reason: err.to_string(),
                })?;
            schedules.push(schedule);
        }

        let scores =
            self.judge_schedules(key, &schedules, &tensors, target, subgraph.gflop(), &mut rng)?;

        if self.report_profile {
            let rendered: Vec<String> = scores.iter().map(|v| format!("{v}")).collect();
            self.log
                .line(format!("check judge values:\n{}", rendered.join(" ")));
        }

        let mut best_index = 0;
        for (index, score) in scores.iter().enumerate() {
            if *score > scores[best_index] {
                best_index = index;
            }
        }

        if self.policy == JudgePolicy::Profile {
            // Profiled scores are real measurements; remember every one.
            for (schedule, (entity, score)) in schedules
                .iter()
                .zip(candidates.iter().zip(scores.iter()))
            {
                let result = ScheduleResult {
                    schedule: Arc::new(schedule.clone()),
                    tensors: Arc::clone(&tensors),
                    entity: entity.clone(),
                };
                ctx.add_feedback(result, *score);
            }
        }

        let schedule = schedules.swap_remove(best_index);
        let entity = candidates.swap_remove(best_index);
        debug!(key = key.0, entity = %entity, "sampled schedule");
        ctx.counts += 1;

        Ok(ScheduleResult {
            schedule: Arc::new(schedule),
            tensors,
            entity,
        })
    }

    fn judge_schedules(
        &self,
        key: SubgraphKey,
        schedules: &[Schedule],
        tensors: &[TensorMeta],
        target: &Target,
        gflop: f64,
        rng: &mut impl Rng,
    ) -> Result<Vec<f64>> {
        match self.policy {
            JudgePolicy::Random => Ok((0..schedules.len()).map(|_| rng.gen::<f64>()).collect()),
            JudgePolicy::Profile | JudgePolicy::Model => self
                .judge
                .judge(schedules, tensors, target, gflop, self.policy)
                .map_err(|err| Error::ScheduleFailed {
                    key,
                    reason: err.to_string(),
                }),
        }
    }

    fn feedback_for(
        &self,
        key: SubgraphKey,
        subgraph: &Subgraph,
        result: &ScheduleResult,
        evaluation: f64,
    ) {
        let ctx = self.context(key, &Target::llvm());
        let target = {
            let mut ctx = ctx.lock().expect("schedule context poisoned");
            ctx.add_feedback(result.clone(), evaluation);
            ctx.target.clone()
        };

        let features = self
            .judge
            .feature(&result.schedule, &result.tensors, &target);
        let loop_nests: Vec<f64> = features
            .iter()
            .filter_map(|nest| nest.last().copied())
            .collect();
        let record = json!({
            "gflop": subgraph.gflop(),
            "loop_nests": loop_nests,
            "features": features,
            "schedules": result.entity.as_str(),
            "evaluation": evaluation,
        });
        self.profile_log.line(record.to_string());
    }
}
