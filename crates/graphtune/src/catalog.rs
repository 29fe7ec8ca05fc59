//! The shared catalog of per-subgraph result queues.
//!
//! Three parallel maps keyed by [`SubgraphKey`]: pending schedules waiting
//! on their module handle, built functions waiting for measurement, and the
//! singleton best-known function. The two emergency SPSC key queues live
//! here as well. Each queue carries its own lock; the maps themselves are
//! only locked long enough to clone out the `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::graph::SubgraphKey;
use crate::pool::JobHandle;
use crate::queue::ResultQueue;
use crate::schedule::{BuiltFunction, ScheduleResult, ScoredFunction};
use crate::spec::{BackendResult, Module};

/// A schedule whose module is still being compiled on the build pool.
pub type PendingBuild = (ScheduleResult, JobHandle<BackendResult<Arc<dyn Module>>>);

#[derive(Default)]
pub struct Catalog {
    pending: Mutex<HashMap<SubgraphKey, Arc<ResultQueue<PendingBuild>>>>,
    built: Mutex<HashMap<SubgraphKey, Arc<ResultQueue<BuiltFunction>>>>,
    best: Mutex<HashMap<SubgraphKey, Arc<ResultQueue<ScoredFunction>>>>,
    pub emergency_schedule: ResultQueue<SubgraphKey>,
    pub emergency_build: ResultQueue<SubgraphKey>,
}

fn queue_for<T>(
    map: &Mutex<HashMap<SubgraphKey, Arc<ResultQueue<T>>>>,
    key: SubgraphKey,
) -> Arc<ResultQueue<T>> {
    let mut map = map.lock().expect("catalog map poisoned");
    Arc::clone(map.entry(key).or_default())
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn pending(&self, key: SubgraphKey) -> Arc<ResultQueue<PendingBuild>> {
        queue_for(&self.pending, key)
    }

    pub fn built(&self, key: SubgraphKey) -> Arc<ResultQueue<BuiltFunction>> {
        queue_for(&self.built, key)
    }

    pub fn best(&self, key: SubgraphKey) -> Arc<ResultQueue<ScoredFunction>> {
        queue_for(&self.best, key)
    }

    /// Current best function per subgraph, for the save path.
    pub fn best_snapshot(&self) -> Vec<(SubgraphKey, ScoredFunction)> {
        let queues: Vec<(SubgraphKey, Arc<ResultQueue<ScoredFunction>>)> = {
            let map = self.best.lock().expect("catalog map poisoned");
            map.iter().map(|(k, q)| (*k, Arc::clone(q))).collect()
        };
        let mut snapshot: Vec<(SubgraphKey, ScoredFunction)> = queues
            .into_iter()
            .filter_map(|(key, queue)| queue.peek().map(|func| (key, func)))
            .collect();
        snapshot.sort_by_key(|(key, _)| *key);
        snapshot
    }

    /// Drops every queued pending schedule and built function. Best-known
    /// functions survive.
    pub fn clear_pending_built(&self) {
        self.pending.lock().expect("catalog map poisoned").clear();
        self.built.lock().expect("catalog map poisoned").clear();
    }
}
