//! Bounded worker pool with a dual-ended job deque.
//!
//! Jobs enqueued with [`WorkerPool::push_back`] run at normal priority;
//! [`WorkerPool::push_front`] jumps the queue for emergency reschedules.
//! Every job runs under a wall-clock cap: the worker parks the job on its own
//! OS thread, waits up to the cap, and on expiry resolves the handle to
//! [`PoolError::Timeout`], flips the job's cancellation token, and abandons
//! the thread. Abandoned jobs keep running to completion but their results
//! are discarded (first write into the handle wins), so a stuck compile or
//! measurement never corrupts the workers themselves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("job exceeded its {0} ms wall-clock budget")]
    Timeout(u64),

    #[error("submission raced with pool shutdown")]
    Shutdown,

    #[error("failed to spawn job thread: {0}")]
    Spawn(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

struct Slot<T> {
    value: Mutex<Option<PoolResult<T>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// First write wins; later writes (an abandoned job finishing after its
    /// timeout was recorded) are dropped.
    fn fulfill(&self, result: PoolResult<T>) {
        let mut guard = self.value.lock().expect("job slot poisoned");
        if guard.is_none() {
            *guard = Some(result);
            self.ready.notify_all();
        }
    }

    fn wait_filled(&self, cap: Option<Duration>) -> bool {
        let mut guard = self.value.lock().expect("job slot poisoned");
        match cap {
            Some(cap) => {
                let deadline = std::time::Instant::now() + cap;
                while guard.is_none() {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, timeout) = self
                        .ready
                        .wait_timeout(guard, deadline - now)
                        .expect("job slot poisoned");
                    guard = next;
                    if timeout.timed_out() && guard.is_none() {
                        return false;
                    }
                }
                true
            }
            None => {
                while guard.is_none() {
                    guard = self.ready.wait(guard).expect("job slot poisoned");
                }
                true
            }
        }
    }

    fn take(&self) -> Option<PoolResult<T>> {
        self.value.lock().expect("job slot poisoned").take()
    }
}

/// Awaitable result of a submitted job.
pub struct JobHandle<T> {
    slot: Arc<Slot<T>>,
    cancel: Arc<AtomicBool>,
}

impl<T> JobHandle<T> {
    /// Blocks until the job completes, fails, or times out.
    pub fn join(self) -> PoolResult<T> {
        self.slot.wait_filled(None);
        self.slot.take().expect("job slot resolved empty")
    }

    /// True once the handle would no longer block.
    pub fn is_ready(&self) -> bool {
        self.slot
            .value
            .lock()
            .expect("job slot poisoned")
            .is_some()
    }

    /// Token the job may poll to stop early after a timeout.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    jobs: VecDeque<Job>,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    timeout: Duration,
}

/// Fixed-size worker pool over a double-ended job deque.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// `workers == 0` falls back to the hardware parallelism.
    pub fn new(workers: usize, timeout_ms: u64) -> Self {
        let workers = if workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            workers
        };
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
            timeout: Duration::from_millis(timeout_ms.max(1)),
        });

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("graphtune-worker-{index}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn pool worker");
            handles.push(handle);
        }

        WorkerPool {
            shared,
            workers: Mutex::new(handles),
        }
    }

    pub fn with_default_timeout(workers: usize) -> Self {
        WorkerPool::new(workers, DEFAULT_JOB_TIMEOUT_MS)
    }

    /// Enqueues at the tail (normal priority).
    pub fn push_back<T, F>(&self, job: F) -> PoolResult<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(job, false)
    }

    /// Enqueues at the head (emergency priority).
    pub fn push_front<T, F>(&self, job: F) -> PoolResult<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(job, true)
    }

    fn submit<T, F>(&self, job: F, front: bool) -> PoolResult<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = Arc::new(Slot::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = JobHandle {
            slot: Arc::clone(&slot),
            cancel: Arc::clone(&cancel),
        };
        let timeout = self.shared.timeout;

        let wrapped: Job = Box::new(move || {
            let job_slot = Arc::clone(&slot);
            let job_cancel = Arc::clone(&cancel);
            let spawned = thread::Builder::new()
                .name("graphtune-job".to_string())
                .spawn(move || {
                    if job_cancel.load(Ordering::Relaxed) {
                        return;
                    }
                    let value = job();
                    job_slot.fulfill(Ok(value));
                });
            match spawned {
                Ok(_detached) => {
                    if !slot.wait_filled(Some(timeout)) {
                        cancel.store(true, Ordering::Relaxed);
                        slot.fulfill(Err(PoolError::Timeout(timeout.as_millis() as u64)));
                    }
                }
                Err(err) => slot.fulfill(Err(PoolError::Spawn(err.to_string()))),
            }
        });

        let mut state = self.shared.state.lock().expect("pool state poisoned");
        if state.stop {
            return Err(PoolError::Shutdown);
        }
        if front {
            state.jobs.push_front(wrapped);
        } else {
            state.jobs.push_back(wrapped);
        }
        drop(state);
        self.shared.available.notify_one();
        Ok(handle)
    }
}

impl WorkerPool {
    /// Signals every worker and joins them. Queued jobs still run;
    /// submissions racing with the shutdown fail with
    /// [`PoolError::Shutdown`].
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("pool state poisoned");
            state.stop = true;
        }
        self.shared.available.notify_all();
        let mut workers = self.workers.lock().expect("pool workers poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock().expect("pool state poisoned");
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.stop {
                    return;
                }
                state = shared
                    .available
                    .wait(state)
                    .expect("pool state poisoned");
            }
        };
        job();
    }
}
