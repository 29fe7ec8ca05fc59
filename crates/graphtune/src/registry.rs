//! Process-wide session registry.
//!
//! Sessions live behind a single shared pointer in one concurrent map;
//! every public free function resolves its session id here first. Ids are
//! monotonic and never reused.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::graph::{GraphTensors, MultiGraph, TensorId};
use crate::session::{Session, SessionOption, TaskId};
use crate::spec::{BufferHandle, Collaborators, Target};

struct SessionRegistry {
    sessions: HashMap<usize, Arc<Session>>,
    next_id: usize,
}

static REGISTRY: OnceLock<Mutex<SessionRegistry>> = OnceLock::new();

fn registry() -> &'static Mutex<SessionRegistry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(SessionRegistry {
            sessions: HashMap::new(),
            next_id: 0,
        })
    })
}

/// Creates a session and returns its id.
pub fn create_session(
    target: Target,
    dev_id: usize,
    options: SessionOption,
    collab: Collaborators,
) -> Result<usize> {
    let session = Arc::new(Session::new(target, dev_id, options, collab)?);
    let mut registry = registry().lock().expect("session registry poisoned");
    let session_id = registry.next_id;
    registry.next_id += 1;
    registry.sessions.insert(session_id, session);
    Ok(session_id)
}

pub fn get_session(session_id: usize) -> Result<Arc<Session>> {
    registry()
        .lock()
        .expect("session registry poisoned")
        .sessions
        .get(&session_id)
        .cloned()
        .ok_or(Error::SessionNotFound { session_id })
}

pub fn delete_session(session_id: usize) -> Result<()> {
    registry()
        .lock()
        .expect("session registry poisoned")
        .sessions
        .remove(&session_id)
        .map(|_| ())
        .ok_or(Error::SessionNotFound { session_id })
}

pub fn initialize_weights(
    session_id: usize,
    graph: &GraphTensors,
    bindings: Vec<BufferHandle>,
) -> Result<()> {
    get_session(session_id)?.initialize_weights(graph, bindings)
}

pub fn add_task(session_id: usize, graph: MultiGraph) -> Result<TaskId> {
    get_session(session_id)?.add_task(graph)
}

pub fn begin_tuning(
    session_id: usize,
    task_id: TaskId,
    advance_number: usize,
    reference: Option<&Path>,
    first_stage_number: usize,
    second_stage_topk_ratio: f64,
) -> Result<()> {
    get_session(session_id)?.begin_tuning(
        task_id,
        advance_number,
        reference,
        first_stage_number,
        second_stage_topk_ratio,
    )
}

pub fn end_tuning(session_id: usize, task_id: TaskId) -> Result<()> {
    get_session(session_id)?.end_tuning(task_id)
}

pub fn run_task(
    session_id: usize,
    task_id: TaskId,
    bindings: &[HashMap<TensorId, BufferHandle>],
    save_to: &str,
    profile_level: u32,
) -> Result<()> {
    get_session(session_id)?.run(task_id, bindings, save_to, profile_level)
}

pub fn test_schedule_reference(session_id: usize, task_id: TaskId, reference: &Path) -> Result<()> {
    get_session(session_id)?.prepare_for_test(task_id, reference)
}
