mod common;

use std::sync::Arc;

use graphtune::autoschedule::{AutoScheduler, Priority};
use graphtune::graph::SubgraphKey;
use graphtune::logging::LogStream;
use graphtune::schedule::ScheduleEntity;
use graphtune::spec::{JudgePolicy, Target};
use graphtune_backend_ref::RefBackend;

fn scheduler(backend: &RefBackend, policy: JudgePolicy) -> Arc<AutoScheduler> {
    let collab = backend.collaborators();
    Arc::new(AutoScheduler::new(
        collab.space,
        collab.judge,
        policy,
        8,
        4,
        1,
        10_000,
        false,
        LogStream::sink(),
        LogStream::sink(),
    ))
}

#[test]
fn sampling_yields_an_entity_from_the_space() {
    let backend = RefBackend::with_seed(7);
    let scheduler = scheduler(&backend, JudgePolicy::Model);
    let subgraph = common::subgraph("mm", 0, 1);
    let key = SubgraphKey(0);

    let handle = scheduler
        .schedule_for(key, &subgraph, &Target::llvm(), Priority::Normal)
        .expect("submission accepted");
    let result = handle.join().expect("job ran").expect("sampling succeeded");
    assert!(result.entity.as_str().contains("tile="));
    assert_eq!(
        result.schedule.entity.as_ref().map(ScheduleEntity::as_str),
        Some(result.entity.as_str()),
        "the realised schedule carries the winning entity"
    );
    assert_eq!(scheduler.context_counts(key), Some(1));
}

#[test]
fn each_round_increments_the_attempt_counter() {
    let backend = RefBackend::with_seed(11);
    let scheduler = scheduler(&backend, JudgePolicy::Random);
    let subgraph = common::subgraph("mm", 0, 1);
    let key = SubgraphKey(4);

    for expected in 1..=3 {
        let handle = scheduler
            .schedule_for(key, &subgraph, &Target::llvm(), Priority::Normal)
            .expect("submission accepted");
        handle.join().expect("job ran").expect("sampling succeeded");
        assert_eq!(scheduler.context_counts(key), Some(expected));
    }
}

#[test]
fn positive_feedback_fills_the_topk_heap() {
    let backend = RefBackend::with_seed(13);
    let scheduler = scheduler(&backend, JudgePolicy::Model);
    let subgraph = common::subgraph("mm", 0, 1);
    let key = SubgraphKey(1);

    let result = scheduler
        .schedule_with_entity(
            key,
            &subgraph,
            &Target::llvm(),
            ScheduleEntity::new("tile=16;vec=4;unroll=2").unwrap(),
        )
        .expect("deterministic realisation");

    scheduler.feedback_for(key, &subgraph, &result, 10.0);
    assert_eq!(scheduler.context_topk_len(key), Some(1));

    // Failures never enter the heap.
    scheduler.feedback_for(key, &subgraph, &result, 0.0);
    assert_eq!(scheduler.context_topk_len(key), Some(1));
}

#[test]
fn schedule_with_entity_is_deterministic() {
    let backend = RefBackend::with_seed(17);
    let scheduler = scheduler(&backend, JudgePolicy::Model);
    let subgraph = common::subgraph("mm", 0, 1);
    let entity = ScheduleEntity::new("tile=8;vec=2;unroll=1").unwrap();

    let a = scheduler
        .schedule_with_entity(SubgraphKey(2), &subgraph, &Target::llvm(), entity.clone())
        .expect("realisation");
    let b = scheduler
        .schedule_with_entity(SubgraphKey(2), &subgraph, &Target::llvm(), entity.clone())
        .expect("realisation");
    assert_eq!(a.entity, entity);
    assert_eq!(a.entity, b.entity);
}

#[test]
fn scripted_sampling_failures_surface_as_schedule_errors() {
    let backend = RefBackend::with_seed(19);
    let scheduler = scheduler(&backend, JudgePolicy::Random);
    let subgraph = common::subgraph("mm", 0, 1);
    backend.fail_next_schedules("mm", 1);

    let handle = scheduler
        .schedule_for(SubgraphKey(3), &subgraph, &Target::llvm(), Priority::Normal)
        .expect("submission accepted");
    assert!(handle.join().expect("job ran").is_err());

    // The script is spent; the next round succeeds.
    let handle = scheduler
        .schedule_for(SubgraphKey(3), &subgraph, &Target::llvm(), Priority::Normal)
        .expect("submission accepted");
    assert!(handle.join().expect("job ran").is_ok());
}
