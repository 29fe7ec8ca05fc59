mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use graphtune::graph::SubgraphKey;
use graphtune::session::SessionOption;
use graphtune::spec::JudgePolicy;
use graphtune_backend_ref::RefBackend;

/// Tuning budget used across the scenarios.
const ADVANCE: usize = 10;

fn tune_once(
    backend: &RefBackend,
    graph: graphtune::graph::MultiGraph,
    options: SessionOption,
) -> Result<(Arc<graphtune::session::Session>, usize)> {
    let session = common::new_session(backend, options);
    let task = session.add_task(graph)?;
    session.begin_tuning(task, ADVANCE, None, 2, 0.5)?;
    session.end_tuning(task)?;
    Ok((session, task))
}

#[test]
fn single_subgraph_tuning_converges_to_a_best_function() -> Result<()> {
    let backend = RefBackend::with_seed(101);
    let graph = common::independent(&["mm"]);
    let (session, task) = tune_once(&backend, graph, common::fast_options())?;

    assert!(session.all_cached(task));
    let best = session
        .catalog()
        .best(SubgraphKey(0))
        .peek()
        .expect("a best function exists after tuning");
    assert!(best.gflops > 0.0, "best function carries a measured score");
    assert!(best.elapsed_ms > 0.0);
    Ok(())
}

#[test]
fn best_functions_only_improve_under_feedback() -> Result<()> {
    let backend = RefBackend::with_seed(103);
    let graph = common::independent(&["mm"]);
    let session = common::new_session(&backend, common::fast_options());
    let task = session.add_task(graph)?;
    session.begin_tuning(task, 30, None, 2, 0.5)?;

    // Sample the best score while tuning is still running; it must never
    // regress.
    let queue = session.catalog().best(SubgraphKey(0));
    let mut last = f64::MIN;
    let mut observed = 0;
    while observed < 20 {
        if let Some(best) = queue.peek() {
            assert!(
                best.gflops >= last,
                "best gflops regressed from {last} to {}",
                best.gflops
            );
            last = best.gflops;
            observed += 1;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    session.end_tuning(task)?;
    Ok(())
}

#[test]
fn failed_evaluations_take_the_emergency_path_and_recover() -> Result<()> {
    let backend = RefBackend::with_seed(107);
    // A feeds B; B's first three measurements fail.
    let graph = common::chain(&["a", "b"]);
    backend.fail_next_evaluations("subgraph_1", 3);

    let (session, task) = tune_once(&backend, graph, common::fast_options())?;
    assert!(session.all_cached(task));
    let best = session
        .catalog()
        .best(SubgraphKey(1))
        .peek()
        .expect("B recovers a best function after the scripted failures");
    assert!(best.gflops > 0.0);
    Ok(())
}

#[test]
fn equal_tags_share_one_function_through_the_tag_cache() -> Result<()> {
    let backend = RefBackend::with_seed(109);
    let graph = common::independent(&["same", "same"]);
    let (session, task) = tune_once(&backend, graph, common::fast_options())?;

    assert!(session.all_cached(task));
    let a = session
        .catalog()
        .best(SubgraphKey(0))
        .peek()
        .expect("best for key 0");
    let b = session
        .catalog()
        .best(SubgraphKey(1))
        .peek()
        .expect("best for key 1");
    assert_eq!(
        a.func.result.entity, b.func.result.entity,
        "both subgraphs hold the same schedule"
    );
    assert_eq!(a.gflops, b.gflops);
    Ok(())
}

#[test]
fn reference_seeding_populates_best_functions_before_the_pipeline() -> Result<()> {
    let backend = RefBackend::with_seed(113);
    let dir = tempfile::tempdir()?;
    let reference = dir.path().join("reference.txt");
    fs::write(
        &reference,
        "0|tile=16;vec=4;unroll=2\n1|tile=8;vec=2;unroll=1\n",
    )?;

    // Keys 2 and 3 repeat the tags of the seeded keys 0 and 1.
    let graph = common::independent(&["a", "b", "a", "b"]);
    let session = common::new_session(&backend, common::fast_options());
    let task = session.add_task(graph)?;
    session.begin_tuning(task, ADVANCE, Some(&reference), 2, 0.5)?;

    // Seeding completes before the pipeline threads produce anything.
    assert!(session.all_cached(task));
    for key in 0..4 {
        assert!(
            !session.catalog().best(SubgraphKey(key)).is_empty(),
            "subgraph {key} is seeded"
        );
    }
    let seeded = session
        .catalog()
        .best(SubgraphKey(2))
        .peek()
        .expect("tag cache covered key 2");
    assert_eq!(seeded.func.result.entity.as_str(), "tile=16;vec=4;unroll=2");

    session.end_tuning(task)?;
    Ok(())
}

#[test]
fn profile_level_one_reports_min_median_max() -> Result<()> {
    let backend = RefBackend::with_seed(127);
    let dir = tempfile::tempdir()?;
    let exec_log = dir.path().join("exec.txt");
    let options = SessionOption {
        execution_log_file: exec_log.display().to_string(),
        ..common::fast_options()
    };

    let graph = common::independent(&["mm"]);
    let (session, task) = tune_once(&backend, graph, options)?;
    let bindings = common::bindings_for(5, &[0]);
    session.run(task, &bindings, "", 1)?;

    let log = fs::read_to_string(&exec_log)?;
    let reports: Vec<&str> = log
        .lines()
        .filter(|line| line.starts_with("Time report:"))
        .collect();
    assert_eq!(reports.len(), 1, "exactly one time report");

    let fields: Vec<f64> = reports[0]
        .split('[')
        .skip(1)
        .map(|chunk| {
            chunk
                .split_whitespace()
                .next()
                .expect("numeric field")
                .parse()
                .expect("parses as f64")
        })
        .collect();
    assert_eq!(fields.len(), 3, "min, median, max");
    let (min, median, max) = (fields[0], fields[1], fields[2]);
    assert!(max >= median && median >= min);
    Ok(())
}

#[test]
fn saved_references_reseed_an_equivalent_session() -> Result<()> {
    let backend = RefBackend::with_seed(131);
    let dir = tempfile::tempdir()?;
    let saved = dir.path().join("best.txt");

    let (session, task) = tune_once(&backend, common::chain(&["a", "b"]), common::fast_options())?;
    let bindings = common::bindings_for(2, &[0]);
    session.run(task, &bindings, &saved.display().to_string(), 0)?;

    let saved_entities: Vec<(SubgraphKey, String)> = graphtune::reference::load_records(&saved)?
        .into_iter()
        .map(|record| (record.key, record.entity.as_str().to_string()))
        .collect();
    assert_eq!(saved_entities.len(), 2);

    // A fresh session seeds byte-equivalent entities from the dump.
    let fresh_backend = RefBackend::with_seed(999);
    let fresh = common::new_session(&fresh_backend, common::fast_options());
    let fresh_task = fresh.add_task(common::chain(&["a", "b"]))?;
    fresh.prepare_for_test(fresh_task, Path::new(&saved))?;
    assert!(fresh.all_cached(fresh_task));
    for (key, entity) in &saved_entities {
        let seeded = fresh
            .catalog()
            .best(*key)
            .peek()
            .expect("seeded best function");
        assert_eq!(seeded.func.result.entity.as_str(), entity);
        assert_eq!(seeded.gflops, -999.0, "seeded scores are sentinels");
    }
    Ok(())
}

#[test]
fn running_an_untuned_task_fails_fast() -> Result<()> {
    let backend = RefBackend::with_seed(137);
    let session = common::new_session(&backend, common::fast_options());
    let task = session.add_task(common::independent(&["mm"]))?;
    let bindings = common::bindings_for(1, &[0]);
    let err = session.run(task, &bindings, "", 0).unwrap_err();
    assert!(matches!(
        err,
        graphtune::Error::MissingFunction { .. }
    ));
    Ok(())
}

#[test]
fn unknown_tasks_are_rejected() {
    let backend = RefBackend::with_seed(139);
    let session = common::new_session(&backend, common::fast_options());
    let err = session.end_tuning(77).unwrap_err();
    // end_tuning busy-waits on the cache flag only for known tasks.
    assert!(matches!(err, graphtune::Error::TaskNotFound { .. }));
}

#[test]
fn bad_policy_free_options_are_rejected() {
    let backend = RefBackend::with_seed(149);
    let options = SessionOption {
        autoschedule_topk: 0,
        ..SessionOption::default()
    };
    let result = graphtune::session::Session::new(
        graphtune::Target::llvm(),
        0,
        options,
        backend.collaborators(),
    );
    assert!(result.is_err());

    let options = SessionOption {
        autoschedule_policy: JudgePolicy::Random,
        execution_explore_probability: 1.5,
        ..SessionOption::default()
    };
    let result = graphtune::session::Session::new(
        graphtune::Target::llvm(),
        0,
        options,
        backend.collaborators(),
    );
    assert!(result.is_err());
}
