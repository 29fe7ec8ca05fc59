use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use graphtune::pool::{PoolError, WorkerPool};

#[test]
fn jobs_resolve_to_their_return_value() {
    let pool = WorkerPool::new(2, 1_000);
    let handle = pool.push_back(|| 40 + 2).expect("submission accepted");
    assert_eq!(handle.join(), Ok(42));
}

#[test]
fn push_front_jumps_the_queue() {
    let pool = WorkerPool::new(1, 5_000);
    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy the single worker so the next two submissions queue up.
    let blocker = pool
        .push_back(|| thread::sleep(Duration::from_millis(100)))
        .expect("submission accepted");

    let order_back = Arc::clone(&order);
    let back = pool
        .push_back(move || order_back.lock().unwrap().push("back"))
        .expect("submission accepted");
    let order_front = Arc::clone(&order);
    let front = pool
        .push_front(move || order_front.lock().unwrap().push("front"))
        .expect("submission accepted");

    blocker.join().expect("blocker finished");
    front.join().expect("front finished");
    back.join().expect("back finished");
    assert_eq!(*order.lock().unwrap(), vec!["front", "back"]);
}

#[test]
fn overlong_jobs_resolve_to_timeout_and_the_pool_survives() {
    let pool = WorkerPool::new(1, 100);
    let handle = pool
        .push_back(|| {
            thread::sleep(Duration::from_millis(400));
            7
        })
        .expect("submission accepted");
    assert_eq!(handle.join(), Err(PoolError::Timeout(100)));

    // The worker is free again for fast jobs.
    let handle = pool.push_back(|| 7).expect("submission accepted");
    assert_eq!(handle.join(), Ok(7));
}

#[test]
fn submissions_after_shutdown_fail() {
    let pool = WorkerPool::new(2, 1_000);
    let handle = pool.push_back(|| 1).expect("submission accepted");
    assert_eq!(handle.join(), Ok(1));

    pool.shutdown();
    let err = pool.push_back(|| 2).map(|_| ()).unwrap_err();
    assert_eq!(err, PoolError::Shutdown);
}

#[test]
fn queued_jobs_still_run_during_shutdown() {
    let pool = WorkerPool::new(1, 5_000);
    let handles: Vec<_> = (0..8)
        .map(|i| pool.push_back(move || i).expect("submission accepted"))
        .collect();
    pool.shutdown();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join(), Ok(i));
    }
}

#[test]
fn cancellation_token_flips_on_timeout() {
    let pool = WorkerPool::new(1, 50);
    let handle = pool
        .push_back(|| thread::sleep(Duration::from_millis(300)))
        .expect("submission accepted");
    let token = handle.cancel_token();
    assert_eq!(handle.join(), Err(PoolError::Timeout(50)));
    assert!(token.load(std::sync::atomic::Ordering::Relaxed));
}
