//! Cancellation: before dispatch, after dispatch, and forced.

mod fixtures;

use std::time::Duration;

use taskmill::config::DaemonOptions;
use taskmill::error::TaskError;
use fixtures::{dispatcher_pool_options, spawn_worker_thread, unique_profile, wait_for_connections};

#[test]
fn cancel_before_dispatch_spares_the_running_task() {
    let pool = unique_profile("cancel");
    taskmill::configure(&pool, dispatcher_pool_options(false)).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;
    let worker = spawn_worker_thread(&url, "w", true, None, DaemonOptions::default());
    wait_for_connections(&pool, 1);

    let running = taskmill::submit(&pool, "sleep 400").unwrap();
    let queued = taskmill::submit(&pool, "echo never").unwrap();

    // B is still queued: cancellable.
    let hit = taskmill::cancel(&pool, queued.task_id().unwrap(), false).unwrap();
    assert!(hit);
    let err = queued.collect(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, taskmill::Error::Task(TaskError::Cancelled)));
    assert_eq!(err.task_code(), Some(2));

    // A was already dispatched and completes normally.
    assert_eq!(
        running.collect(Duration::from_secs(5)).unwrap(),
        b"slept 400"
    );

    // Cancel is idempotent, including on completed ids.
    assert!(!taskmill::cancel(&pool, running.task_id().unwrap(), false).unwrap());

    taskmill::reset(&pool, false).unwrap();
    let _ = worker.join();
}

#[test]
fn force_cancel_restarts_the_executing_daemon() {
    let pool = unique_profile("force-cancel");
    taskmill::configure(&pool, dispatcher_pool_options(false)).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;
    let worker = spawn_worker_thread(&url, "w", true, None, DaemonOptions::default());
    wait_for_connections(&pool, 1);

    let stuck = taskmill::submit(&pool, "sleep 2000").unwrap();
    // Executing, so a soft cancel misses...
    assert!(!taskmill::cancel(&pool, stuck.task_id().unwrap(), false).unwrap());
    // ...and a forced one drops the daemon instead.
    assert!(!taskmill::cancel(&pool, stuck.task_id().unwrap(), true).unwrap());

    let err = stuck.collect(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, taskmill::Error::Task(TaskError::Cancelled)));

    taskmill::reset(&pool, false).unwrap();
    let _ = worker.join();
}
