//! Forwarded daemon options observed end to end.

mod fixtures;

use std::time::Duration;

use taskmill::config::DaemonOptions;
use taskmill::error::TaskError;
use taskmill::worker::WorkerExit;
use fixtures::{direct_pool_options, spawn_worker_thread, unique_profile, wait_for_connections};

#[test]
fn maxtasks_bounds_a_daemons_lifetime() {
    let pool = unique_profile("maxtasks");
    taskmill::configure(&pool, direct_pool_options()).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;

    let worker = spawn_worker_thread(
        &url,
        "w",
        false,
        None,
        DaemonOptions {
            maxtasks: Some(2),
            ..DaemonOptions::default()
        },
    );
    wait_for_connections(&pool, 1);

    let first = taskmill::submit(&pool, "echo 1").unwrap();
    assert_eq!(first.collect(Duration::from_secs(5)).unwrap(), b"1");
    let second = taskmill::submit(&pool, "echo 2").unwrap();
    assert_eq!(second.collect(Duration::from_secs(5)).unwrap(), b"2");

    assert_eq!(worker.join().unwrap().unwrap(), WorkerExit::MaxTasks);

    taskmill::reset(&pool, false).unwrap();
}

#[test]
fn idletime_and_walltime_expire_daemons() {
    let pool = unique_profile("deadlines");
    taskmill::configure(&pool, direct_pool_options()).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;

    let idle = spawn_worker_thread(
        &url,
        "idle",
        false,
        None,
        DaemonOptions {
            idletime: Some(200),
            ..DaemonOptions::default()
        },
    );
    assert_eq!(idle.join().unwrap().unwrap(), WorkerExit::Idle);

    let bounded = spawn_worker_thread(
        &url,
        "bounded",
        false,
        None,
        DaemonOptions {
            walltime: Some(200),
            ..DaemonOptions::default()
        },
    );
    assert_eq!(bounded.join().unwrap().unwrap(), WorkerExit::WallClock);

    taskmill::reset(&pool, false).unwrap();
}

#[test]
fn cleanup_controls_per_task_scratch_state() {
    let pool = unique_profile("cleanup");
    taskmill::configure(&pool, direct_pool_options()).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;

    // cleanup=false: scratch persists across tasks.
    let keeper = spawn_worker_thread(
        &url,
        "keeper",
        false,
        None,
        DaemonOptions {
            cleanup: false,
            ..DaemonOptions::default()
        },
    );
    wait_for_connections(&pool, 1);

    taskmill::submit(&pool, "note k kept")
        .unwrap()
        .collect(Duration::from_secs(5))
        .unwrap();
    let recalled = taskmill::submit(&pool, "recall k")
        .unwrap()
        .collect(Duration::from_secs(5))
        .unwrap();
    assert_eq!(recalled, b"kept");

    taskmill::reset(&pool, false).unwrap();
    let _ = keeper.join();

    // cleanup=true (the default): scratch is freed between tasks.
    let pool = unique_profile("cleanup-on");
    taskmill::configure(&pool, direct_pool_options()).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;
    let cleaner = spawn_worker_thread(&url, "cleaner", false, None, DaemonOptions::default());
    wait_for_connections(&pool, 1);

    taskmill::submit(&pool, "note k gone")
        .unwrap()
        .collect(Duration::from_secs(5))
        .unwrap();
    let err = taskmill::submit(&pool, "recall k")
        .unwrap()
        .collect(Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, taskmill::Error::Task(TaskError::Failed(_))));

    taskmill::reset(&pool, false).unwrap();
    let _ = cleaner.join();
}
