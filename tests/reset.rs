//! Reset: outstanding tasks resolve promptly with connection resets,
//! and signalled resets let daemons exit cleanly.

mod fixtures;

use std::time::{Duration, Instant};

use taskmill::config::DaemonOptions;
use taskmill::worker::WorkerExit;
use fixtures::{dispatcher_pool_options, spawn_worker_thread, unique_profile, wait_for_connections};

#[test]
fn reset_fails_all_outstanding_tasks_within_a_second() {
    let pool = unique_profile("reset");
    taskmill::configure(&pool, dispatcher_pool_options(false)).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;
    let w1 = spawn_worker_thread(&url, "w1", true, None, DaemonOptions::default());
    let w2 = spawn_worker_thread(&url, "w2", true, None, DaemonOptions::default());
    wait_for_connections(&pool, 2);

    let handles: Vec<_> = (0..3)
        .map(|_| taskmill::submit(&pool, "sleep 3000").unwrap())
        .collect();

    taskmill::reset(&pool, false).unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    for handle in &handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let err = handle.collect(remaining).unwrap_err();
        assert_eq!(err.task_code(), Some(19), "expected connection reset");
    }

    // The profile is gone; no further replies can arrive.
    assert!(taskmill::status(&pool).is_err());
    assert!(taskmill::submit(&pool, "echo x").is_err());

    let _ = w1.join();
    let _ = w2.join();
}

#[test]
fn signalled_reset_lets_idle_daemons_exit_in_band() {
    let pool = unique_profile("reset-signal");
    taskmill::configure(&pool, dispatcher_pool_options(false)).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;
    let worker = spawn_worker_thread(&url, "w", true, None, DaemonOptions::default());
    wait_for_connections(&pool, 1);

    let task = taskmill::submit(&pool, "echo done").unwrap();
    assert_eq!(task.collect(Duration::from_secs(5)).unwrap(), b"done");

    taskmill::reset(&pool, true).unwrap();
    let exit = worker.join().unwrap().unwrap();
    assert_eq!(exit, WorkerExit::ExitSignal);
}

#[test]
fn dropped_pool_takes_autoexit_daemons_with_it() {
    let pool = unique_profile("autoexit");
    taskmill::configure(&pool, dispatcher_pool_options(false)).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;
    let worker = spawn_worker_thread(&url, "w", true, None, DaemonOptions::default());
    wait_for_connections(&pool, 1);

    // No signal: daemons observe the pipe drop instead.
    taskmill::reset(&pool, false).unwrap();
    let exit = worker.join().unwrap().unwrap();
    assert_eq!(exit, WorkerExit::HostClosed);
}
