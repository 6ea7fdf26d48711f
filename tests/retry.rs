//! Crash handling: retry requeues a lost task for the next daemon;
//! without retry the task resolves with a connection reset.

mod fixtures;

use std::time::Duration;

use taskmill::config::DaemonOptions;
use fixtures::{
    dispatcher_pool_options, spawn_crashing_daemon, spawn_worker_thread, unique_profile,
    wait_for_connections, wait_until,
};

#[test]
fn crashed_task_is_retried_on_the_next_daemon() {
    let pool = unique_profile("retry");
    taskmill::configure(&pool, dispatcher_pool_options(true)).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;

    let crasher = spawn_crashing_daemon(&url);
    wait_for_connections(&pool, 1);

    let task = taskmill::submit(&pool, "echo survived").unwrap();

    // The crasher takes the task and drops; with retry the task goes
    // back to the head of the queue.
    assert!(wait_until(Duration::from_secs(5), || {
        taskmill::status(&pool).is_ok_and(|s| s.connections == 0)
    }));
    let queue = taskmill::status(&pool).unwrap().queue.unwrap();
    assert_eq!(queue.awaiting, 1, "task requeued, not failed");

    // A replacement daemon picks it up and it completes.
    let replacement = spawn_worker_thread(&url, "w", true, None, DaemonOptions::default());
    assert_eq!(task.collect(Duration::from_secs(5)).unwrap(), b"survived");

    taskmill::reset(&pool, false).unwrap();
    let _ = crasher.join();
    let _ = replacement.join();
}

#[test]
fn without_retry_a_crash_is_a_connection_reset() {
    let pool = unique_profile("no-retry");
    taskmill::configure(&pool, dispatcher_pool_options(false)).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;

    let crasher = spawn_crashing_daemon(&url);
    wait_for_connections(&pool, 1);

    let task = taskmill::submit(&pool, "echo doomed").unwrap();
    let err = task.collect(Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.task_code(), Some(19));

    taskmill::reset(&pool, false).unwrap();
    let _ = crasher.join();
}
