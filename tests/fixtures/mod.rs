//! Shared helpers for the integration suite: in-process workers dialing
//! real loopback sockets, and deadline polling.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use taskmill::config::{DaemonOptions, DispatcherMode, Limits};
use taskmill::profile::ProfileOptions;
use taskmill::serial::Registry;
use taskmill::transport::{DialUrl, PipeEvent, dial};
use taskmill::worker::{BuiltinExecutor, WorkerConfig, WorkerError, WorkerExit};
use taskmill::{protocol, worker};

static NEXT_POOL: AtomicU64 = AtomicU64::new(1);

/// A process-unique profile name so tests can run in parallel.
pub fn unique_profile(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{}",
        std::process::id(),
        NEXT_POOL.fetch_add(1, Ordering::Relaxed)
    )
}

/// Fast-failing limits for tests: nobody waits 10s on a bug.
pub fn test_limits() -> Limits {
    Limits {
        long_timeout_ms: 5_000,
        ..Limits::default()
    }
}

/// Options for a thread-dispatcher pool that tests drive with
/// in-process workers (n = 0, workers dial in themselves).
pub fn dispatcher_pool_options(retry: bool) -> ProfileOptions {
    ProfileOptions {
        n: 0,
        url: Some("tcp://127.0.0.1:0".into()),
        dispatcher: DispatcherMode::Thread,
        retry,
        limits: test_limits(),
        ..ProfileOptions::new()
    }
}

/// Options for a direct-mode pool on a loopback wildcard port.
pub fn direct_pool_options() -> ProfileOptions {
    ProfileOptions {
        n: 0,
        url: Some("tcp://127.0.0.1:0".into()),
        dispatcher: DispatcherMode::None,
        limits: test_limits(),
        ..ProfileOptions::new()
    }
}

/// Run a worker on a thread, serving the builtin executor under `tag`.
pub fn spawn_worker_thread(
    listening_url: &str,
    tag: &str,
    dispatcher: bool,
    daemon_id: Option<u32>,
    options: DaemonOptions,
) -> JoinHandle<Result<WorkerExit, WorkerError>> {
    let url = DialUrl::parse(listening_url).expect("worker url");
    let tag = tag.to_string();
    std::thread::spawn(move || {
        let config = WorkerConfig {
            url,
            dispatcher,
            daemon_id,
            rng_seed: None,
            tls_anchor_pem: None,
            options,
            preload: Vec::new(),
            limits: test_limits(),
        };
        worker::run(config, BuiltinExecutor::with_tag(tag), &Registry::new())
    })
}

/// A daemon that dials in, accepts exactly one task, and drops the
/// connection without replying. Used to exercise crash handling.
pub fn spawn_crashing_daemon(listening_url: &str) -> JoinHandle<()> {
    let url = DialUrl::parse(listening_url).expect("daemon url");
    std::thread::spawn(move || {
        let (events_tx, events_rx) = crossbeam::channel::unbounded::<PipeEvent>();
        let limits = test_limits();
        let pipe = dial(&url, None, events_tx, &limits).expect("crashing daemon dial");
        pipe.send(
            protocol::encode(&protocol::Message::Hello(protocol::Hello { daemon_id: None }))
                .unwrap(),
            Duration::from_secs(1),
        )
        .expect("hello");

        // Wait for one task, then vanish mid-execution.
        loop {
            match events_rx.recv_timeout(Duration::from_secs(10)) {
                Ok(PipeEvent::Frame { payload, .. }) => {
                    if matches!(protocol::decode(&payload), Ok(protocol::Message::Task(_))) {
                        pipe.close();
                        return;
                    }
                }
                Ok(PipeEvent::Closed { .. }) | Err(_) => return,
                Ok(PipeEvent::Connected(_)) => {}
            }
        }
    })
}

/// Poll `predicate` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Wait until the pool sees exactly `n` connections.
pub fn wait_for_connections(profile: &str, n: usize) {
    assert!(
        wait_until(Duration::from_secs(5), || {
            taskmill::status(profile).is_ok_and(|status| status.connections == n)
        }),
        "pool {profile} never reached {n} connections"
    );
}
