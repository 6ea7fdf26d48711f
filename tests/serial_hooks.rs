//! Serialization hooks across a live pool: the host encodes through a
//! registered hook, the worker's matching hook decodes before
//! execution.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use taskmill::config::{DaemonOptions, Limits};
use taskmill::profile::ProfileOptions;
use taskmill::serial::{Registry, SerialHook};
use taskmill::transport::DialUrl;
use taskmill::worker::{self, BuiltinExecutor, WorkerConfig};
use fixtures::{direct_pool_options, unique_profile, wait_for_connections};

/// A toy wire transform standing in for a real external-reference
/// codec.
fn xor_hook() -> SerialHook {
    SerialHook {
        class_tag: "xor".into(),
        vectorized: false,
        encode: Arc::new(|bytes| bytes.iter().map(|b| b ^ 0x55).collect()),
        decode: Arc::new(|bytes| Ok(bytes.iter().map(|b| b ^ 0x55).collect())),
    }
}

#[test]
fn tagged_payloads_decode_on_the_worker_side() {
    let mut host_hooks = Registry::new();
    host_hooks.register(xor_hook());

    let pool = unique_profile("hooks");
    let options = ProfileOptions {
        serial: host_hooks,
        ..direct_pool_options()
    };
    taskmill::configure(&pool, options).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;

    let worker = {
        let url = DialUrl::parse(&url).unwrap();
        std::thread::spawn(move || {
            let mut worker_hooks = Registry::new();
            worker_hooks.register(xor_hook());
            let config = WorkerConfig {
                url,
                dispatcher: false,
                daemon_id: None,
                rng_seed: None,
                tls_anchor_pem: None,
                options: DaemonOptions::default(),
                preload: Vec::new(),
                limits: Limits::default(),
            };
            worker::run(config, BuiltinExecutor::new(), &worker_hooks)
        })
    };
    wait_for_connections(&pool, 1);

    // The command only makes sense after the worker-side decode.
    let task = taskmill::submit_tagged(&pool, "xor", b"echo decoded").unwrap();
    assert_eq!(task.collect(Duration::from_secs(5)).unwrap(), b"decoded");

    // Unregistered tags fail at submission, before anything is sent.
    assert!(taskmill::submit_tagged(&pool, "proto", b"x").is_err());

    taskmill::reset(&pool, false).unwrap();
    let _ = worker.join();
}

#[test]
fn unknown_hook_on_the_worker_side_is_a_task_error() {
    let mut host_hooks = Registry::new();
    host_hooks.register(xor_hook());

    let pool = unique_profile("hooks-miss");
    let options = ProfileOptions {
        serial: host_hooks,
        ..direct_pool_options()
    };
    taskmill::configure(&pool, options).unwrap();
    let url = taskmill::status(&pool).unwrap().listening_url;

    // This worker registered nothing.
    let worker = fixtures::spawn_worker_thread(&url, "bare", false, None, DaemonOptions::default());
    wait_for_connections(&pool, 1);

    let task = taskmill::submit_tagged(&pool, "xor", b"echo x").unwrap();
    let err = task.collect(Duration::from_secs(5)).unwrap_err();
    assert!(err.to_string().contains("xor"), "error names the tag: {err}");

    taskmill::reset(&pool, false).unwrap();
    let _ = worker.join();
}
