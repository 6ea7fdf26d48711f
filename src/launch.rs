//! Child-process launching for workers and the dispatcher.
//!
//! Children receive structured argv only: flags for the dial-in URL,
//! dispatcher mode, RNG seed vector, and the forwarded option set.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::config::DaemonOptions;
use crate::rng::StreamSeed;
use crate::transport::DialUrl;

#[derive(Debug, Clone)]
pub struct WorkerLaunchSpec {
    pub url: DialUrl,
    pub dispatcher: bool,
    pub daemon_id: Option<u32>,
    pub seed: Option<StreamSeed>,
    /// PEM file carrying the pool certificate to trust.
    pub tls_anchor_path: Option<PathBuf>,
    pub options: DaemonOptions,
    pub preload: Vec<String>,
}

/// The `tm` invocation used for children: an explicit binary override
/// (tests), else this executable, else `tm` from PATH.
fn base_command(binary: Option<&Path>) -> Command {
    if let Some(path) = binary {
        return Command::new(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        return Command::new(exe);
    }
    Command::new("tm")
}

fn child_stdio(command: &mut Command, output: bool) {
    command.stdin(Stdio::null());
    if !output {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }
}

pub(crate) fn worker_args(spec: &WorkerLaunchSpec) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["worker".into(), "--url".into(), spec.url.to_string().into()];
    if spec.dispatcher {
        args.push("--dispatcher".into());
    }
    if let Some(id) = spec.daemon_id {
        args.push("--id".into());
        args.push(id.to_string().into());
    }
    if let Some(seed) = &spec.seed {
        args.push("--rng-seed".into());
        args.push(seed.to_string().into());
    }
    if let Some(path) = &spec.tls_anchor_path {
        args.push("--tls-ca".into());
        args.push(path.into());
    }
    for capability in &spec.preload {
        args.push("--preload".into());
        args.push(capability.into());
    }

    let options = &spec.options;
    if options.asyncdial {
        args.push("--asyncdial".into());
    }
    args.push("--autoexit".into());
    args.push(options.autoexit.to_string().into());
    args.push("--cleanup".into());
    args.push(options.cleanup.to_string().into());
    if options.output {
        args.push("--output".into());
    }
    if let Some(max) = options.maxtasks {
        args.push("--maxtasks".into());
        args.push(max.to_string().into());
    }
    if let Some(ms) = options.idletime {
        args.push("--idletime".into());
        args.push(ms.to_string().into());
    }
    if let Some(ms) = options.walltime {
        args.push("--walltime".into());
        args.push(ms.to_string().into());
    }
    args
}

pub fn spawn_worker(spec: &WorkerLaunchSpec, binary: Option<&Path>) -> std::io::Result<Child> {
    let mut command = base_command(binary);
    command.args(worker_args(spec));
    child_stdio(&mut command, spec.options.output);
    tracing::debug!(url = %spec.url, "spawning worker: {command:?}");
    command.spawn()
}

pub fn spawn_dispatcher(
    host_url: &DialUrl,
    daemon_url: Option<&DialUrl>,
    retry: bool,
    output: bool,
    binary: Option<&Path>,
) -> std::io::Result<Child> {
    let mut command = base_command(binary);
    command
        .arg("dispatch")
        .arg("--host-url")
        .arg(host_url.to_string());
    if let Some(url) = daemon_url {
        command.arg("--daemon-url").arg(url.to_string());
    }
    command.arg("--retry").arg(retry.to_string());

    child_stdio(&mut command, output);
    tracing::debug!(host = %host_url, "spawning dispatcher: {command:?}");
    command.spawn()
}

/// Best-effort child termination for the reset path: give it a moment
/// to exit on pipe drop, then kill.
pub fn reap_child(mut child: Child, grace: std::time::Duration) {
    let deadline = std::time::Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            Err(_) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}
