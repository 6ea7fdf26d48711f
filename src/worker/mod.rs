//! The daemon-side runtime: dial in, announce, serve tasks until told
//! to stop.

mod executor;

pub use executor::{BuiltinExecutor, TaskContext, TaskExecutor, TaskFailure};

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use crossbeam::channel::unbounded;
use thiserror::Error;

use crate::config::{DaemonOptions, Limits};
use crate::protocol::{self, Hello, Message, ReplyEnvelope, ReplyStatus};
use crate::rng::{SeedError, StreamSeed};
use crate::serial::Registry;
use crate::tls::{self, TlsError};
use crate::transport::{DialUrl, PipeEvent, TransportError, dial};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Proto(#[from] crate::protocol::ProtoError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error("dial deadline expired before {url} accepted")]
    DialTimeout { url: String },
}

/// Why the worker stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The pool socket dropped and `autoexit` is set.
    HostClosed,
    /// In-band exit sentinel received.
    ExitSignal,
    /// `maxtasks` handled.
    MaxTasks,
    /// `idletime` elapsed without a task.
    Idle,
    /// `walltime` elapsed.
    WallClock,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub url: DialUrl,
    /// Dialing a dispatcher rather than a direct-mode pool socket.
    pub dispatcher: bool,
    /// Stable id reported in the pool's connect/disconnect events.
    pub daemon_id: Option<u32>,
    /// Assigned RNG stream; entropy-seeded when absent.
    pub rng_seed: Option<StreamSeed>,
    /// Trust anchor for `tls+tcp` pools.
    pub tls_anchor_pem: Option<String>,
    pub options: DaemonOptions,
    pub preload: Vec<String>,
    pub limits: Limits,
}

impl WorkerConfig {
    pub fn new(url: DialUrl) -> Self {
        Self {
            url,
            dispatcher: false,
            daemon_id: None,
            rng_seed: None,
            tls_anchor_pem: None,
            options: DaemonOptions::default(),
            preload: Vec::new(),
            limits: Limits::default(),
        }
    }
}

/// Serve tasks until an exit condition is met.
pub fn run(
    config: WorkerConfig,
    mut exec: impl TaskExecutor,
    registry: &Registry,
) -> Result<WorkerExit, WorkerError> {
    exec.preload(&config.preload);
    let mut ctx = TaskContext::new(config.rng_seed)?;

    let send_timeout = config.limits.long_timeout();
    let started = Instant::now();
    let wall_deadline = config.options.wall_timeout().map(|d| started + d);
    let mut tasks_done: u64 = 0;

    let tls_config = config
        .tls_anchor_pem
        .as_deref()
        .map(tls::client_config)
        .transpose()?;

    let mut redialing = false;
    'session: loop {
        let (events_tx, events_rx) = unbounded::<PipeEvent>();
        // After a host restart (autoexit=false) the dial always
        // retries; only the first dial honours the asyncdial choice.
        let persistent = config.options.asyncdial || redialing;
        let pipe = dial_with_policy(&config, tls_config.clone(), events_tx, wall_deadline, persistent)?;
        redialing = true;
        pipe.send(
            protocol::encode(&Message::Hello(Hello {
                daemon_id: config.daemon_id,
            }))?,
            send_timeout,
        )?;
        tracing::info!(url = %config.url, dispatcher = config.dispatcher, "worker serving");

        let mut idle_deadline = config.options.idle_timeout().map(|d| Instant::now() + d);

        loop {
            let timeout = recv_timeout(idle_deadline, wall_deadline);
            match events_rx.recv_timeout(timeout) {
                Ok(PipeEvent::Frame { payload, .. }) => match protocol::decode(&payload)? {
                    Message::Task(task) => {
                        let reply = serve_task(&mut exec, &mut ctx, registry, task.task_id, &task.payload);
                        pipe.send(protocol::encode(&Message::Reply(reply))?, send_timeout)?;

                        tasks_done += 1;
                        if config.options.cleanup {
                            ctx.clear_scratch();
                            exec.cleanup();
                        }
                        if let Some(max) = config.options.maxtasks
                            && tasks_done >= max
                        {
                            return Ok(WorkerExit::MaxTasks);
                        }
                        idle_deadline = config.options.idle_timeout().map(|d| Instant::now() + d);
                    }
                    Message::Exit => return Ok(WorkerExit::ExitSignal),
                    other => tracing::warn!("unexpected frame for worker: {other:?}"),
                },
                Ok(PipeEvent::Closed { .. }) => {
                    if config.options.autoexit {
                        return Ok(WorkerExit::HostClosed);
                    }
                    // Survive host shutdown: redial until a new host
                    // binds the url.
                    tracing::info!("pool socket dropped; redialing");
                    continue 'session;
                }
                Ok(PipeEvent::Connected(_)) => {}
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    if wall_deadline.is_some_and(|d| now >= d) {
                        return Ok(WorkerExit::WallClock);
                    }
                    if idle_deadline.is_some_and(|d| now >= d) {
                        return Ok(WorkerExit::Idle);
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    if config.options.autoexit {
                        return Ok(WorkerExit::HostClosed);
                    }
                    continue 'session;
                }
            }
        }
    }
}

fn serve_task(
    exec: &mut impl TaskExecutor,
    ctx: &mut TaskContext,
    registry: &Registry,
    task_id: u32,
    payload: &[u8],
) -> ReplyEnvelope {
    let decoded = match registry.decode_payload(payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            return ReplyEnvelope {
                task_id,
                status: ReplyStatus::UserError,
                payload: err.to_string().into_bytes(),
            };
        }
    };

    // A panicking task must not take the daemon down with it.
    let outcome =
        std::panic::catch_unwind(AssertUnwindSafe(|| exec.execute(ctx, decoded.as_ref())));

    match outcome {
        Ok(Ok(result)) => ReplyEnvelope {
            task_id,
            status: ReplyStatus::Ok,
            payload: result,
        },
        Ok(Err(failure)) => ReplyEnvelope {
            task_id,
            status: ReplyStatus::UserError,
            payload: failure.into_payload(),
        },
        Err(panic) => {
            let text = panic_text(&*panic);
            tracing::warn!(task_id, "task panicked: {text}");
            ReplyEnvelope {
                task_id,
                status: ReplyStatus::UserError,
                payload: format!("task panicked: {text}").into_bytes(),
            }
        }
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

fn recv_timeout(idle: Option<Instant>, wall: Option<Instant>) -> Duration {
    let now = Instant::now();
    let deadline = match (idle, wall) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    };
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(now).min(Duration::from_millis(500)),
        None => Duration::from_millis(500),
    }
}

fn dial_with_policy(
    config: &WorkerConfig,
    tls: Option<std::sync::Arc<rustls::ClientConfig>>,
    events_tx: crossbeam::channel::Sender<PipeEvent>,
    wall_deadline: Option<Instant>,
    persistent: bool,
) -> Result<crate::transport::Pipe, WorkerError> {
    if !persistent {
        return Ok(dial(&config.url, tls, events_tx, &config.limits)?);
    }

    // Connection failures back off and retry instead of erroring out,
    // bounded by the wall clock if one is set.
    let mut backoff = Duration::from_millis(100);
    loop {
        match dial(&config.url, tls.clone(), events_tx.clone(), &config.limits) {
            Ok(pipe) => return Ok(pipe),
            Err(err) => {
                if wall_deadline.is_some_and(|d| Instant::now() + backoff >= d) {
                    tracing::warn!("dial deadline expired: {err}");
                    return Err(WorkerError::DialTimeout {
                        url: config.url.to_string(),
                    });
                }
                tracing::debug!(url = %config.url, "dial failed, retrying: {err}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
        }
    }
}
