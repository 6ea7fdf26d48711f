//! Dispatcher runtime: host dial-in, configuration handshake, daemon
//! listener, and the select loop feeding the scheduling core.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, unbounded};
use thiserror::Error;

use super::core::{Core, Effect, Input};
use crate::config::Limits;
use crate::protocol::{self, Handshake, HandshakeReply, Message};
use crate::tls::{self, TlsError};
use crate::transport::{
    DialUrl, Listener, Pipe, PipeEvent, PipeId, TransportError, dial, local_url,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Proto(#[from] crate::protocol::ProtoError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration handshake timed out")]
    HandshakeTimeout,
    #[error("host socket closed before handshake completed")]
    HostClosedEarly,
    #[error("tls daemon url requires tls material in the handshake")]
    MissingTlsMaterial,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// The pool's control socket, where the host listens for us.
    pub host_url: DialUrl,
    /// Where daemons dial in. Defaults to a process-local endpoint.
    pub daemon_url: Option<DialUrl>,
    /// Requeue a crashed daemon's task instead of failing it.
    pub retry: bool,
    pub limits: Limits,
}

/// Run the dispatcher until the host socket drops or `shutdown` is set.
pub fn run(config: DispatcherConfig, shutdown: Arc<AtomicBool>) -> Result<(), DispatchError> {
    let send_timeout = config.limits.long_timeout();

    let (host_tx, host_rx) = unbounded::<PipeEvent>();
    let host_pipe = dial(&config.host_url, None, host_tx, &config.limits)?;
    tracing::debug!(host = %config.host_url, "dispatcher dialed host");

    let handshake = wait_handshake(&host_rx, config.limits.long_timeout())?;
    if !handshake.serial.hooks.is_empty() {
        tracing::debug!(
            hooks = handshake.serial.hooks.len(),
            "serialization hooks configured; payloads pass through opaque"
        );
    }

    let daemon_url = match &config.daemon_url {
        Some(url) => url.clone(),
        None => local_url("dispatch")?,
    };
    let tls_config = if daemon_url.is_tls() {
        let material = handshake
            .tls
            .as_ref()
            .ok_or(DispatchError::MissingTlsMaterial)?;
        Some(tls::server_config(
            material,
            handshake.tls_password.as_deref(),
        )?)
    } else {
        None
    };

    let (daemon_tx, daemon_rx) = unbounded::<PipeEvent>();
    let mut listener = Listener::bind(&daemon_url, tls_config, daemon_tx, &config.limits)?;
    tracing::info!(url = %listener.url(), "dispatcher accepting daemons");

    host_pipe.send(
        protocol::encode(&Message::HandshakeReply(HandshakeReply {
            daemon_url: listener.url().to_string(),
        }))?,
        send_timeout,
    )?;

    let mut core = Core::new(config.retry, config.limits.event_ring_capacity);
    // Dialed in but no hello yet: not part of the roster.
    let mut awaiting_hello: HashMap<PipeId, Pipe> = HashMap::new();
    let mut live: HashMap<PipeId, Pipe> = HashMap::new();

    let tick = Duration::from_millis(50);
    let result = loop {
        if shutdown.load(Ordering::Relaxed) {
            break Ok(());
        }

        crossbeam::select! {
            recv(host_rx) -> event => {
                match event {
                    Ok(PipeEvent::Frame { payload, .. }) => {
                        let input = match protocol::decode(&payload) {
                            Ok(Message::Task(task)) => Input::Task(task),
                            Ok(Message::Control(control)) => Input::Control(control),
                            Ok(Message::Exit) => Input::ExitAll,
                            Ok(other) => {
                                tracing::warn!("unexpected host frame: {other:?}");
                                continue;
                            }
                            Err(err) => {
                                tracing::warn!("undecodable host frame: {err}");
                                continue;
                            }
                        };
                        let effects = core.handle(input);
                        if let Err(err) =
                            apply(effects, &host_pipe, &mut live, send_timeout)
                        {
                            break Err(err);
                        }
                    }
                    // Host gone: fatal; daemons observe our pipe drop.
                    Ok(PipeEvent::Closed { .. }) | Err(_) => break Ok(()),
                    Ok(PipeEvent::Connected(_)) => {}
                }
            }
            recv(daemon_rx) -> event => {
                match event {
                    Ok(PipeEvent::Connected(pipe)) => {
                        awaiting_hello.insert(pipe.id(), pipe);
                    }
                    Ok(PipeEvent::Frame { pipe, payload }) => {
                        let effects = match classify_daemon_frame(
                            pipe,
                            &payload,
                            &mut awaiting_hello,
                            &mut live,
                        ) {
                            Some(input) => core.handle(input),
                            None => continue,
                        };
                        if let Err(err) =
                            apply(effects, &host_pipe, &mut live, send_timeout)
                        {
                            break Err(err);
                        }
                    }
                    Ok(PipeEvent::Closed { pipe }) => {
                        awaiting_hello.remove(&pipe);
                        if live.remove(&pipe).is_some() {
                            let effects = core.handle(Input::Disconnected { pipe });
                            if let Err(err) =
                                apply(effects, &host_pipe, &mut live, send_timeout)
                            {
                                break Err(err);
                            }
                        }
                    }
                    Err(_) => break Ok(()),
                }
            }
            default(tick) => {}
        }
    };

    listener.shutdown();
    for pipe in live.values().chain(awaiting_hello.values()) {
        pipe.close();
    }
    tracing::info!("dispatcher stopped");
    result
}

/// Thread-variant dispatcher, sharing the host address space. Identical
/// protocol; the handle is joined by the pool's reset path.
pub fn spawn_thread(
    config: DispatcherConfig,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<Result<(), DispatchError>> {
    std::thread::Builder::new()
        .name("tm-dispatcher".into())
        .spawn(move || {
            let result = run(config, shutdown);
            if let Err(err) = &result {
                tracing::error!("dispatcher thread failed: {err}");
            }
            result
        })
        .expect("spawn dispatcher thread")
}

fn wait_handshake(
    host_rx: &Receiver<PipeEvent>,
    timeout: Duration,
) -> Result<Handshake, DispatchError> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .ok_or(DispatchError::HandshakeTimeout)?;
        match host_rx.recv_timeout(remaining) {
            Ok(PipeEvent::Frame { payload, .. }) => match protocol::decode(&payload)? {
                Message::Handshake(handshake) => return Ok(*handshake),
                other => tracing::warn!("expected handshake, got {other:?}"),
            },
            Ok(PipeEvent::Closed { .. }) => return Err(DispatchError::HostClosedEarly),
            Ok(PipeEvent::Connected(_)) => {}
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                return Err(DispatchError::HandshakeTimeout);
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                return Err(DispatchError::HostClosedEarly);
            }
        }
    }
}

fn classify_daemon_frame(
    pipe: PipeId,
    payload: &[u8],
    awaiting_hello: &mut HashMap<PipeId, Pipe>,
    live: &mut HashMap<PipeId, Pipe>,
) -> Option<Input> {
    if let Some(handle) = awaiting_hello.remove(&pipe) {
        return match protocol::decode(payload) {
            Ok(Message::Hello(hello)) => {
                tracing::debug!(pipe, daemon_id = ?hello.daemon_id, "daemon joined");
                live.insert(pipe, handle);
                Some(Input::Connected {
                    pipe,
                    daemon_id: hello.daemon_id,
                })
            }
            other => {
                tracing::warn!(pipe, "daemon spoke before hello ({other:?}); dropping");
                handle.close();
                None
            }
        };
    }

    if live.contains_key(&pipe) {
        return match protocol::decode(payload) {
            Ok(Message::Reply(reply)) => Some(Input::Reply { pipe, reply }),
            other => {
                tracing::warn!(pipe, "unexpected daemon frame: {other:?}");
                None
            }
        };
    }

    tracing::debug!(pipe, "frame from unknown pipe");
    None
}

fn apply(
    effects: Vec<Effect>,
    host_pipe: &Pipe,
    live: &mut HashMap<PipeId, Pipe>,
    send_timeout: Duration,
) -> Result<(), DispatchError> {
    for effect in effects {
        match effect {
            Effect::ToHost(msg) => {
                host_pipe.send(protocol::encode(&msg)?, send_timeout)?;
            }
            Effect::ToDaemon { pipe, msg } => {
                if let Some(handle) = live.get(&pipe) {
                    if let Err(err) = handle.send(protocol::encode(&msg)?, send_timeout) {
                        // Treated as a crash: the Closed event requeues
                        // or fails the task per policy.
                        tracing::warn!(pipe, "send to daemon failed: {err}");
                        handle.close();
                    }
                } else {
                    tracing::debug!(pipe, "effect for departed daemon dropped");
                }
            }
            Effect::ClosePipe(pipe) => {
                if let Some(handle) = live.get(&pipe) {
                    handle.close();
                }
            }
        }
    }
    Ok(())
}
