//! The host side of the dispatcher link: control socket, configuration
//! handshake, task identifier assignment, and the reply demultiplexer.

use std::collections::{HashMap, VecDeque};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

use super::{ProfileError, ProfileOptions, TaskHandle};
use crate::config::{DispatcherMode, Limits};
use crate::dispatcher::{self, DispatchError, DispatcherConfig};
use crate::launch::{self, WorkerLaunchSpec};
use crate::protocol::{
    self, ControlFrame, ControlReply, Handshake, Message, ReplyEnvelope, ReplyStatus, StatusReport,
    TaskEnvelope,
};
use crate::rng;
use crate::tls::{self, TlsMaterial};
use crate::transport::{DialUrl, Listener, Pipe, PipeEvent, local_url};

type Pending = Arc<Mutex<HashMap<u32, Sender<ReplyEnvelope>>>>;
type Waiters = Arc<Mutex<VecDeque<Sender<ControlReply>>>>;

pub(super) struct DispatcherLink {
    daemon_url: DialUrl,
    /// Next task identifier; wraps, equality is only needed within the
    /// outstanding window.
    msgid: AtomicU32,
    host_pipe: Pipe,
    pending: Pending,
    waiters: Waiters,
    /// Serializes control RPCs so FIFO waiters match FIFO replies.
    rpc_serial: Mutex<()>,
    dead: Arc<AtomicBool>,
    listener: Mutex<Option<Listener>>,
    demux: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
    thread: Mutex<Option<JoinHandle<Result<(), DispatchError>>>>,
    thread_shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<Child>>,
    reap_workers: bool,
    limits: Limits,
}

impl DispatcherLink {
    pub(super) fn build(
        name: &str,
        options: &ProfileOptions,
        user_url: Option<DialUrl>,
    ) -> crate::Result<DispatcherLink> {
        let limits = options.limits.clone();
        let control_url = local_url(&format!("{name}-ctl"))?;
        let (events_tx, events_rx) = unbounded::<PipeEvent>();
        let mut listener = Listener::bind(&control_url, None, events_tx, &limits)?;
        let control_url = listener.url().clone();

        let thread_shutdown = Arc::new(AtomicBool::new(false));
        let mut child = None;
        let mut thread = None;
        match options.dispatcher {
            DispatcherMode::Process => {
                match launch::spawn_dispatcher(
                    &control_url,
                    user_url.as_ref(),
                    options.retry,
                    options.daemon_options.output,
                    options.binary.as_deref(),
                ) {
                    Ok(spawned) => child = Some(spawned),
                    Err(err) => {
                        listener.shutdown();
                        return Err(err.into());
                    }
                }
            }
            DispatcherMode::Thread => {
                thread = Some(dispatcher::spawn_thread(
                    DispatcherConfig {
                        host_url: control_url.clone(),
                        daemon_url: user_url.clone(),
                        retry: options.retry,
                        limits: limits.clone(),
                    },
                    Arc::clone(&thread_shutdown),
                ));
            }
            DispatcherMode::None => {
                listener.shutdown();
                return Err(ProfileError::RequiresDispatcher.into());
            }
        }

        let cleanup = |mut listener: Listener, child: Option<Child>, shutdown: &AtomicBool| {
            shutdown.store(true, Ordering::Release);
            listener.shutdown();
            if let Some(child) = child {
                launch::reap_child(child, Duration::from_secs(2));
            }
        };

        // The dispatcher dials our control socket, then expects the
        // configuration handshake and answers with the daemon dial-in
        // url.
        let host_pipe = match wait_for_dial_in(&events_rx, limits.long_timeout()) {
            Ok(pipe) => pipe,
            Err(err) => {
                cleanup(listener, child, &thread_shutdown);
                return Err(err.into());
            }
        };

        let tls_material = match ephemeral_tls(options, user_url.as_ref()) {
            Ok(material) => material,
            Err(err) => {
                cleanup(listener, child, &thread_shutdown);
                return Err(err);
            }
        };

        let handshake = Handshake {
            preload: options.preload.clone(),
            tls: tls_material.clone(),
            tls_password: options.tls_password.clone(),
            serial: options.serial.config(),
        };
        let handshake_result = protocol::encode(&Message::Handshake(Box::new(handshake)))
            .map_err(crate::Error::from)
            .and_then(|frame| {
                host_pipe
                    .send(frame, limits.long_timeout())
                    .map_err(crate::Error::from)
            })
            .and_then(|()| wait_for_daemon_url(&events_rx, limits.long_timeout()));
        let daemon_url = match handshake_result {
            Ok(url) => url,
            Err(err) => {
                cleanup(listener, child, &thread_shutdown);
                return Err(err);
            }
        };

        // Local daemons dial the dispatcher asynchronously; remote ones
        // use the reported url at their leisure.
        let anchor_path = match write_anchor(name, tls_material.as_ref()) {
            Ok(path) => path,
            Err(err) => {
                cleanup(listener, child, &thread_shutdown);
                return Err(err.into());
            }
        };
        let mut workers = Vec::with_capacity(options.n);
        for index in 0..options.n {
            let spec = WorkerLaunchSpec {
                url: daemon_url.clone(),
                dispatcher: true,
                daemon_id: Some(index as u32 + 1),
                seed: Some(rng::next_daemon_seed()),
                tls_anchor_path: anchor_path.clone(),
                options: options.daemon_options.clone(),
                preload: options.preload.clone(),
            };
            match launch::spawn_worker(&spec, options.binary.as_deref()) {
                Ok(spawned) => workers.push(spawned),
                Err(err) => {
                    for worker in workers {
                        launch::reap_child(worker, Duration::ZERO);
                    }
                    cleanup(listener, child, &thread_shutdown);
                    return Err(err.into());
                }
            }
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let waiters: Waiters = Arc::new(Mutex::new(VecDeque::new()));
        let dead = Arc::new(AtomicBool::new(false));

        let demux = spawn_demux(
            name.to_string(),
            events_rx,
            host_pipe.id(),
            Arc::clone(&pending),
            Arc::clone(&waiters),
            Arc::clone(&dead),
        );

        Ok(DispatcherLink {
            daemon_url,
            msgid: AtomicU32::new(1),
            host_pipe,
            pending,
            waiters,
            rpc_serial: Mutex::new(()),
            dead,
            listener: Mutex::new(Some(listener)),
            demux: Mutex::new(Some(demux)),
            child: Mutex::new(child),
            thread: Mutex::new(thread),
            thread_shutdown,
            workers: Mutex::new(workers),
            reap_workers: options.daemon_options.autoexit,
            limits,
        })
    }

    pub(super) fn daemon_url(&self) -> &DialUrl {
        &self.daemon_url
    }

    /// Tasks submitted so far (the msgid counter minus its start).
    pub(super) fn submitted(&self) -> u64 {
        u64::from(self.msgid.load(Ordering::Relaxed).wrapping_sub(1))
    }

    pub(super) fn submit(&self, payload: Vec<u8>) -> crate::Result<TaskHandle> {
        if self.dead.load(Ordering::Acquire) {
            return Err(ProfileError::Disconnected.into());
        }

        let task_id = self.msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(task_id, tx);

        let frame = protocol::encode(&Message::Task(TaskEnvelope { task_id, payload }))?;
        if let Err(err) = self.host_pipe.send(frame, self.limits.long_timeout()) {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&task_id);
            return Err(err.into());
        }
        Ok(TaskHandle::new(Some(task_id), rx))
    }

    pub(super) fn status_rpc(&self) -> crate::Result<StatusReport> {
        match self.control_rpc(ControlFrame::STATUS)? {
            ControlReply::Status(report) => Ok(report),
            ControlReply::Cancelled(_) => Err(ProfileError::ControlMismatch.into()),
        }
    }

    pub(super) fn cancel(&self, task_id: u32, force: bool) -> crate::Result<bool> {
        match self.control_rpc(ControlFrame::cancel(task_id, force))? {
            ControlReply::Cancelled(hit) => Ok(hit),
            ControlReply::Status(_) => Err(ProfileError::ControlMismatch.into()),
        }
    }

    fn control_rpc(&self, frame: ControlFrame) -> crate::Result<ControlReply> {
        if self.dead.load(Ordering::Acquire) {
            return Err(ProfileError::Disconnected.into());
        }
        let _serial = self.rpc_serial.lock().expect("rpc lock poisoned");

        let (tx, rx) = bounded(1);
        self.waiters
            .lock()
            .expect("waiters lock poisoned")
            .push_back(tx);

        let encoded = protocol::encode(&Message::Control(frame))?;
        if let Err(err) = self.host_pipe.send(encoded, self.limits.long_timeout()) {
            self.waiters
                .lock()
                .expect("waiters lock poisoned")
                .pop_back();
            return Err(err.into());
        }

        match rx.recv_timeout(self.limits.long_timeout()) {
            Ok(reply) => Ok(reply),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                // Forget the waiter; a late reply is dropped by the demux.
                self.waiters
                    .lock()
                    .expect("waiters lock poisoned")
                    .pop_front();
                Err(crate::error::TaskError::Timeout.into())
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                Err(ProfileError::Disconnected.into())
            }
        }
    }

    pub(super) fn teardown(&self, signal: bool, join_background: bool) {
        self.dead.store(true, Ordering::Release);

        if signal {
            // Forwarded by the dispatcher to every connected daemon
            // before it observes our pipe drop.
            if let Ok(frame) = protocol::encode(&Message::Exit) {
                let _ = self.host_pipe.send(frame, Duration::from_millis(250));
            }
        }

        self.thread_shutdown.store(true, Ordering::Release);
        self.host_pipe.close();
        if let Some(mut listener) = self.listener.lock().expect("listener lock poisoned").take() {
            listener.shutdown();
        }

        if join_background
            && let Some(handle) = self.demux.lock().expect("demux lock poisoned").take()
        {
            let _ = handle.join();
        }

        if let Some(child) = self.child.lock().expect("child lock poisoned").take() {
            launch::reap_child(child, Duration::from_secs(2));
        }
        if join_background
            && let Some(handle) = self.thread.lock().expect("thread lock poisoned").take()
        {
            let _ = handle.join();
        }

        let workers: Vec<Child> = self
            .workers
            .lock()
            .expect("workers lock poisoned")
            .drain(..)
            .collect();
        if self.reap_workers {
            for worker in workers {
                launch::reap_child(worker, Duration::from_secs(2));
            }
        }
        // autoexit=false workers outlive the pool on purpose; their
        // handles are dropped unreaped.
    }
}

fn ephemeral_tls(
    options: &ProfileOptions,
    user_url: Option<&DialUrl>,
) -> crate::Result<Option<TlsMaterial>> {
    let Some(url) = user_url else { return Ok(None) };
    if !url.is_tls() {
        return Ok(None);
    }
    if let Some(material) = &options.tls {
        return Ok(Some(material.clone()));
    }
    let host = url.host().unwrap_or("localhost");
    Ok(Some(tls::generate_ephemeral(host)?))
}

fn write_anchor(
    name: &str,
    material: Option<&TlsMaterial>,
) -> std::io::Result<Option<std::path::PathBuf>> {
    let Some(material) = material else {
        return Ok(None);
    };
    let path = crate::paths::tls_anchor_path(name)?;
    std::fs::write(&path, &material.cert_pem)?;
    Ok(Some(path))
}

fn wait_for_dial_in(
    events_rx: &Receiver<PipeEvent>,
    timeout: Duration,
) -> Result<Pipe, ProfileError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(ProfileError::SyncDispatcher)?;
        match events_rx.recv_timeout(remaining) {
            Ok(PipeEvent::Connected(pipe)) => return Ok(pipe),
            Ok(PipeEvent::Frame { .. }) | Ok(PipeEvent::Closed { .. }) => {}
            Err(_) => return Err(ProfileError::SyncDispatcher),
        }
    }
}

fn wait_for_daemon_url(
    events_rx: &Receiver<PipeEvent>,
    timeout: Duration,
) -> crate::Result<DialUrl> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(ProfileError::SyncDispatcher)?;
        match events_rx.recv_timeout(remaining) {
            Ok(PipeEvent::Frame { payload, .. }) => match protocol::decode(&payload)? {
                Message::HandshakeReply(reply) => {
                    return Ok(DialUrl::parse(&reply.daemon_url)
                        .map_err(crate::transport::TransportError::from)?);
                }
                other => tracing::warn!("expected handshake reply, got {other:?}"),
            },
            Ok(PipeEvent::Closed { .. }) => return Err(ProfileError::SyncDispatcher.into()),
            Ok(PipeEvent::Connected(pipe)) => {
                tracing::warn!("unexpected second dial-in on control socket");
                pipe.close();
            }
            Err(_) => return Err(ProfileError::SyncDispatcher.into()),
        }
    }
}

fn spawn_demux(
    profile: String,
    events_rx: Receiver<PipeEvent>,
    host_pipe_id: crate::transport::PipeId,
    pending: Pending,
    waiters: Waiters,
    dead: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("tm-demux-{profile}"))
        .spawn(move || {
            loop {
                match events_rx.recv() {
                    Ok(PipeEvent::Frame { pipe, payload }) => {
                        if pipe != host_pipe_id {
                            continue;
                        }
                        route_frame(&payload, &pending, &waiters);
                    }
                    Ok(PipeEvent::Closed { pipe }) => {
                        if pipe != host_pipe_id {
                            continue;
                        }
                        dead.store(true, Ordering::Release);
                        fail_outstanding(&pending, &waiters);
                        super::implicit_reset(&profile);
                        break;
                    }
                    Ok(PipeEvent::Connected(pipe)) => {
                        tracing::warn!("unexpected dial-in on control socket; dropping");
                        pipe.close();
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("spawn demux thread")
}

fn route_frame(payload: &[u8], pending: &Pending, waiters: &Waiters) {
    match protocol::decode(payload) {
        Ok(Message::Reply(reply)) => {
            let waiter = pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&reply.task_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => tracing::debug!(task_id = reply.task_id, "reply for unknown task"),
            }
        }
        Ok(Message::ControlReply(reply)) => {
            let waiter = waiters
                .lock()
                .expect("waiters lock poisoned")
                .pop_front();
            match waiter {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => tracing::debug!("control reply with no waiter"),
            }
        }
        Ok(other) => tracing::warn!("unexpected frame on control socket: {other:?}"),
        Err(err) => tracing::warn!("undecodable frame on control socket: {err}"),
    }
}

/// Resolve every outstanding task with a connection reset and wake any
/// blocked control RPC.
fn fail_outstanding(pending: &Pending, waiters: &Waiters) {
    let drained: Vec<(u32, Sender<ReplyEnvelope>)> = pending
        .lock()
        .expect("pending lock poisoned")
        .drain()
        .collect();
    for (task_id, tx) in drained {
        let _ = tx.send(ReplyEnvelope {
            task_id,
            status: ReplyStatus::ConnectionReset,
            payload: Vec::new(),
        });
    }
    waiters.lock().expect("waiters lock poisoned").clear();
}
