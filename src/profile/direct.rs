//! Direct mode: no dispatcher. The profile socket is the dial-in
//! endpoint and tasks fan out round-robin over connected daemons, with
//! per-pipe FIFO reply correlation (request/reply discipline within one
//! pipe).

use std::collections::VecDeque;
use std::process::Child;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

use super::{ProfileError, ProfileOptions, TaskHandle};
use crate::config::Limits;
use crate::launch::{self, WorkerLaunchSpec};
use crate::protocol::{self, Message, ReplyEnvelope, ReplyStatus, TaskEnvelope};
use crate::rng;
use crate::tls;
use crate::transport::{DialUrl, Listener, Pipe, PipeEvent, TransportError, local_url};

struct DirectPipe {
    pipe: Pipe,
    /// Reply slots in send order; the transport guarantees one pipe's
    /// replies arrive in request order.
    pending: VecDeque<Sender<ReplyEnvelope>>,
}

#[derive(Default)]
struct DirectState {
    /// Accepted but not yet announced via hello.
    joining: Vec<Pipe>,
    roster: Vec<DirectPipe>,
}

pub(super) struct DirectPool {
    url: DialUrl,
    state: Arc<Mutex<DirectState>>,
    cursor: AtomicUsize,
    listener: Mutex<Option<Listener>>,
    router: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<Child>>,
    reap_workers: bool,
    limits: Limits,
}

impl DirectPool {
    pub(super) fn build(
        name: &str,
        options: &ProfileOptions,
        user_url: Option<DialUrl>,
    ) -> crate::Result<DirectPool> {
        let limits = options.limits.clone();
        let url = match user_url {
            Some(url) => url,
            None => local_url(name)?,
        };

        let tls_material = if url.is_tls() {
            Some(match &options.tls {
                Some(material) => material.clone(),
                None => tls::generate_ephemeral(url.host().unwrap_or("localhost"))?,
            })
        } else {
            None
        };
        let server_config = tls_material
            .as_ref()
            .map(|material| tls::server_config(material, options.tls_password.as_deref()))
            .transpose()?;

        let (events_tx, events_rx) = unbounded::<PipeEvent>();
        let mut listener = Listener::bind(&url, server_config, events_tx, &limits)?;
        let url = listener.url().clone();

        let anchor_path = match &tls_material {
            Some(material) => {
                let path = crate::paths::tls_anchor_path(name)?;
                std::fs::write(&path, &material.cert_pem)?;
                Some(path)
            }
            None => None,
        };

        let mut workers = Vec::with_capacity(options.n);
        for index in 0..options.n {
            let spec = WorkerLaunchSpec {
                url: url.clone(),
                dispatcher: false,
                daemon_id: Some(index as u32 + 1),
                seed: Some(rng::next_daemon_seed()),
                tls_anchor_path: anchor_path.clone(),
                options: options.daemon_options.clone(),
                preload: options.preload.clone(),
            };
            match launch::spawn_worker(&spec, options.binary.as_deref()) {
                Ok(child) => workers.push(child),
                Err(err) => {
                    abort_launch(&mut listener, workers);
                    return Err(err.into());
                }
            }
        }

        // Synchronous launch: every expected daemon must dial in (and
        // say hello) before configure returns.
        let mut state = DirectState::default();
        if options.n > 0 {
            let deadline = Instant::now() + limits.long_timeout();
            while state.roster.len() < options.n {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    let connected = state.roster.len();
                    abort_launch(&mut listener, workers);
                    return Err(ProfileError::SyncDaemons {
                        expected: options.n,
                        connected,
                    }
                    .into());
                };
                match events_rx.recv_timeout(remaining) {
                    Ok(event) => handle_event(&mut state, event),
                    Err(_) => {
                        let connected = state.roster.len();
                        abort_launch(&mut listener, workers);
                        return Err(ProfileError::SyncDaemons {
                            expected: options.n,
                            connected,
                        }
                        .into());
                    }
                }
            }
        }

        let state = Arc::new(Mutex::new(state));
        let router = spawn_router(name.to_string(), events_rx, Arc::clone(&state));

        Ok(DirectPool {
            url,
            state,
            cursor: AtomicUsize::new(0),
            listener: Mutex::new(Some(listener)),
            router: Mutex::new(Some(router)),
            workers: Mutex::new(workers),
            reap_workers: options.daemon_options.autoexit,
            limits,
        })
    }

    pub(super) fn url(&self) -> &DialUrl {
        &self.url
    }

    /// Live pipe count, straight from the roster the transport events
    /// maintain.
    pub(super) fn connections(&self) -> usize {
        self.state.lock().expect("direct state lock poisoned").roster.len()
    }

    pub(super) fn submit(&self, payload: Vec<u8>) -> crate::Result<TaskHandle> {
        let mut state = self.state.lock().expect("direct state lock poisoned");
        if state.roster.is_empty() {
            return Err(TransportError::NoPeers.into());
        }

        // The transport-level fair queue: rotate over connected pipes.
        let index = self.cursor.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % state.roster.len();
        let entry = &mut state.roster[index];

        let (tx, rx) = bounded(1);
        entry.pending.push_back(tx);

        // No host-side identifier in direct mode; correlation is the
        // pipe's FIFO.
        let frame = protocol::encode(&Message::Task(TaskEnvelope {
            task_id: 0,
            payload,
        }))?;
        if let Err(err) = entry.pipe.send(frame, self.limits.long_timeout()) {
            entry.pending.pop_back();
            return Err(err.into());
        }
        Ok(TaskHandle::new(None, rx))
    }

    pub(super) fn teardown(&self, signal: bool) {
        if signal {
            let state = self.state.lock().expect("direct state lock poisoned");
            for entry in &state.roster {
                if let Ok(frame) = protocol::encode(&Message::Exit) {
                    let _ = entry.pipe.send(frame, Duration::from_millis(250));
                }
            }
        }

        if let Some(mut listener) = self.listener.lock().expect("listener lock poisoned").take() {
            listener.shutdown();
        }
        {
            let state = self.state.lock().expect("direct state lock poisoned");
            for pipe in &state.joining {
                pipe.close();
            }
            for entry in &state.roster {
                entry.pipe.close();
            }
        }

        // The router drains each closed pipe's reply slots with
        // connection resets, then its event channel disconnects.
        if let Some(handle) = self.router.lock().expect("router lock poisoned").take() {
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
    }
}

fn abort_launch(listener: &mut Listener, workers: Vec<Child>) {
    listener.shutdown();
    for worker in workers {
        launch::reap_child(worker, Duration::ZERO);
    }
}

fn spawn_router(
    profile: String,
    events_rx: Receiver<PipeEvent>,
    state: Arc<Mutex<DirectState>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("tm-router-{profile}"))
        .spawn(move || {
            while let Ok(event) = events_rx.recv() {
                let mut state = state.lock().expect("direct state lock poisoned");
                handle_event(&mut state, event);
            }
        })
        .expect("spawn router thread")
}

fn handle_event(state: &mut DirectState, event: PipeEvent) {
    match event {
        PipeEvent::Connected(pipe) => state.joining.push(pipe),
        PipeEvent::Frame { pipe, payload } => {
            if let Some(pos) = state.joining.iter().position(|p| p.id() == pipe) {
                match protocol::decode(&payload) {
                    Ok(Message::Hello(hello)) => {
                        tracing::debug!(pipe, daemon_id = ?hello.daemon_id, "daemon joined pool");
                        let pipe = state.joining.remove(pos);
                        state.roster.push(DirectPipe {
                            pipe,
                            pending: VecDeque::new(),
                        });
                    }
                    other => {
                        tracing::warn!(pipe, "daemon spoke before hello ({other:?}); dropping");
                        state.joining.remove(pos).close();
                    }
                }
                return;
            }

            let Some(entry) = state.roster.iter_mut().find(|e| e.pipe.id() == pipe) else {
                tracing::debug!(pipe, "frame from unknown pipe");
                return;
            };
            match protocol::decode(&payload) {
                Ok(Message::Reply(reply)) => match entry.pending.pop_front() {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => tracing::debug!(pipe, "reply with no outstanding request"),
                },
                other => tracing::warn!(pipe, "unexpected frame from daemon: {other:?}"),
            }
        }
        PipeEvent::Closed { pipe } => {
            state.joining.retain(|p| p.id() != pipe);
            if let Some(pos) = state.roster.iter().position(|e| e.pipe.id() == pipe) {
                let entry = state.roster.remove(pos);
                // Whatever this daemon was holding resolves as reset;
                // direct mode has no retry.
                for tx in entry.pending {
                    let _ = tx.send(ReplyEnvelope {
                        task_id: 0,
                        status: ReplyStatus::ConnectionReset,
                        payload: Vec::new(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_state_with_closed_pipe() -> (DirectState, Receiver<ReplyEnvelope>) {
        // Build a pipe against a real loopback listener so ids are
        // realistic, then exercise the pure event handler.
        let (events_tx, events_rx) = unbounded();
        let limits = Limits::default();
        let url = DialUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&url, None, events_tx.clone(), &limits).unwrap();
        let pipe =
            crate::transport::dial(listener.url(), None, events_tx, &limits).unwrap();

        let mut state = DirectState::default();
        let (tx, rx) = bounded(1);
        state.roster.push(DirectPipe {
            pipe,
            pending: VecDeque::from([tx]),
        });
        (state, rx)
    }

    #[test]
    fn closed_pipe_drains_reply_slots_with_resets() {
        let (mut state, rx) = fake_state_with_closed_pipe();
        let pipe_id = state.roster[0].pipe.id();

        handle_event(&mut state, PipeEvent::Closed { pipe: pipe_id });

        assert!(state.roster.is_empty());
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.status, ReplyStatus::ConnectionReset);
    }

    #[test]
    fn hello_promotes_a_joining_pipe_into_the_roster() {
        let (mut state, _rx) = fake_state_with_closed_pipe();
        let joining = state.roster.pop().unwrap();
        let pipe_id = joining.pipe.id();
        state.joining.push(joining.pipe);

        let hello = protocol::encode(&Message::Hello(crate::protocol::Hello {
            daemon_id: Some(4),
        }))
        .unwrap();
        handle_event(
            &mut state,
            PipeEvent::Frame {
                pipe: pipe_id,
                payload: hello,
            },
        );

        assert!(state.joining.is_empty());
        assert_eq!(state.roster.len(), 1);
    }
}
