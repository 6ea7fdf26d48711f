//! Compute profiles: named worker pools and their process-wide
//! registry.
//!
//! A profile owns its listening socket, its daemon inventory (direct
//! mode) or dispatcher link (dispatcher mode), and the bookkeeping for
//! live tasks. The registry is initialized on first configure and torn
//! down when the last profile is reset.

mod control;
mod direct;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Receiver;
use thiserror::Error;

use crate::config::{self, DaemonOptions, DispatcherMode, Limits};
use crate::error::TaskError;
use crate::protocol::ReplyEnvelope;
use crate::serial;
use crate::tls::TlsMaterial;
use crate::transport::{DialUrl, TransportError};

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile {0:?} is already configured")]
    AlreadyConfigured(String),
    #[error("profile {0:?} is not configured")]
    NotFound(String),
    #[error("nothing to do: need daemons (n > 0) or a dial-in url")]
    NothingToDo,
    #[error("{connected} of {expected} daemons dialed in before the timeout")]
    SyncDaemons { expected: usize, connected: usize },
    #[error("dispatcher did not complete its handshake within the timeout")]
    SyncDispatcher,
    #[error("operation requires a dispatcher; this profile runs in direct mode")]
    RequiresDispatcher,
    #[error("pool socket failed; the profile has been reset")]
    Disconnected,
    #[error("dispatcher returned a mismatched control reply")]
    ControlMismatch,
}

/// Everything `configure` needs. `new()` picks up defaults from the
/// loaded config file.
pub struct ProfileOptions {
    /// Local daemons to launch. Advisory: the pool rescales to actual
    /// connections.
    pub n: usize,
    /// Dial-in URL for daemons. When absent, a process-local endpoint
    /// is chosen.
    pub url: Option<String>,
    pub dispatcher: DispatcherMode,
    /// Requeue a crashed daemon's task (dispatcher mode only).
    pub retry: bool,
    pub daemon_options: DaemonOptions,
    /// TLS credentials; auto-generated when a `tls+tcp` url is given
    /// without them.
    pub tls: Option<TlsMaterial>,
    pub tls_password: Option<String>,
    /// Capability names preloaded by daemons.
    pub preload: Vec<String>,
    /// Host-side serialization hooks; their tags are forwarded in the
    /// handshake.
    pub serial: serial::Registry,
    pub limits: Limits,
    /// Binary used for spawned children (tests override this).
    pub binary: Option<PathBuf>,
}

impl ProfileOptions {
    pub fn new() -> Self {
        let config = config::load_or_default();
        Self {
            n: 0,
            url: None,
            dispatcher: config.defaults.dispatcher,
            retry: config.defaults.retry,
            daemon_options: DaemonOptions::default(),
            tls: None,
            tls_password: None,
            preload: config.defaults.preload,
            serial: serial::Registry::new(),
            limits: config.limits,
            binary: None,
        }
    }

    /// `n` local daemons, everything else defaulted.
    pub fn local(n: usize) -> Self {
        Self {
            n,
            ..Self::new()
        }
    }
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatcher-side queue counters, present only in dispatcher mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub awaiting: u32,
    pub executing: u32,
    pub completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileStatus {
    /// Live connection count, refreshed from the transport.
    pub connections: usize,
    pub listening_url: String,
    pub queue: Option<QueueStats>,
    /// Signed daemon-id connect/disconnect events since the previous
    /// query.
    pub events: Vec<i64>,
}

/// The in-host completion side of one submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: Option<u32>,
    rx: Receiver<ReplyEnvelope>,
}

impl TaskHandle {
    pub(crate) fn new(id: Option<u32>, rx: Receiver<ReplyEnvelope>) -> Self {
        Self { id, rx }
    }

    /// The host-assigned identifier; absent in direct mode.
    pub fn task_id(&self) -> Option<u32> {
        self.id
    }

    /// Block until the reply arrives or `timeout` elapses. A timeout
    /// leaves the handle collectable again.
    pub fn collect(&self, timeout: Duration) -> crate::Result<Vec<u8>> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => resolve(reply),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                Err(TaskError::Timeout.into())
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                Err(TaskError::ConnectionReset.into())
            }
        }
    }

    /// Non-blocking poll; `None` while the task is outstanding.
    pub fn try_collect(&self) -> Option<crate::Result<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(reply) => Some(resolve(reply)),
            Err(crossbeam::channel::TryRecvError::Empty) => None,
            Err(crossbeam::channel::TryRecvError::Disconnected) => {
                Some(Err(TaskError::ConnectionReset.into()))
            }
        }
    }
}

fn resolve(reply: ReplyEnvelope) -> crate::Result<Vec<u8>> {
    use crate::protocol::ReplyStatus;
    match reply.status {
        ReplyStatus::Ok => Ok(reply.payload),
        ReplyStatus::UserError => Err(TaskError::Failed(reply.payload).into()),
        ReplyStatus::Cancelled => Err(TaskError::Cancelled.into()),
        ReplyStatus::ConnectionReset => Err(TaskError::ConnectionReset.into()),
        ReplyStatus::Timeout => Err(TaskError::Timeout.into()),
    }
}

enum Mode {
    Direct(direct::DirectPool),
    Dispatcher(control::DispatcherLink),
}

pub(crate) struct Profile {
    name: String,
    url: DialUrl,
    serial: serial::Registry,
    mode: Mode,
}

impl Profile {
    fn submit(&self, payload: Vec<u8>) -> crate::Result<TaskHandle> {
        match &self.mode {
            Mode::Direct(pool) => pool.submit(payload),
            Mode::Dispatcher(link) => link.submit(payload),
        }
    }

    fn status(&self) -> crate::Result<ProfileStatus> {
        match &self.mode {
            Mode::Direct(pool) => Ok(ProfileStatus {
                connections: pool.connections(),
                listening_url: self.url.to_string(),
                queue: None,
                events: Vec::new(),
            }),
            Mode::Dispatcher(link) => {
                let report = link.status_rpc()?;
                let submitted = link.submitted();
                let outstanding = u64::from(report.awaiting) + u64::from(report.executing);
                Ok(ProfileStatus {
                    connections: report.connections as usize,
                    listening_url: self.url.to_string(),
                    queue: Some(QueueStats {
                        awaiting: report.awaiting,
                        executing: report.executing,
                        completed: submitted.saturating_sub(outstanding),
                    }),
                    events: report.events,
                })
            }
        }
    }

    fn cancel(&self, task_id: u32, force: bool) -> crate::Result<bool> {
        match &self.mode {
            Mode::Direct(_) => Err(ProfileError::RequiresDispatcher.into()),
            Mode::Dispatcher(link) => link.cancel(task_id, force),
        }
    }

    fn teardown(&self, signal: bool, join_background: bool) {
        match &self.mode {
            Mode::Direct(pool) => pool.teardown(signal),
            Mode::Dispatcher(link) => link.teardown(signal, join_background),
        }
        tracing::info!(profile = %self.name, "profile reset");
    }
}

// =============================================================================
// Registry
// =============================================================================

struct RegistryState {
    profiles: HashMap<String, Arc<Profile>>,
    reserved: HashSet<String>,
}

static REGISTRY: Mutex<Option<RegistryState>> = Mutex::new(None);

fn with_registry<T>(f: impl FnOnce(&mut RegistryState) -> T) -> T {
    let mut guard = REGISTRY.lock().expect("profile registry lock poisoned");
    let state = guard.get_or_insert_with(|| RegistryState {
        profiles: HashMap::new(),
        reserved: HashSet::new(),
    });
    f(state)
}

fn reserve(name: &str) -> Result<(), ProfileError> {
    with_registry(|state| {
        if state.profiles.contains_key(name) || !state.reserved.insert(name.to_string()) {
            return Err(ProfileError::AlreadyConfigured(name.to_string()));
        }
        Ok(())
    })
}

fn unreserve(name: &str) {
    with_registry(|state| {
        state.reserved.remove(name);
    });
}

fn commit(name: &str, profile: Profile) {
    with_registry(|state| {
        state.reserved.remove(name);
        state.profiles.insert(name.to_string(), Arc::new(profile));
    });
}

fn get(name: &str) -> Result<Arc<Profile>, ProfileError> {
    with_registry(|state| {
        state
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))
    })
}

fn remove(name: &str) -> Option<Arc<Profile>> {
    let mut guard = REGISTRY.lock().expect("profile registry lock poisoned");
    let state = guard.as_mut()?;
    let removed = state.profiles.remove(name);
    if removed.is_some() && state.profiles.is_empty() && state.reserved.is_empty() {
        // Last profile reset: drop registry state and the RNG cursor.
        *guard = None;
        crate::rng::teardown_process_cursor();
    }
    removed
}

/// Host-side transport failure: tear the profile down without waiting
/// for the caller. Invoked from the demux thread, so background joins
/// are skipped.
pub(crate) fn implicit_reset(name: &str) {
    if let Some(profile) = remove(name) {
        tracing::warn!(profile = name, "pool socket failed; resetting profile");
        profile.teardown(false, false);
    }
}

// =============================================================================
// Public operations
// =============================================================================

/// Create and start the named profile. Fails `AlreadyConfigured` if it
/// exists; on any launch failure the partial state is torn down and the
/// registry is left unchanged.
pub fn configure(name: &str, options: ProfileOptions) -> crate::Result<()> {
    if options.n == 0 && options.url.is_none() {
        return Err(ProfileError::NothingToDo.into());
    }
    reserve(name)?;

    match build(name, &options) {
        Ok(profile) => {
            tracing::info!(profile = name, url = %profile.url, "profile configured");
            commit(name, profile);
            Ok(())
        }
        Err(err) => {
            unreserve(name);
            Err(err)
        }
    }
}

fn build(name: &str, options: &ProfileOptions) -> crate::Result<Profile> {
    let user_url = match &options.url {
        Some(raw) => Some(DialUrl::parse(raw).map_err(TransportError::from)?),
        None => None,
    };

    let mode = if options.dispatcher.uses_dispatcher() {
        Mode::Dispatcher(control::DispatcherLink::build(name, options, user_url)?)
    } else {
        Mode::Direct(direct::DirectPool::build(name, options, user_url)?)
    };

    let url = match &mode {
        Mode::Dispatcher(link) => link.daemon_url().clone(),
        Mode::Direct(pool) => pool.url().clone(),
    };

    Ok(Profile {
        name: name.to_string(),
        url,
        serial: options.serial.clone(),
        mode,
    })
}

/// Submit an opaque payload; the handle resolves asynchronously.
pub fn submit(name: &str, payload: impl Into<Vec<u8>>) -> crate::Result<TaskHandle> {
    let profile = get(name)?;
    profile.submit(payload.into())
}

/// Submit a value through the registered serialization hook for
/// `class_tag`.
pub fn submit_tagged(name: &str, class_tag: &str, value: &[u8]) -> crate::Result<TaskHandle> {
    let profile = get(name)?;
    let payload = profile.serial.encode_tagged(class_tag, value)?;
    profile.submit(payload)
}

pub fn status(name: &str) -> crate::Result<ProfileStatus> {
    let profile = get(name)?;
    profile.status()
}

/// Cancel a task. Returns whether it was cancelled before dispatch;
/// with `force`, an executing task's daemon is restarted. Idempotent.
pub fn cancel(name: &str, task_id: u32, force: bool) -> crate::Result<bool> {
    let profile = get(name)?;
    profile.cancel(task_id, force)
}

/// Tear the profile down. With `signal`, connected daemons first
/// receive the in-band exit sentinel. Outstanding tasks resolve with a
/// connection-reset error.
pub fn reset(name: &str, signal: bool) -> crate::Result<()> {
    let profile = remove(name).ok_or_else(|| ProfileError::NotFound(name.to_string()))?;
    profile.teardown(signal, true);
    Ok(())
}

/// Names of all configured profiles.
pub fn profile_names() -> Vec<String> {
    with_registry(|state| state.profiles.keys().cloned().collect())
}
