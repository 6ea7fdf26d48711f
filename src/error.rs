use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatcher::DispatchError;
use crate::profile::ProfileError;
use crate::protocol::ProtoError;
use crate::rng::SeedError;
use crate::serial::HookError;
use crate::tls::TlsError;
use crate::transport::TransportError;
use crate::worker::WorkerError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// How one task resolved, when it did not resolve with a result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The task produced an error object; the payload is surfaced
    /// untouched.
    #[error("task failed: {}", String::from_utf8_lossy(.0))]
    Failed(Vec<u8>),
    #[error("task cancelled")]
    Cancelled,
    /// The executing daemon crashed or the pool was reset (code 19).
    #[error("connection reset (code 19)")]
    ConnectionReset,
    #[error("timed out waiting for the task")]
    Timeout,
}

impl TaskError {
    /// Stable numeric code, aligned with the wire reply status.
    pub fn code(&self) -> u8 {
        match self {
            TaskError::Failed(_) => 1,
            TaskError::Cancelled => 2,
            TaskError::Timeout => 3,
            TaskError::ConnectionReset => 19,
        }
    }

    /// The untouched error payload, when the task supplied one.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            TaskError::Failed(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Crate-level convenience error: a thin wrapper over the capability
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Task(TaskError::Timeout) => Transience::Retryable,
            Error::Transport(TransportError::Backpressure) => Transience::Retryable,
            Error::Profile(ProfileError::SyncDaemons { .. })
            | Error::Profile(ProfileError::SyncDispatcher) => Transience::Retryable,
            Error::Io(_) | Error::Transport(_) | Error::Dispatch(_) => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    /// The task-failure code, for errors that resolve a task.
    pub fn task_code(&self) -> Option<u8> {
        match self {
            Error::Task(err) => Some(err.code()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reset_surfaces_code_19() {
        let err = Error::from(TaskError::ConnectionReset);
        assert_eq!(err.task_code(), Some(19));
        assert_eq!(err.transience(), Transience::Permanent);
    }

    #[test]
    fn timeout_is_retryable() {
        let err = Error::from(TaskError::Timeout);
        assert!(err.transience().is_retryable());
        assert_eq!(err.task_code(), Some(3));
    }

    #[test]
    fn failed_task_keeps_its_payload() {
        let err = TaskError::Failed(b"\xde\xad".to_vec());
        assert_eq!(err.payload(), Some(&b"\xde\xad"[..]));
        assert_eq!(err.code(), 1);
    }
}
