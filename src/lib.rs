#![forbid(unsafe_code)]

//! taskmill: a host-side pool manager and dispatcher for persistent
//! worker daemons.
//!
//! The host configures named profiles (worker pools), submits opaque
//! task payloads, and collects replies asynchronously. A dispatcher
//! (child process or thread) provides FIFO queueing, idle-daemon
//! matching, retry, and cancellation; direct mode fans tasks out
//! round-robin without one.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod launch;
mod paths;
pub mod profile;
pub mod protocol;
pub mod rng;
pub mod serial;
pub mod telemetry;
pub mod tls;
pub mod transport;
pub mod worker;

pub use error::{Error, TaskError, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// The host-facing surface at the crate root.
pub use profile::{
    DEFAULT_PROFILE, ProfileError, ProfileOptions, ProfileStatus, QueueStats, TaskHandle, cancel,
    configure, profile_names, reset, status, submit, submit_tagged,
};
