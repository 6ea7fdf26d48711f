//! The dispatcher: mediates between the host and its daemons.
//!
//! Split into a pure scheduling [`core`] and the socket [`run`]time.
//! The same runtime serves both configurations: a separate `tm
//! dispatch` process, or a thread inside the host sharing its address
//! space. Either way it speaks the wire protocol over the pool's
//! control socket.

pub mod core;
mod run;

pub use core::{Core, DaemonEntry, DaemonState, Effect, Input};
pub use run::{DispatchError, DispatcherConfig, run, spawn_thread};
