//! Message transport: framed duplex pipes over TCP, TLS-over-TCP, and
//! local IPC sockets.
//!
//! The model is the one the daemon loops are written against: a
//! [`Listener`] accepts connections and every connection becomes a
//! [`Pipe`] whose inbound frames arrive on a shared crossbeam channel as
//! [`PipeEvent`]s. Reads happen on per-connection threads; the owner of
//! the event channel stays single-threaded.

use thiserror::Error;

pub mod frame;
mod listener;
mod pipe;
mod url;

pub use frame::{FrameError, FrameReader, FrameWriter, encode_frame, take_frame};
pub use listener::Listener;
pub use pipe::{Pipe, PipeEvent, PipeId, dial};
pub use url::{DialUrl, UrlError};

/// A fresh process-local endpoint: abstract-namespace on Linux, an IPC
/// socket path elsewhere.
pub fn local_url(tag: &str) -> std::io::Result<DialUrl> {
    #[cfg(target_os = "linux")]
    {
        Ok(DialUrl::Abstract {
            name: crate::paths::local_endpoint_name(tag),
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(DialUrl::Ipc {
            path: crate::paths::ipc_socket_path(tag)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error(transparent)]
    Tls(#[from] crate::tls::TlsError),
    #[error("send queue full")]
    Backpressure,
    #[error("pipe closed")]
    PipeClosed,
    #[error("no connected daemons")]
    NoPeers,
    #[error("tls listener requested without server credentials")]
    TlsConfigMissing,
    #[error("{0} urls are not supported on this platform")]
    UnsupportedScheme(&'static str),
    #[error("invalid tls server name {0:?}")]
    InvalidServerName(String),
}
