//! Listening sockets with a nonblocking accept loop.

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Sender;

use super::pipe::{self, PipeEvent};
use super::url::DialUrl;
use super::TransportError;
use crate::config::Limits;

enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A bound dial-in endpoint. Accepted connections are announced as
/// [`PipeEvent::Connected`] on the supplied event channel.
pub struct Listener {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    url: DialUrl,
    ipc_path: Option<PathBuf>,
}

impl Listener {
    /// Bind `url` and start accepting. Port 0 is resolved here; the
    /// returned listener's [`Listener::url`] carries the bound port.
    pub fn bind(
        url: &DialUrl,
        tls: Option<Arc<rustls::ServerConfig>>,
        events: Sender<PipeEvent>,
        limits: &Limits,
    ) -> Result<Listener, TransportError> {
        let mut bound_url = url.clone();
        let mut ipc_path = None;

        let socket = match url {
            DialUrl::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))?;
                bound_url = url.with_port(listener.local_addr()?.port());
                ListenSocket::Tcp(listener)
            }
            DialUrl::TlsTcp { host, port } => {
                if tls.is_none() {
                    return Err(TransportError::TlsConfigMissing);
                }
                let listener = TcpListener::bind((host.as_str(), *port))?;
                bound_url = url.with_port(listener.local_addr()?.port());
                ListenSocket::Tcp(listener)
            }
            DialUrl::Ipc { path } => {
                // A stale socket file from a dead process blocks rebinding.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                restrict_socket_permissions(path);
                ipc_path = Some(path.clone());
                ListenSocket::Unix(listener)
            }
            DialUrl::Abstract { name } => ListenSocket::Unix(bind_abstract(name)?),
        };

        let tls = if url.is_tls() { tls } else { None };
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_poll = Duration::from_millis(limits.accept_poll_ms);
        let limits = limits.clone();

        let join = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                run_accept_loop(socket, tls, events, shutdown, accept_poll, &limits);
            })
        };

        Ok(Listener {
            shutdown,
            join: Some(join),
            url: bound_url,
            ipc_path,
        })
    }

    pub fn url(&self) -> &DialUrl {
        &self.url
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        if let Some(path) = self.ipc_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_accept_loop(
    socket: ListenSocket,
    tls: Option<Arc<rustls::ServerConfig>>,
    events: Sender<PipeEvent>,
    shutdown: Arc<AtomicBool>,
    accept_poll: Duration,
    limits: &Limits,
) {
    let nonblocking = match &socket {
        ListenSocket::Tcp(listener) => listener.set_nonblocking(true),
        ListenSocket::Unix(listener) => listener.set_nonblocking(true),
    };
    if let Err(err) = nonblocking {
        tracing::error!("listener failed to set nonblocking: {err}");
        return;
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let accepted = match &socket {
            ListenSocket::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => match &tls {
                    Some(config) => rustls::ServerConnection::new(Arc::clone(config))
                        .map_err(|err| {
                            tracing::warn!("tls accept failed: {err}");
                        })
                        .ok()
                        .and_then(|conn| {
                            pipe::spawn_tls_server(conn, stream, events.clone(), limits).ok()
                        }),
                    None => pipe::spawn_tcp(stream, events.clone(), limits).ok(),
                },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(accept_poll);
                    continue;
                }
                Err(err) => {
                    tracing::warn!("accept error: {err}");
                    std::thread::sleep(accept_poll);
                    continue;
                }
            },
            ListenSocket::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => pipe::spawn_unix(stream, events.clone(), limits).ok(),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(accept_poll);
                    continue;
                }
                Err(err) => {
                    tracing::warn!("accept error: {err}");
                    std::thread::sleep(accept_poll);
                    continue;
                }
            },
        };

        if let Some(pipe) = accepted
            && events.send(PipeEvent::Connected(pipe)).is_err()
        {
            break;
        }
    }
}

fn restrict_socket_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> Result<UnixListener, TransportError> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    Ok(UnixListener::bind_addr(&addr)?)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> Result<UnixListener, TransportError> {
    Err(TransportError::UnsupportedScheme("abstract"))
}

#[cfg(test)]
mod tests {
    use super::super::pipe::dial;
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn wildcard_port_is_resolved_at_bind() {
        let (tx, _rx) = unbounded();
        let url = DialUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&url, None, tx, &Limits::default()).unwrap();
        assert_ne!(listener.url().port(), Some(0));
    }

    #[test]
    fn accepts_and_frames_roundtrip() {
        let (listen_tx, listen_rx) = unbounded();
        let (dial_tx, dial_rx) = unbounded();
        let limits = Limits::default();

        let url = DialUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&url, None, listen_tx, &limits).unwrap();

        let client = dial(listener.url(), None, dial_tx, &limits).unwrap();
        let accepted = match listen_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipeEvent::Connected(pipe) => pipe,
            other => panic!("expected connect, got {other:?}"),
        };

        client
            .send(b"ping".to_vec(), Duration::from_secs(1))
            .unwrap();
        match listen_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipeEvent::Frame { payload, .. } => assert_eq!(payload, b"ping"),
            other => panic!("expected frame, got {other:?}"),
        }

        accepted
            .send(b"pong".to_vec(), Duration::from_secs(1))
            .unwrap();
        match dial_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipeEvent::Frame { payload, .. } => assert_eq!(payload, b"pong"),
            other => panic!("expected frame, got {other:?}"),
        }

        // Closing one end surfaces as Closed on the other.
        client.close();
        loop {
            match listen_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                PipeEvent::Closed { pipe } => {
                    assert_eq!(pipe, accepted.id());
                    break;
                }
                _ => continue,
            }
        }
    }
}
