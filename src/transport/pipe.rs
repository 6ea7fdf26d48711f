//! Framed duplex pipes.
//!
//! A pipe owns two background threads (one for split-able plain sockets,
//! a single poll-loop thread for TLS streams, which cannot be split).
//! Inbound frames and the final disconnect are delivered as
//! [`PipeEvent`]s on the channel supplied at spawn time; outbound frames
//! go through a bounded queue so senders see back-pressure instead of
//! unbounded buffering.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};

use super::frame::{FrameReader, encode_frame, take_frame};
use super::url::DialUrl;
use super::TransportError;
use crate::config::Limits;

pub type PipeId = u64;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

fn next_pipe_id() -> PipeId {
    NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub enum PipeEvent {
    /// A new connection was accepted by a [`super::Listener`].
    Connected(Pipe),
    /// One complete frame arrived on the given pipe.
    Frame { pipe: PipeId, payload: Vec<u8> },
    /// The pipe disconnected. Emitted exactly once, after the last frame.
    Closed { pipe: PipeId },
}

/// Handle to one framed connection. Cloneable; dropping the last clone
/// closes the connection.
#[derive(Debug, Clone)]
pub struct Pipe {
    id: PipeId,
    out_tx: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl Pipe {
    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a frame for sending. Blocks up to `timeout` when the
    /// outbound queue is full.
    pub fn send(&self, payload: Vec<u8>, timeout: Duration) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::PipeClosed);
        }
        self.out_tx
            .send_timeout(payload, timeout)
            .map_err(|err| match err {
                crossbeam::channel::SendTimeoutError::Timeout(_) => TransportError::Backpressure,
                crossbeam::channel::SendTimeoutError::Disconnected(_) => {
                    TransportError::PipeClosed
                }
            })
    }

    /// Ask the background threads to tear the connection down. The
    /// owning event channel still receives the final `Closed` event.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

const WRITER_TICK: Duration = Duration::from_millis(25);

/// Spawn reader + writer threads over a socket that can be split with
/// `try_clone`. `shutdown` must unblock the reader (socket shutdown).
fn spawn_split<R, W>(
    reader: R,
    writer: W,
    shutdown: impl Fn() + Send + 'static,
    events: Sender<PipeEvent>,
    limits: &Limits,
) -> Pipe
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let id = next_pipe_id();
    let (out_tx, out_rx) = bounded::<Vec<u8>>(limits.send_queue_depth);
    let closed = Arc::new(AtomicBool::new(false));
    let max_frame_bytes = limits.max_frame_bytes;

    {
        let closed = Arc::clone(&closed);
        std::thread::spawn(move || {
            run_writer(writer, out_rx, closed, shutdown, max_frame_bytes);
        });
    }
    {
        let closed = Arc::clone(&closed);
        std::thread::spawn(move || {
            run_reader(reader, id, events, closed, max_frame_bytes);
        });
    }

    Pipe { id, out_tx, closed }
}

fn run_writer<W: Write>(
    mut writer: W,
    out_rx: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    shutdown: impl Fn(),
    max_frame_bytes: usize,
) {
    loop {
        if closed.load(Ordering::Acquire) {
            // Frames queued before the close (e.g. the exit sentinel on
            // a signalled reset) still go out.
            drain_writes(&mut writer, &out_rx, max_frame_bytes);
            break;
        }
        match out_rx.recv_timeout(WRITER_TICK) {
            Ok(payload) => {
                if write_frame(&mut writer, &payload, max_frame_bytes).is_err() {
                    break;
                }
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    closed.store(true, Ordering::Release);
    shutdown();
}

fn write_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    max_frame_bytes: usize,
) -> std::io::Result<()> {
    let frame = match encode_frame(payload, max_frame_bytes) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!("dropping unencodable frame: {err}");
            return Ok(());
        }
    };
    writer.write_all(&frame)?;
    writer.flush()
}

fn drain_writes<W: Write>(writer: &mut W, out_rx: &Receiver<Vec<u8>>, max_frame_bytes: usize) {
    while let Ok(payload) = out_rx.try_recv() {
        if write_frame(writer, &payload, max_frame_bytes).is_err() {
            break;
        }
    }
}

fn run_reader<R: Read>(
    reader: R,
    id: PipeId,
    events: Sender<PipeEvent>,
    closed: Arc<AtomicBool>,
    max_frame_bytes: usize,
) {
    let mut frames = FrameReader::new(reader, max_frame_bytes);
    loop {
        match frames.read_next() {
            Ok(Some(payload)) => {
                if events.send(PipeEvent::Frame { pipe: id, payload }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                if !closed.load(Ordering::Acquire) {
                    tracing::debug!(pipe = id, "pipe read ended: {err}");
                }
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    let _ = events.send(PipeEvent::Closed { pipe: id });
}

/// Single-threaded poll loop for TLS streams, which cannot be split.
/// The socket must already carry the read timeout that lets one thread
/// alternate reads and writes.
fn run_poll_loop<S: Read + Write>(
    stream: &mut S,
    id: PipeId,
    events: &Sender<PipeEvent>,
    out_rx: &Receiver<Vec<u8>>,
    closed: &AtomicBool,
    max_frame_bytes: usize,
) {
    let mut inbound: Vec<u8> = Vec::new();
    let mut scratch = [0u8; 16 * 1024];
    'io: loop {
        if closed.load(Ordering::Acquire) {
            drain_writes(stream, out_rx, max_frame_bytes);
            break;
        }

        loop {
            match out_rx.try_recv() {
                Ok(payload) => {
                    if write_frame(stream, &payload, max_frame_bytes).is_err() {
                        break 'io;
                    }
                }
                Err(crossbeam::channel::TryRecvError::Empty) => break,
                Err(crossbeam::channel::TryRecvError::Disconnected) => break 'io,
            }
        }

        match stream.read(&mut scratch) {
            Ok(0) => break 'io,
            Ok(n) => {
                inbound.extend_from_slice(&scratch[..n]);
                loop {
                    match take_frame(&mut inbound, max_frame_bytes) {
                        Ok(Some(payload)) => {
                            if events.send(PipeEvent::Frame { pipe: id, payload }).is_err() {
                                break 'io;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(pipe = id, "pipe read ended: {err}");
                            break 'io;
                        }
                    }
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break 'io,
        }
    }
    closed.store(true, Ordering::Release);
    let _ = events.send(PipeEvent::Closed { pipe: id });
}

pub(crate) fn spawn_tcp(
    stream: TcpStream,
    events: Sender<PipeEvent>,
    limits: &Limits,
) -> Result<Pipe, TransportError> {
    stream.set_nonblocking(false)?;
    let _ = stream.set_nodelay(true);
    let reader = stream.try_clone()?;
    let shutdown_handle = stream.try_clone()?;
    Ok(spawn_split(
        reader,
        stream,
        move || {
            let _ = shutdown_handle.shutdown(Shutdown::Both);
        },
        events,
        limits,
    ))
}

pub(crate) fn spawn_unix(
    stream: UnixStream,
    events: Sender<PipeEvent>,
    limits: &Limits,
) -> Result<Pipe, TransportError> {
    stream.set_nonblocking(false)?;
    let reader = stream.try_clone()?;
    let shutdown_handle = stream.try_clone()?;
    Ok(spawn_split(
        reader,
        stream,
        move || {
            let _ = shutdown_handle.shutdown(Shutdown::Both);
        },
        events,
        limits,
    ))
}

pub(crate) fn spawn_tls_server(
    mut conn: rustls::ServerConnection,
    stream: TcpStream,
    events: Sender<PipeEvent>,
    limits: &Limits,
) -> Result<Pipe, TransportError> {
    stream.set_nonblocking(false)?;
    let _ = stream.set_nodelay(true);

    let id = next_pipe_id();
    let (out_tx, out_rx) = bounded::<Vec<u8>>(limits.send_queue_depth);
    let closed = Arc::new(AtomicBool::new(false));
    let max_frame_bytes = limits.max_frame_bytes;

    let thread_closed = Arc::clone(&closed);
    std::thread::spawn(move || {
        let mut sock = stream;
        // The handshake runs on the still-blocking socket: a read
        // timeout mid-handshake would surface as a spurious disconnect.
        while conn.is_handshaking() {
            if let Err(err) = conn.complete_io(&mut sock) {
                tracing::debug!(pipe = id, "tls handshake failed: {err}");
                thread_closed.store(true, Ordering::Release);
                let _ = events.send(PipeEvent::Closed { pipe: id });
                return;
            }
        }
        if sock.set_read_timeout(Some(WRITER_TICK)).is_err() {
            thread_closed.store(true, Ordering::Release);
            let _ = events.send(PipeEvent::Closed { pipe: id });
            return;
        }
        let mut tls = rustls::StreamOwned::new(conn, sock);
        run_poll_loop(&mut tls, id, &events, &out_rx, &thread_closed, max_frame_bytes);
    });

    Ok(Pipe { id, out_tx, closed })
}

/// Dial a URL and return the connected pipe. `tls` is required for
/// `tls+tcp` targets and ignored otherwise.
pub fn dial(
    url: &DialUrl,
    tls: Option<Arc<rustls::ClientConfig>>,
    events: Sender<PipeEvent>,
    limits: &Limits,
) -> Result<Pipe, TransportError> {
    match url {
        DialUrl::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))?;
            spawn_tcp(stream, events, limits)
        }
        DialUrl::TlsTcp { host, port } => {
            let config = tls.ok_or(TransportError::TlsConfigMissing)?;
            let name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| TransportError::InvalidServerName(host.clone()))?;
            let mut conn = rustls::ClientConnection::new(config, name)
                .map_err(crate::tls::TlsError::from)?;
            let stream = TcpStream::connect((host.as_str(), *port))?;
            let _ = stream.set_nodelay(true);

            let id = next_pipe_id();
            let (out_tx, out_rx) = bounded::<Vec<u8>>(limits.send_queue_depth);
            let closed = Arc::new(AtomicBool::new(false));
            let max_frame_bytes = limits.max_frame_bytes;

            let thread_closed = Arc::clone(&closed);
            std::thread::spawn(move || {
                let mut sock = stream;
                while conn.is_handshaking() {
                    if let Err(err) = conn.complete_io(&mut sock) {
                        tracing::debug!(pipe = id, "tls handshake failed: {err}");
                        thread_closed.store(true, Ordering::Release);
                        let _ = events.send(PipeEvent::Closed { pipe: id });
                        return;
                    }
                }
                if sock.set_read_timeout(Some(WRITER_TICK)).is_err() {
                    thread_closed.store(true, Ordering::Release);
                    let _ = events.send(PipeEvent::Closed { pipe: id });
                    return;
                }
                let mut tls = rustls::StreamOwned::new(conn, sock);
                run_poll_loop(&mut tls, id, &events, &out_rx, &thread_closed, max_frame_bytes);
            });

            Ok(Pipe { id, out_tx, closed })
        }
        DialUrl::Ipc { path } => {
            let stream = UnixStream::connect(path)?;
            spawn_unix(stream, events, limits)
        }
        DialUrl::Abstract { name } => dial_abstract(name, events, limits),
    }
}

#[cfg(target_os = "linux")]
fn dial_abstract(
    name: &str,
    events: Sender<PipeEvent>,
    limits: &Limits,
) -> Result<Pipe, TransportError> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = UnixStream::connect_addr(&addr)?;
    spawn_unix(stream, events, limits)
}

#[cfg(not(target_os = "linux"))]
fn dial_abstract(
    _name: &str,
    _events: Sender<PipeEvent>,
    _limits: &Limits,
) -> Result<Pipe, TransportError> {
    Err(TransportError::UnsupportedScheme("abstract"))
}
