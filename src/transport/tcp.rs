//! TCP mesh transport
//!
//! Every host listens on its own address from the hostfile. Host `i`
//! dials every host `j < i` and accepts every host `j > i`, so each pair
//! shares exactly one connection. Each connection has a writer task fed by
//! a bounded channel and a reader task that delivers into the mailbox.
//!
//! The network runs on a private tokio runtime. `send` is called from
//! ordinary threads and must not be called from inside an async context.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::wire::{self, Frame, FrameKind, Handshake, PROTOCOL_VERSION};
use super::{check_send, Completion, Mailbox, Transport, TransportError};
use crate::error::{Error, Result};
use crate::tag::Tag;
use crate::topology::HostId;

/// Time given to writer tasks to push `Abort` frames before exiting
const ABORT_GRACE: Duration = Duration::from_millis(200);

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Settings for joining a TCP group
#[derive(Debug, Clone)]
pub struct TcpSettings {
    /// This host's index into `addresses`
    pub host_id: HostId,

    /// Listen address of every host, indexed by host id
    pub addresses: Vec<SocketAddr>,

    /// Identifier shared by all hosts of one job
    pub job_id: String,

    /// Deadline for forming the whole mesh
    pub connect_timeout: Duration,

    /// How long `shutdown` waits for peers to leave
    pub linger: Duration,

    /// Frames buffered per peer before `send` blocks
    pub send_queue_depth: usize,

    /// Worker threads of the network runtime
    pub io_threads: usize,
}

impl TcpSettings {
    pub fn new(host_id: HostId, addresses: Vec<SocketAddr>, job_id: impl Into<String>) -> Self {
        Self {
            host_id,
            addresses,
            job_id: job_id.into(),
            connect_timeout: Duration::from_secs(30),
            linger: Duration::from_secs(10),
            send_queue_depth: 64,
            io_threads: 2,
        }
    }

    fn host_count(&self) -> usize {
        self.addresses.len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Work item for a peer's writer task
enum Outbound {
    Data {
        tag: Tag,
        payload: Bytes,
        completion: Completion,
    },
    Abort {
        code: i32,
        reason: String,
    },
    Goodbye,
}

/// State reachable from connection tasks
struct Shared {
    host_id: HostId,
    mailbox: Mailbox,
    closing: AtomicBool,
    links: RwLock<Vec<Option<mpsc::Sender<Outbound>>>>,
}

/// Background tasks of one peer connection
struct PeerTasks {
    peer: HostId,
    connected_at: Instant,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

// ─────────────────────────────────────────────────────────────────
// TCP Transport
// ─────────────────────────────────────────────────────────────────

/// One host's endpoint in a TCP mesh
pub struct TcpTransport {
    shared: Arc<Shared>,
    host_count: usize,
    local_addr: SocketAddr,
    linger: Duration,
    tasks: Mutex<Vec<PeerTasks>>,
    runtime: Mutex<Option<Runtime>>,
    shut_down: AtomicBool,
    claimed: AtomicBool,
}

impl TcpTransport {
    /// Bind this host's listen address and form the mesh
    pub fn connect(settings: TcpSettings) -> Result<Self> {
        let addr = *settings.addresses.get(settings.host_id).ok_or_else(|| {
            Error::config_field_invalid(
                "host.id",
                format!(
                    "host id {} has no entry in a hostfile of {} addresses",
                    settings.host_id,
                    settings.host_count()
                ),
            )
        })?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| Error::connection_failed(addr.to_string(), format!("bind failed: {}", e)))?;
        Self::connect_with(settings, listener)
    }

    /// Form the mesh using an already bound listener
    pub fn connect_with(settings: TcpSettings, listener: std::net::TcpListener) -> Result<Self> {
        let host_count = settings.host_count();
        if settings.host_id >= host_count {
            return Err(Error::config_field_invalid(
                "host.id",
                format!(
                    "host id {} is outside a group of {} hosts",
                    settings.host_id, host_count
                ),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.io_threads.max(2))
            .thread_name("fleetlink-net")
            .enable_all()
            .build()?;

        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        info!(
            host_id = settings.host_id,
            host_count,
            addr = %local_addr,
            job_id = %settings.job_id,
            "Joining TCP group"
        );

        let started = Instant::now();
        let streams = runtime.block_on(establish(&settings, listener))?;

        let shared = Arc::new(Shared {
            host_id: settings.host_id,
            mailbox: Mailbox::new(),
            closing: AtomicBool::new(false),
            links: RwLock::new(vec![None; host_count]),
        });

        let tasks = streams
            .into_iter()
            .map(|(peer, stream)| {
                spawn_link(&runtime, &shared, peer, stream, settings.send_queue_depth)
            })
            .collect::<Vec<_>>();

        info!(
            host_id = settings.host_id,
            peers = tasks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "TCP group formed"
        );

        Ok(Self {
            shared,
            host_count,
            local_addr,
            linger: settings.linger,
            tasks: Mutex::new(tasks),
            runtime: Mutex::new(Some(runtime)),
            shut_down: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        })
    }

    /// Address this host listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for TcpTransport {
    fn host_id(&self) -> HostId {
        self.shared.host_id
    }

    fn host_count(&self) -> usize {
        self.host_count
    }

    fn mailbox(&self) -> &Mailbox {
        &self.shared.mailbox
    }

    fn send(&self, dest: HostId, tag: Tag, payload: Bytes) -> std::result::Result<Completion, TransportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        check_send(self.host_count, dest, tag, payload.len())?;

        let size = payload.len();
        if dest == self.shared.host_id {
            self.shared.mailbox.deliver(dest, tag, payload);
            return Ok(Completion::finished(None, size));
        }

        let tx = self.shared.links.read()[dest]
            .clone()
            .ok_or_else(|| TransportError::ConnectionLost {
                host_id: dest,
                message: "no connection".to_string(),
            })?;

        let completion = Completion::new();
        tx.blocking_send(Outbound::Data {
            tag,
            payload,
            completion: completion.clone(),
        })
        .map_err(|_| TransportError::ConnectionLost {
            host_id: dest,
            message: "writer stopped".to_string(),
        })?;

        trace!(dest, tag, size, "Queued frame");
        Ok(completion)
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        error!(host_id = self.shared.host_id, code, "Aborting TCP group: {}", reason);
        self.shared.closing.store(true, Ordering::Release);
        self.shared.mailbox.close(TransportError::Aborted {
            host_id: self.shared.host_id,
            code,
        });
        broadcast_abort(&self.shared, code, reason);
        std::thread::sleep(ABORT_GRACE);
        std::process::exit(code)
    }

    fn shutdown(&self) -> std::result::Result<(), TransportError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.closing.store(true, Ordering::Release);

        let senders: Vec<_> = self
            .shared
            .links
            .write()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for tx in &senders {
            let _ = tx.blocking_send(Outbound::Goodbye);
        }
        drop(senders);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let linger = self.linger;
        let host_id = self.shared.host_id;

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.block_on(async move {
                for t in tasks {
                    let _ = t.writer.await;
                    if tokio::time::timeout(linger, t.reader).await.is_err() {
                        warn!(host_id, peer = t.peer, "Peer did not leave in time");
                    }
                    debug!(
                        host_id,
                        peer = t.peer,
                        connected_secs = t.connected_at.elapsed().as_secs(),
                        "Connection closed"
                    );
                }
            });
            runtime.shutdown_timeout(Duration::from_millis(100));
        }

        self.shared.mailbox.close(TransportError::ShutDown);
        info!(host_id, "Left TCP group");
        Ok(())
    }

    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn backend(&self) -> &'static str {
        "tcp"
    }
}

// ─────────────────────────────────────────────────────────────────
// Mesh Formation
// ─────────────────────────────────────────────────────────────────

/// Connect to every peer; returns one handshaken stream per peer
async fn establish(
    settings: &TcpSettings,
    listener: std::net::TcpListener,
) -> Result<Vec<(HostId, TcpStream)>> {
    let listener = TcpListener::from_std(listener)?;
    let listen_addr = listener.local_addr()?;
    let expected_inbound = settings.host_count() - settings.host_id - 1;

    let formed = tokio::time::timeout(settings.connect_timeout, async {
        tokio::try_join!(
            accept_peers(listener, settings, expected_inbound),
            dial_peers(settings)
        )
    })
    .await
    .map_err(|_| Error::ConnectionTimeout {
        addr: listen_addr.to_string(),
        timeout_secs: settings.connect_timeout.as_secs(),
    })?;

    let (mut inbound, outbound) = formed?;
    inbound.extend(outbound);
    inbound.sort_by_key(|(peer, _)| *peer);
    Ok(inbound)
}

/// Accept connections from higher-numbered hosts
async fn accept_peers(
    listener: TcpListener,
    settings: &TcpSettings,
    expected: usize,
) -> Result<Vec<(HostId, TcpStream)>> {
    let mut peers: Vec<(HostId, TcpStream)> = Vec::with_capacity(expected);

    while peers.len() < expected {
        let (mut stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!(peer_addr = %peer_addr, "Incoming peer connection");

        let hello = match tokio::time::timeout(Duration::from_secs(5), wire::read_handshake(&mut stream)).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                debug!(peer_addr = %peer_addr, error = %e, "Inbound handshake failed");
                continue;
            }
            Err(_) => {
                debug!(peer_addr = %peer_addr, "Inbound handshake timed out");
                continue;
            }
        };

        let verdict = check_hello(settings, &hello).and_then(|peer| {
            if peers.iter().any(|(p, _)| *p == peer) {
                Err(format!("host {} is already connected", peer))
            } else {
                Ok(peer)
            }
        });

        match verdict {
            Ok(peer) => {
                let ack = Handshake::HelloAck {
                    host_id: settings.host_id,
                    job_id: settings.job_id.clone(),
                    protocol_version: PROTOCOL_VERSION,
                };
                if let Err(e) = wire::write_handshake(&mut stream, &ack).await {
                    debug!(peer, error = %e, "Failed to acknowledge peer");
                    continue;
                }
                info!(host_id = settings.host_id, peer, "Peer connected (inbound)");
                peers.push((peer, stream));
            }
            Err(reason) => {
                warn!(peer_addr = %peer_addr, reason = %reason, "Rejecting peer");
                let _ = wire::write_handshake(&mut stream, &Handshake::Reject { reason }).await;
            }
        }
    }

    Ok(peers)
}

/// Validate a dialing peer's `Hello`, returning its host id
fn check_hello(settings: &TcpSettings, msg: &Handshake) -> std::result::Result<HostId, String> {
    match msg {
        Handshake::Hello {
            host_id,
            host_count,
            job_id,
            protocol_version,
        } => {
            if !PROTOCOL_VERSION.is_compatible_with(protocol_version) {
                return Err(format!(
                    "protocol version {} is not compatible with {}",
                    protocol_version, PROTOCOL_VERSION
                ));
            }
            if *job_id != settings.job_id {
                return Err(format!(
                    "job mismatch: expected {}, got {}",
                    settings.job_id, job_id
                ));
            }
            if *host_count != settings.host_count() {
                return Err(format!(
                    "group size mismatch: expected {}, got {}",
                    settings.host_count(),
                    host_count
                ));
            }
            if *host_id <= settings.host_id || *host_id >= settings.host_count() {
                return Err(format!(
                    "host {} must not dial host {}",
                    host_id, settings.host_id
                ));
            }
            Ok(*host_id)
        }
        other => Err(format!("expected HELLO, got {}", other.type_name())),
    }
}

/// Dial every lower-numbered host
async fn dial_peers(settings: &TcpSettings) -> Result<Vec<(HostId, TcpStream)>> {
    let mut peers = Vec::with_capacity(settings.host_id);
    for peer in 0..settings.host_id {
        let stream = dial_peer(settings, peer).await?;
        info!(host_id = settings.host_id, peer, "Peer connected (outbound)");
        peers.push((peer, stream));
    }
    Ok(peers)
}

/// Dial one host until it answers, backing off between attempts
async fn dial_peer(settings: &TcpSettings, peer: HostId) -> Result<TcpStream> {
    let addr = settings.addresses[peer];
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: None,
        ..Default::default()
    };
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(mut stream) => match hello_peer(settings, peer, &mut stream).await {
                Ok(Some(())) => return Ok(stream),
                Ok(None) => debug!(peer, "Handshake interrupted, retrying"),
                Err(e) => return Err(e),
            },
            Err(e) => trace!(peer, addr = %addr, attempt = attempts, error = %e, "Peer not reachable yet"),
        }

        let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
        tokio::time::sleep(delay).await;
    }
}

/// Send `Hello` and check the answer. `Ok(None)` means the connection
/// dropped mid-handshake and the dial should be retried.
async fn hello_peer(
    settings: &TcpSettings,
    peer: HostId,
    stream: &mut TcpStream,
) -> Result<Option<()>> {
    let hello = Handshake::Hello {
        host_id: settings.host_id,
        host_count: settings.host_count(),
        job_id: settings.job_id.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    if wire::write_handshake(stream, &hello).await.is_err() {
        return Ok(None);
    }

    let reply = match tokio::time::timeout(Duration::from_secs(5), wire::read_handshake(stream)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) | Err(_) => return Ok(None),
    };

    check_ack(settings, peer, reply).map(Some)
}

/// Validate the accepting host's answer to our `Hello`
fn check_ack(settings: &TcpSettings, peer: HostId, reply: Handshake) -> Result<()> {
    let addr = settings.addresses[peer];
    match reply {
        Handshake::HelloAck {
            host_id,
            job_id,
            protocol_version,
        } => {
            if !PROTOCOL_VERSION.is_compatible_with(&protocol_version) {
                return Err(Error::ProtocolVersion {
                    expected: PROTOCOL_VERSION.to_string(),
                    actual: protocol_version.to_string(),
                });
            }
            if job_id != settings.job_id {
                return Err(Error::JobMismatch {
                    expected: settings.job_id.clone(),
                    actual: job_id,
                });
            }
            if host_id != peer {
                return Err(Error::malformed(format!(
                    "{} answered as host {}, expected host {}",
                    addr, host_id, peer
                )));
            }
            Ok(())
        }
        Handshake::Reject { reason } => Err(Error::connection_failed(addr.to_string(), reason)),
        other => Err(Error::malformed(format!(
            "expected HELLO_ACK from {}, got {}",
            addr,
            other.type_name()
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Tasks
// ─────────────────────────────────────────────────────────────────

fn spawn_link(
    runtime: &Runtime,
    shared: &Arc<Shared>,
    peer: HostId,
    stream: TcpStream,
    queue_depth: usize,
) -> PeerTasks {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::channel(queue_depth.max(1));
    shared.links.write()[peer] = Some(write_tx);

    let writer = runtime.spawn(write_loop(peer, write_half, write_rx));
    let reader = runtime.spawn(read_loop(Arc::clone(shared), peer, read_half));

    PeerTasks {
        peer,
        connected_at: Instant::now(),
        writer,
        reader,
    }
}

/// Background task: writes queued frames to a peer
async fn write_loop(peer: HostId, mut writer: OwnedWriteHalf, mut write_rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = write_rx.recv().await {
        match out {
            Outbound::Data {
                tag,
                payload,
                completion,
            } => {
                if completion.is_cancelled() {
                    trace!(peer, tag, "Skipping cancelled send");
                    continue;
                }
                let size = payload.len();
                let frame = Frame::data(tag, payload);
                let written = async {
                    wire::write_frame(&mut writer, &frame).await?;
                    writer.flush().await?;
                    Ok::<_, anyhow::Error>(())
                }
                .await;
                match written {
                    Ok(()) => {
                        completion.complete(None, size);
                    }
                    Err(e) => {
                        debug!(peer, error = %e, "Peer write error");
                        completion.fail(TransportError::WriteFailed {
                            host_id: peer,
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
            Outbound::Abort { code, reason } => {
                let _ = wire::write_frame(&mut writer, &Frame::abort(code, &reason)).await;
                let _ = writer.flush().await;
                break;
            }
            Outbound::Goodbye => {
                let _ = wire::write_frame(&mut writer, &Frame::goodbye()).await;
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                break;
            }
        }
    }

    // Sends still queued behind a failure never reach the peer
    write_rx.close();
    while let Ok(out) = write_rx.try_recv() {
        if let Outbound::Data { completion, .. } = out {
            completion.fail(TransportError::WriteFailed {
                host_id: peer,
                message: "connection closed".to_string(),
            });
        }
    }
}

/// Background task: delivers frames from a peer into the mailbox
async fn read_loop(shared: Arc<Shared>, peer: HostId, mut reader: OwnedReadHalf) {
    loop {
        match wire::read_frame(&mut reader).await {
            Ok(Some(frame)) => match frame.kind {
                FrameKind::Data => shared.mailbox.deliver(peer, frame.tag, frame.payload),
                FrameKind::Abort => {
                    let reason = String::from_utf8_lossy(&frame.payload);
                    error!(
                        host_id = shared.host_id,
                        peer,
                        code = frame.tag,
                        "Group aborted by peer: {}",
                        reason
                    );
                    shared.mailbox.close(TransportError::Aborted {
                        host_id: peer,
                        code: frame.tag,
                    });
                    std::process::exit(frame.tag);
                }
                FrameKind::Goodbye => {
                    debug!(host_id = shared.host_id, peer, "Peer left the group");
                    return;
                }
            },
            Ok(None) => {
                connection_lost(&shared, peer, "connection closed".to_string()).await;
                return;
            }
            Err(e) => {
                connection_lost(&shared, peer, e.to_string()).await;
                return;
            }
        }
    }
}

/// A peer vanished without saying goodbye: take the group down
async fn connection_lost(shared: &Shared, peer: HostId, message: String) {
    if shared.closing.load(Ordering::Acquire) {
        debug!(host_id = shared.host_id, peer, "Connection closed during shutdown");
        return;
    }

    let err = TransportError::ConnectionLost { host_id: peer, message };
    error!(
        host_id = shared.host_id,
        peer,
        code = err.code(),
        "Transport failure: {}",
        err
    );
    shared.mailbox.close(err.clone());
    broadcast_abort(shared, err.code(), &err.to_string());
    tokio::time::sleep(ABORT_GRACE).await;
    std::process::exit(err.code());
}

/// Queue an `Abort` frame to every connected peer without blocking
fn broadcast_abort(shared: &Shared, code: i32, reason: &str) {
    for tx in shared.links.read().iter().flatten() {
        let _ = tx.try_send(Outbound::Abort {
            code,
            reason: reason.to_string(),
        });
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
