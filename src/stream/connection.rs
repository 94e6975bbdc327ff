use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::debug;

use super::packet::{Packet, HEADER_SIZE};
use crate::codec::CodecError;
use crate::id::NodeId;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Timeout,
    ReadError,
    WriteError,
    /// The remote violated the framing or handshake protocol.
    ProtocolCorrupted,
    /// The dial itself failed.
    ConnectionError,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DropReason::Timeout => "connection timeout",
            DropReason::ReadError => "read error",
            DropReason::WriteError => "write error",
            DropReason::ProtocolCorrupted => "protocol corrupted by remote node",
            DropReason::ConnectionError => "cannot connect to remote node",
        };
        f.write_str(text)
    }
}

/// Connection lifecycle notifications, delivered to the host.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// Handshake completed; `packet` is the remote's Registration.
    Connected {
        conn: ConnectionHandle,
        packet: Packet,
    },
    /// A data frame arrived after the handshake.
    PacketReceived { from: NodeId, packet: Packet },
    /// A registered connection dropped.
    Dropped {
        remote: NodeId,
        active: bool,
        reason: DropReason,
    },
    /// An outbound dial failed before registration completed.
    PendingError { remote: NodeId, reason: DropReason },
}

#[derive(Debug)]
struct ConnInner {
    active: bool,
    /// The socket's remote endpoint, as observed locally.
    peer_addr: SocketAddr,
    remote: Mutex<NodeId>,
    registration_passed: AtomicBool,
    dropped: AtomicBool,
    send_tx: mpsc::UnboundedSender<Bytes>,
    closed: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ConnEvent>,
}

impl ConnInner {
    /// Idempotent. The first call decides which notification the owner
    /// sees; a passive connection that never finished its handshake drops
    /// silently.
    fn drop_with(self: &Arc<Self>, reason: DropReason) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }

        let remote = *self.remote.lock();
        if self.registration_passed.load(Ordering::Acquire) {
            let _ = self.events.send(ConnEvent::Dropped {
                remote,
                active: self.active,
                reason,
            });
        } else if self.active {
            let _ = self.events.send(ConnEvent::PendingError { remote, reason });
        } else {
            debug!("passive connection dropped before registration: {}", reason);
        }
        self.closed.send_replace(true);
    }
}

/// Shared handle to a live stream connection.
///
/// Sends are pre-serialized and queued; the writer task flushes them in
/// order. After the handshake the handle is identified by the remote id
/// plus its polarity (locally initiated vs accepted).
#[derive(Clone, Debug)]
pub(crate) struct ConnectionHandle {
    inner: Arc<ConnInner>,
}

impl ConnectionHandle {
    pub(crate) fn remote(&self) -> NodeId {
        *self.inner.remote.lock()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner.active
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.inner.dropped.load(Ordering::Acquire)
    }

    /// Queues a packet; returns whether it was accepted. Once accepted,
    /// its eventual fate is opaque to the caller.
    pub(crate) fn send(&self, packet: &Packet) -> bool {
        if self.is_dropped() {
            return false;
        }
        self.inner.send_tx.send(packet.encode()).is_ok()
    }

    /// Drops with a reason, notifying the owner (once).
    pub(crate) fn drop_with(&self, reason: DropReason) {
        self.inner.drop_with(reason);
    }

    /// Closes without notifying the owner; used on host shutdown.
    pub(crate) fn close_silently(&self) {
        self.inner.dropped.store(true, Ordering::Release);
        self.inner.closed.send_replace(true);
    }
}

pub(crate) struct Connection;

impl Connection {
    /// Dials `endpoint` and runs the active side of the handshake: the
    /// Registration packet is queued before the dial so it is the first
    /// frame on the wire.
    pub(crate) fn connect(
        endpoint: SocketAddr,
        remote: NodeId,
        reg_packet: Packet,
        events: mpsc::UnboundedSender<ConnEvent>,
        idle: Duration,
    ) -> ConnectionHandle {
        let (handle, send_rx) = Self::new_handle(true, endpoint, remote, events);
        handle.send(&reg_packet);

        let inner = Arc::clone(&handle.inner);
        tokio::spawn(async move {
            match timeout(idle, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => run_io(stream, inner, send_rx, idle).await,
                Ok(Err(e)) => {
                    debug!("dial to {} failed: {}", endpoint, e);
                    inner.drop_with(DropReason::ConnectionError);
                }
                Err(_) => inner.drop_with(DropReason::Timeout),
            }
        });

        handle
    }

    /// Runs the passive side over an accepted socket. The remote id is
    /// learned from its Registration header.
    pub(crate) fn accept(
        stream: TcpStream,
        events: mpsc::UnboundedSender<ConnEvent>,
        idle: Duration,
    ) -> ConnectionHandle {
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (handle, send_rx) = Self::new_handle(false, peer_addr, NodeId::ZERO, events);
        let inner = Arc::clone(&handle.inner);
        tokio::spawn(run_io(stream, inner, send_rx, idle));
        handle
    }

    fn new_handle(
        active: bool,
        peer_addr: SocketAddr,
        remote: NodeId,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<Bytes>) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let handle = ConnectionHandle {
            inner: Arc::new(ConnInner {
                active,
                peer_addr,
                remote: Mutex::new(remote),
                registration_passed: AtomicBool::new(false),
                dropped: AtomicBool::new(false),
                send_tx,
                closed,
                events,
            }),
        };
        (handle, send_rx)
    }
}

/// Reader loop plus a writer task over one socket, sharing an idle
/// deadline that any successful read or write pushes forward.
async fn run_io(
    stream: TcpStream,
    inner: Arc<ConnInner>,
    mut send_rx: mpsc::UnboundedReceiver<Bytes>,
    idle: Duration,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let writer = {
        let inner = Arc::clone(&inner);
        let last_activity = Arc::clone(&last_activity);
        let mut closed = inner.closed.subscribe();
        tokio::spawn(async move {
            if *closed.borrow() {
                return;
            }
            loop {
                let data = tokio::select! {
                    data = send_rx.recv() => match data {
                        Some(data) => data,
                        None => return,
                    },
                    _ = closed.changed() => return,
                };

                tokio::select! {
                    result = write_half.write_all(&data) => {
                        if let Err(e) = result {
                            debug!("cannot send packet: {}", e);
                            inner.drop_with(DropReason::WriteError);
                            return;
                        }
                        *last_activity.lock() = Instant::now();
                    }
                    _ = closed.changed() => return,
                }
            }
        })
    };

    let mut closed = inner.closed.subscribe();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    'io: while !*closed.borrow() {
        loop {
            match try_extract(&mut buf) {
                Ok(Some(packet)) => {
                    if !handle_frame(&inner, packet) {
                        break 'io;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("invalid frame: {}", e);
                    inner.drop_with(DropReason::ProtocolCorrupted);
                    break 'io;
                }
            }
        }

        let deadline = *last_activity.lock() + idle;
        tokio::select! {
            result = read_half.read_buf(&mut buf) => match result {
                Ok(0) => {
                    inner.drop_with(DropReason::ReadError);
                    break;
                }
                Ok(_) => *last_activity.lock() = Instant::now(),
                Err(e) => {
                    debug!("read failed: {}", e);
                    inner.drop_with(DropReason::ReadError);
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.into()) => {
                if last_activity.lock().elapsed() >= idle {
                    inner.drop_with(DropReason::Timeout);
                    break;
                }
            }
            _ = closed.changed() => break,
        }
    }

    writer.abort();
}

/// Takes one complete frame off the buffer, if present.
fn try_extract(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = Packet::decode_header(&buf[..HEADER_SIZE])?;
    if buf.len() < HEADER_SIZE + header.data_size {
        return Ok(None);
    }
    let mut frame = buf.split_to(HEADER_SIZE + header.data_size);
    let data = frame.split_off(HEADER_SIZE).to_vec();
    Ok(Some(Packet { header, data }))
}

/// Advances the handshake state machine for one inbound frame. Returns
/// whether the reader should keep going.
fn handle_frame(inner: &Arc<ConnInner>, packet: Packet) -> bool {
    if !inner.registration_passed.load(Ordering::Acquire) {
        if !packet.is_registration() {
            inner.drop_with(DropReason::ProtocolCorrupted);
            return false;
        }

        if !inner.active {
            *inner.remote.lock() = packet.header.sender;
        }
        inner.registration_passed.store(true, Ordering::Release);
        let conn = ConnectionHandle {
            inner: Arc::clone(inner),
        };
        let _ = inner.events.send(ConnEvent::Connected { conn, packet });
        return true;
    }

    if packet.is_registration() {
        debug!("registration frame received after handshake");
        inner.drop_with(DropReason::ProtocolCorrupted);
        return false;
    }

    let from = *inner.remote.lock();
    let _ = inner.events.send(ConnEvent::PacketReceived { from, packet });
    true
}
