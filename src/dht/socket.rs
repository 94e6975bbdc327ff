use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Largest datagram the protocol will emit: the ethernet payload minus the
/// IP and UDP headers, so packets never fragment on common links.
pub const MAX_DATAGRAM_SIZE: usize = 1472; // 1500 - 20 (ip) - 8 (udp)

/// Unreliable packet transport.
///
/// Sends funnel through a single writer task in submission order; received
/// packets are handed to the owner over a channel together with their
/// source endpoint. Receive errors are logged and the loop keeps reading.
/// After [`close`](DatagramSocket::close), sends are silently dropped.
pub struct DatagramSocket {
    socket: Arc<UdpSocket>,
    send_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DatagramSocket {
    /// Binds to `addr` and starts the read and write loops. The returned
    /// receiver yields `(source, packet)` pairs.
    pub async fn bind(
        addr: SocketAddr,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<(SocketAddr, Bytes)>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let closed = Arc::new(AtomicBool::new(false));
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();

        let writer = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                while let Some((to, data)) = send_rx.recv().await {
                    if let Err(e) = socket.send_to(&data, to).await {
                        debug!("udp send to {} failed: {}", to, e);
                    }
                }
            })
        };

        let reader = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, src)) => {
                            if len == 0 {
                                continue;
                            }
                            if recv_tx.send((src, Bytes::copy_from_slice(&buf[..len]))).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("udp receive failed: {}", e);
                        }
                    }
                }
            })
        };

        Ok((
            Self {
                socket,
                send_tx,
                closed,
                tasks: Mutex::new(vec![writer, reader]),
            },
            recv_rx,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Queues a datagram for sending. Returns `false` when the socket has
    /// been closed or the packet exceeds [`MAX_DATAGRAM_SIZE`].
    pub fn send(&self, to: SocketAddr, data: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) || data.len() > MAX_DATAGRAM_SIZE {
            return false;
        }
        self.send_tx.send((to, data)).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Stops both loops; idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        self.close();
    }
}
