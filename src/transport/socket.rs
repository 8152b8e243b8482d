//! Datagram socket boundary and the tokio UDP implementation.
//!
//! The interface never blocks on the socket. A [`DatagramSocket`] buffers
//! whatever arrives between updates and hands the batch over through
//! [`take_received`](DatagramSocket::take_received); writes are
//! non-blocking.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::config::NetworkConfig;
use crate::core::{DEFAULT_RECEIVE_QUEUE_CAPACITY, MAX_DATAGRAM_SIZE};

/// A datagram read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDatagram {
    /// Sender address.
    pub from: SocketAddr,
    /// Raw bytes.
    pub data: Vec<u8>,
}

/// An open datagram socket.
pub trait DatagramSocket: Send + Sync {
    /// Local address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Write one datagram without blocking.
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Take every datagram received since the last call.
    fn take_received(&self) -> Vec<ReceivedDatagram>;

    /// Datagrams dropped because the receive buffer was full.
    fn dropped(&self) -> u64 {
        0
    }
}

/// Opens sockets for an interface.
pub trait SocketBinder: Send {
    /// Open a socket on `port`; port 0 picks an ephemeral port.
    fn open(&mut self, port: u16) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// Binds tokio UDP sockets, each with a background reader task.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct UdpBinder {
    ip: IpAddr,
    receive_queue_capacity: usize,
}

impl UdpBinder {
    /// Bind on all IPv4 interfaces.
    pub fn new() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            receive_queue_capacity: DEFAULT_RECEIVE_QUEUE_CAPACITY,
        }
    }

    /// Bind on a specific local IP.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// Bind on all IPv4 interfaces, buffering as many datagrams as
    /// `config.receive_queue_capacity`.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new().with_receive_queue_capacity(config.receive_queue_capacity)
    }

    /// Set how many datagrams the reader buffers between updates.
    pub fn with_receive_queue_capacity(mut self, capacity: usize) -> Self {
        self.receive_queue_capacity = capacity.max(1);
        self
    }
}

impl Default for UdpBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketBinder for UdpBinder {
    fn open(&mut self, port: u16) -> io::Result<Arc<dyn DatagramSocket>> {
        let handle = Handle::try_current().map_err(io::Error::other)?;
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(self.ip, port))?;
        std_socket.set_nonblocking(true)?;

        let _guard = handle.enter();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let socket = UdpDatagramSocket::spawn(socket, self.receive_queue_capacity, &handle);
        debug!(local_addr = ?socket.local_addr().ok(), "udp socket opened");
        Ok(Arc::new(socket))
    }
}

/// Tokio UDP socket with a reader task feeding a bounded channel.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: Arc<UdpSocket>,
    receiver: Mutex<mpsc::Receiver<ReceivedDatagram>>,
    dropped: Arc<AtomicU64>,
    reader: JoinHandle<()>,
}

impl UdpDatagramSocket {
    fn spawn(socket: Arc<UdpSocket>, capacity: usize, handle: &Handle) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let reader = handle.spawn(read_loop(Arc::clone(&socket), tx, Arc::clone(&dropped)));
        Self {
            socket,
            receiver: Mutex::new(rx),
            dropped,
            reader,
        }
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<ReceivedDatagram>,
    dropped: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port unreachable and friends surface here on some
                // platforms; they say nothing about this socket.
                trace!(error = %e, "udp receive error");
                continue;
            }
        };
        let datagram = ReceivedDatagram {
            from,
            data: buf[..len].to_vec(),
        };
        match tx.try_send(datagram) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(data, addr)
    }

    fn take_received(&self) -> Vec<ReceivedDatagram> {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = Vec::new();
        while let Ok(datagram) = receiver.try_recv() {
            batch.push(datagram);
        }
        batch
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for UdpDatagramSocket {
    fn drop(&mut self) {
        self.reader.abort();
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped, "udp receive queue overflowed during socket lifetime");
        }
    }
}
