//! In-process datagram network.
//!
//! [`MemoryNetwork`] routes datagrams between sockets by address without
//! touching the OS. Delivery is instant and lossless; a datagram sits in the
//! destination's queue until that interface's next update takes it. Tests
//! use [`MemoryNetwork::inject`] to hand-craft datagrams from any address.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::socket::{DatagramSocket, ReceivedDatagram, SocketBinder};

type Queue = Arc<Mutex<VecDeque<ReceivedDatagram>>>;

#[derive(Debug, Default)]
struct Routes {
    queues: HashMap<SocketAddr, Queue>,
    next_port: u16,
}

/// Shared in-memory network. Clones share the same routes.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<Mutex<Routes>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binder for sockets at `ip`.
    pub fn binder(&self, ip: IpAddr) -> MemoryBinder {
        MemoryBinder {
            network: self.clone(),
            ip,
        }
    }

    /// Deliver `data` to `to` as if sent from `from`.
    ///
    /// Returns `false` if nothing is bound at `to`.
    pub fn inject(&self, to: SocketAddr, from: SocketAddr, data: impl Into<Vec<u8>>) -> bool {
        let queue = lock(&self.routes).queues.get(&to).cloned();
        match queue {
            Some(queue) => {
                lock(&queue).push_back(ReceivedDatagram {
                    from,
                    data: data.into(),
                });
                true
            }
            None => false,
        }
    }

    /// Number of datagrams waiting at `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        lock(&self.routes)
            .queues
            .get(&addr)
            .map_or(0, |queue| lock(queue).len())
    }

    /// Remove and return every datagram waiting at `addr`.
    pub fn drain(&self, addr: SocketAddr) -> Vec<ReceivedDatagram> {
        lock(&self.routes)
            .queues
            .get(&addr)
            .map(|queue| lock(queue).drain(..).collect())
            .unwrap_or_default()
    }

    fn bind(&self, ip: IpAddr, port: u16) -> io::Result<MemorySocket> {
        let mut routes = lock(&self.routes);
        let port = if port == 0 {
            // Ephemeral range, skipping ports in use.
            let mut candidate = None;
            for _ in 0..=u16::MAX {
                routes.next_port = routes.next_port.wrapping_add(1);
                let port = 49152 | (routes.next_port & 0x3FFF);
                if !routes.queues.contains_key(&SocketAddr::new(ip, port)) {
                    candidate = Some(port);
                    break;
                }
            }
            candidate.ok_or_else(|| io::Error::from(io::ErrorKind::AddrInUse))?
        } else {
            port
        };

        let addr = SocketAddr::new(ip, port);
        if routes.queues.contains_key(&addr) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        let queue = Queue::default();
        routes.queues.insert(addr, Arc::clone(&queue));
        Ok(MemorySocket {
            network: self.clone(),
            addr,
            queue,
        })
    }
}

/// Binder producing [`MemorySocket`]s on one IP of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryBinder {
    network: MemoryNetwork,
    ip: IpAddr,
}

impl SocketBinder for MemoryBinder {
    fn open(&mut self, port: u16) -> io::Result<Arc<dyn DatagramSocket>> {
        Ok(Arc::new(self.network.bind(self.ip, port)?))
    }
}

/// Socket on a [`MemoryNetwork`]; unbinds on drop.
#[derive(Debug)]
pub struct MemorySocket {
    network: MemoryNetwork,
    addr: SocketAddr,
    queue: Queue,
}

impl DatagramSocket for MemorySocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        // Unroutable datagrams vanish, as with UDP.
        self.network.inject(addr, self.addr, data);
        Ok(data.len())
    }

    fn take_received(&self) -> Vec<ReceivedDatagram> {
        lock(&self.queue).drain(..).collect()
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        lock(&self.network.routes).queues.remove(&self.addr);
    }
}
