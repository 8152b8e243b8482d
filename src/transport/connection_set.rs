//! Generational registry of live connections.
//!
//! Connections live in a slot arena. A [`ConnectionId`] names a slot and the
//! generation the slot had when the connection was inserted, so an id held
//! after its connection was removed never resolves to a newer occupant.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use super::connection::Connection;

const INDEX_BITS: u32 = 16;
const GENERATION_MASK: u32 = 0x7FFF;

/// Handle to a connection owned by a [`ConnectionSet`].
///
/// Packs a 16-bit slot index and a 15-bit generation into 31 bits, which
/// leaves room for the reliable flag in a packed packet timeout key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Number of slots an id can address.
    pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

    /// Build an id from a slot index and generation.
    pub fn new(index: u16, generation: u16) -> Self {
        Self((u32::from(generation) & GENERATION_MASK) << INDEX_BITS | u32::from(index))
    }

    /// Slot index.
    pub fn index(self) -> u16 {
        self.0 as u16
    }

    /// Slot generation.
    pub fn generation(self) -> u16 {
        ((self.0 >> INDEX_BITS) & GENERATION_MASK) as u16
    }

    /// Raw 31-bit value.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Rebuild from a raw value; the top bit is ignored.
    pub fn from_u32(raw: u32) -> Self {
        Self(raw & 0x7FFF_FFFF)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u16,
    connection: Option<Connection>,
}

/// Owns every live connection, indexed by id and by remote address.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    slots: Vec<Slot>,
    free: Vec<u16>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    len: usize,
}

impl ConnectionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection built by `make` from its freshly allocated id.
    ///
    /// Returns `None` when every addressable slot is occupied or a
    /// connection to the same address already exists.
    pub fn insert_with<F>(&mut self, remote_addr: SocketAddr, make: F) -> Option<ConnectionId>
    where
        F: FnOnce(ConnectionId) -> Connection,
    {
        if self.by_addr.contains_key(&remote_addr) {
            return None;
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= ConnectionId::MAX_SLOTS {
                    return None;
                }
                self.slots.push(Slot {
                    generation: 0,
                    connection: None,
                });
                (self.slots.len() - 1) as u16
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = ConnectionId::new(index, slot.generation);
        slot.connection = Some(make(id));
        self.by_addr.insert(remote_addr, id);
        self.len += 1;
        Some(id)
    }

    /// Look up a connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.connection.as_ref()
    }

    /// Look up a connection by id, mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.connection.as_mut()
    }

    /// Id of the connection to `addr`, if any.
    pub fn id_by_addr(&self, addr: &SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(addr).copied()
    }

    /// Remove a connection, returning it.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let connection = slot.connection.take()?;
        slot.generation = (slot.generation + 1) & GENERATION_MASK as u16;
        self.free.push(id.index());
        self.by_addr.remove(&connection.remote_addr());
        self.len -= 1;
        Some(connection)
    }

    /// Ids of every live connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.iter().map(Connection::id).collect()
    }

    /// Iterate over live connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(|slot| slot.connection.as_ref())
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
