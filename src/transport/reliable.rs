//! Reliable send queue.
//!
//! Every reliable packet stays here, keyed by the id of its most recent
//! transmission, until that transmission is acked. A lost transmission is
//! taken out, re-sent under a fresh packet id with the same reliable
//! sequence, and put back. Each entry remembers the id its sender was
//! handed so acks and losses can be reported against it.

use std::collections::HashMap;

use super::header::Packet;
use super::window::PacketId;

/// A reliable packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingReliable {
    /// Id returned for the first transmission.
    pub packet_id: PacketId,
    /// Reliable sequence id; constant across retransmissions.
    pub reliable_sequence: u32,
    /// Packet to re-send.
    pub packet: Packet,
    /// Number of retransmissions so far.
    pub retransmit_count: u32,
}

/// Per-connection queue of unacknowledged reliable packets.
#[derive(Debug)]
pub struct ReliableQueue {
    capacity: usize,
    next_sequence: u32,
    pending: HashMap<PacketId, PendingReliable>,
}

impl ReliableQueue {
    /// Create a queue holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_sequence: 0,
            pending: HashMap::new(),
        }
    }

    /// Number of packets awaiting ack.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing awaits ack.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether another packet would overflow the queue.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Queue a first transmission and allocate its reliable sequence.
    ///
    /// Returns `None` when the queue is full.
    pub fn enqueue(&mut self, packet_id: PacketId, packet: Packet) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let reliable_sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending.insert(
            packet_id,
            PendingReliable {
                packet_id,
                reliable_sequence,
                packet,
                retransmit_count: 0,
            },
        );
        Some(reliable_sequence)
    }

    /// Put a retransmitted packet back under its new transmission id.
    pub fn requeue(&mut self, packet_id: PacketId, mut pending: PendingReliable) {
        pending.retransmit_count += 1;
        self.pending.insert(packet_id, pending);
    }

    /// Drop the packet whose transmission `packet_id` was acked.
    pub fn acknowledge(&mut self, packet_id: PacketId) -> Option<PendingReliable> {
        self.pending.remove(&packet_id)
    }

    /// Take out the packet whose transmission `packet_id` was lost.
    pub fn take_lost(&mut self, packet_id: PacketId) -> Option<PendingReliable> {
        self.pending.remove(&packet_id)
    }
}
