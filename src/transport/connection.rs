//! Per-peer connection state.
//!
//! A [`Connection`] owns everything the transport tracks about one remote
//! address: lifecycle, the secure endpoint, sequence and ack bookkeeping,
//! the reliable send queue, fragment reassembly and RTT. It never touches
//! the socket; the [`NetworkInterface`](super::NetworkInterface) drives it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::config::NetworkConfig;
use super::connection_set::ConnectionId;
use super::fragment::FragmentQueue;
use super::header::{AckHeader, PacketHeader, PacketType, Reliability, SequenceId};
use super::reliable::ReliableQueue;
use super::timeout::TimeoutId;
use super::timing::RttEstimator;
use super::window::{IdWindow, PacketId, ReceivedWindow, SentWindow};
use crate::crypto::SecureEndpoint;

/// Why a connection ended. Carried on the wire by the terminate packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    /// No reason recorded.
    None = 0x00,
    /// Protocol violation or unexpected state.
    Unknown = 0x01,
    /// Local application called disconnect.
    TerminatedByUser = 0x02,
    /// Peer sent a terminate packet.
    TerminatedByRemote = 0x03,
    /// Validator refused the connection.
    ConnectionRejected = 0x04,
    /// Connection limit reached.
    TooManyConnections = 0x05,
    /// Acceptor heard nothing for the idle timeout.
    Timeout = 0x06,
    /// Secure endpoint failed to authenticate the peer.
    SslFailure = 0x07,
    /// Too many reliable packets awaiting ack.
    ReliableQueueFull = 0x08,
    /// A reliable packet exhausted its retransmissions.
    ReliableTransportFailure = 0x09,
    /// Application handler rejected a packet.
    StreamError = 0x0A,
    /// Local interface closed.
    Shutdown = 0x0B,
}

impl DisconnectReason {
    /// Convert from a wire byte; unknown values map to [`DisconnectReason::Unknown`].
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => DisconnectReason::None,
            0x02 => DisconnectReason::TerminatedByUser,
            0x03 => DisconnectReason::TerminatedByRemote,
            0x04 => DisconnectReason::ConnectionRejected,
            0x05 => DisconnectReason::TooManyConnections,
            0x06 => DisconnectReason::Timeout,
            0x07 => DisconnectReason::SslFailure,
            0x08 => DisconnectReason::ReliableQueueFull,
            0x09 => DisconnectReason::ReliableTransportFailure,
            0x0A => DisconnectReason::StreamError,
            0x0B => DisconnectReason::Shutdown,
            _ => DisconnectReason::Unknown,
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::None => "none",
            DisconnectReason::Unknown => "unknown",
            DisconnectReason::TerminatedByUser => "terminated by user",
            DisconnectReason::TerminatedByRemote => "terminated by remote",
            DisconnectReason::ConnectionRejected => "connection rejected",
            DisconnectReason::TooManyConnections => "too many connections",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::SslFailure => "secure endpoint failure",
            DisconnectReason::ReliableQueueFull => "reliable queue full",
            DisconnectReason::ReliableTransportFailure => "reliable transport failure",
            DisconnectReason::StreamError => "stream error",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Which side initiated the disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationEndpoint {
    /// This interface decided to disconnect.
    Local,
    /// The peer asked to disconnect.
    Remote,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Created by `connect`; sends heartbeats.
    Connector,
    /// Created on an accepted initiate packet; times out when idle.
    Acceptor,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connector waiting for the first packet from the acceptor.
    Connecting,
    /// Established.
    Connected,
    /// Queued for removal at the end of the current update.
    Disconnecting,
}

/// Result of asking whether a packet got through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAckState {
    /// Peer acknowledged the packet, or it is no longer tracked.
    Acked,
    /// Still within its ack timeout.
    Pending,
    /// Ack timeout elapsed; the packet is no longer tracked.
    Lost,
}

/// Per-connection counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionMetrics {
    /// Datagrams written to the socket.
    pub packets_sent: u64,
    /// Bytes written to the socket.
    pub bytes_sent: u64,
    /// Datagrams accepted from the peer.
    pub packets_received: u64,
    /// Bytes accepted from the peer.
    pub bytes_received: u64,
    /// Packets the peer acknowledged.
    pub packets_acked: u64,
    /// Packets declared lost.
    pub packets_lost: u64,
    /// Reliable retransmissions.
    pub retransmissions: u64,
    /// Duplicate reliable packets dropped.
    pub duplicates_dropped: u64,
    /// Smoothed round-trip time.
    pub rtt: Duration,
    /// Round-trip time variance.
    pub rtt_variance: Duration,
}

#[derive(Debug, Clone, Copy)]
struct SentPacket {
    packet_type: PacketType,
    /// `None` while held back until the secure handshake completes.
    sent_at: Option<Instant>,
}

/// State for one remote peer.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    role: ConnectionRole,
    state: ConnectionState,
    disconnect_reason: Option<DisconnectReason>,
    endpoint: Box<dyn SecureEndpoint>,

    next_packet_id: PacketId,
    next_local_sequence: SequenceId,
    next_fragment_sequence: u32,

    received: ReceivedWindow,
    sent: SentWindow,
    acked_ids: IdWindow,
    received_reliable: IdWindow,
    outstanding: HashMap<PacketId, SentPacket>,

    reliable: ReliableQueue,
    fragments: FragmentQueue,
    /// Chunk packet id (first transmission) -> parent packet id.
    fragment_chunks: HashMap<PacketId, PacketId>,
    /// Parent packet id -> chunk transmissions still awaiting ack.
    fragment_parents: HashMap<PacketId, usize>,

    rtt: RttEstimator,
    min_packet_timeout: Duration,
    rtt_fudge: f64,

    heartbeat_timeout: Option<TimeoutId>,
    decrypt_failures: u32,
    needs_ack: bool,
    last_received: Instant,
    metrics: ConnectionMetrics,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("disconnect_reason", &self.disconnect_reason)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection. Connectors start `Connecting`, acceptors `Connected`.
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        role: ConnectionRole,
        endpoint: Box<dyn SecureEndpoint>,
        config: &NetworkConfig,
        now: Instant,
    ) -> Self {
        let state = match role {
            ConnectionRole::Connector => ConnectionState::Connecting,
            ConnectionRole::Acceptor => ConnectionState::Connected,
        };
        Self {
            id,
            remote_addr,
            role,
            state,
            disconnect_reason: None,
            endpoint,
            next_packet_id: 0,
            next_local_sequence: 0,
            next_fragment_sequence: 0,
            received: ReceivedWindow::new(),
            sent: SentWindow::new(),
            acked_ids: IdWindow::new(),
            received_reliable: IdWindow::new(),
            outstanding: HashMap::new(),
            reliable: ReliableQueue::new(config.reliable_queue_capacity),
            fragments: FragmentQueue::new(config.max_fragment_groups),
            fragment_chunks: HashMap::new(),
            fragment_parents: HashMap::new(),
            rtt: RttEstimator::new(),
            min_packet_timeout: config.min_packet_timeout,
            rtt_fudge: config.rtt_fudge,
            heartbeat_timeout: None,
            decrypt_failures: 0,
            needs_ack: false,
            last_received: now,
            metrics: ConnectionMetrics::default(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Role of this side.
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reason recorded by the first disconnect request.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    /// Whether the connection is queued for removal.
    pub fn is_disconnecting(&self) -> bool {
        self.state == ConnectionState::Disconnecting
    }

    /// Counters, with the current RTT estimate filled in.
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            rtt: self.rtt.srtt(),
            rtt_variance: self.rtt.rttvar(),
            ..self.metrics.clone()
        }
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut ConnectionMetrics {
        &mut self.metrics
    }

    /// RTT estimator.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// When the peer was last heard from.
    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Promote `Connecting` to `Connected`. Returns `true` on transition.
    pub fn mark_connected(&mut self) -> bool {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Move to `Disconnecting`.
    ///
    /// Only the first request records its reason; later requests return
    /// `false` and change nothing.
    pub fn request_disconnect(&mut self, reason: DisconnectReason) -> bool {
        if self.disconnect_reason.is_some() {
            return false;
        }
        self.disconnect_reason = Some(reason);
        self.state = ConnectionState::Disconnecting;
        true
    }

    /// Secure endpoint.
    pub fn endpoint(&self) -> &dyn SecureEndpoint {
        self.endpoint.as_ref()
    }

    /// Secure endpoint, mutably.
    pub fn endpoint_mut(&mut self) -> &mut dyn SecureEndpoint {
        self.endpoint.as_mut()
    }

    pub(crate) fn heartbeat_timeout(&self) -> Option<TimeoutId> {
        self.heartbeat_timeout
    }

    pub(crate) fn set_heartbeat_timeout(&mut self, id: TimeoutId) {
        self.heartbeat_timeout = Some(id);
    }

    /// Count a failed decode; returns the consecutive failure count.
    pub(crate) fn record_decrypt_failure(&mut self) -> u32 {
        self.decrypt_failures += 1;
        self.decrypt_failures
    }

    pub(crate) fn reset_decrypt_failures(&mut self) {
        self.decrypt_failures = 0;
    }

    // =========================================================================
    // Send side
    // =========================================================================

    /// Allocate the next packet id.
    pub fn allocate_packet_id(&mut self) -> PacketId {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        id
    }

    /// Allocate the next fragment sequence.
    pub fn allocate_fragment_sequence(&mut self) -> u32 {
        let sequence = self.next_fragment_sequence;
        self.next_fragment_sequence = self.next_fragment_sequence.wrapping_add(1);
        sequence
    }

    /// Build the header for one transmission of `packet_id`.
    ///
    /// Allocates a fresh local sequence, remembers which packet it carries
    /// and piggybacks the current ack state.
    pub fn prepare_header(
        &mut self,
        packet_id: PacketId,
        packet_type: PacketType,
        reliability: Reliability,
    ) -> PacketHeader {
        let local_sequence = self.next_local_sequence;
        self.next_local_sequence = self.next_local_sequence.wrapping_add(1);
        self.sent.insert(local_sequence, packet_id);
        // Any outgoing header carries our acks.
        self.needs_ack = false;

        PacketHeader {
            packet_type,
            local_sequence,
            ack: self.received.ack_header(),
            reliability,
        }
    }

    /// Start tracking a transmission for ack timeouts.
    ///
    /// `sent_at` is `None` when the write was held back by the handshake.
    pub fn track_sent(&mut self, packet_id: PacketId, packet_type: PacketType, sent_at: Option<Instant>) {
        self.outstanding.insert(
            packet_id,
            SentPacket {
                packet_type,
                sent_at,
            },
        );
    }

    /// Reliable send queue.
    pub fn reliable_queue(&self) -> &ReliableQueue {
        &self.reliable
    }

    /// Reliable send queue, mutably.
    pub fn reliable_queue_mut(&mut self) -> &mut ReliableQueue {
        &mut self.reliable
    }

    /// Ack timeout derived from the current RTT.
    pub fn packet_timeout(&self) -> Duration {
        self.rtt.packet_timeout(self.min_packet_timeout, self.rtt_fudge)
    }

    /// Whether the peer acknowledged `packet_id`.
    ///
    /// A reliable packet counts as acked when any of its transmissions is.
    /// For a fragmented packet this becomes true once every chunk is acked.
    pub fn was_packet_acked(&self, packet_id: PacketId) -> bool {
        self.acked_ids.contains(packet_id)
    }

    /// Classify an outstanding packet.
    ///
    /// A packet that is not tracked counts as acked. A lost packet stops
    /// being tracked.
    pub fn packet_ack_state(&mut self, packet_id: PacketId, now: Instant) -> PacketAckState {
        if self.acked_ids.contains(packet_id) {
            return PacketAckState::Acked;
        }
        let Some(sent) = self.outstanding.get(&packet_id) else {
            return PacketAckState::Acked;
        };

        let pending = match sent.sent_at {
            None => self.endpoint.is_connecting(),
            Some(sent_at) => now.saturating_duration_since(sent_at) < self.packet_timeout(),
        };
        if pending {
            return PacketAckState::Pending;
        }

        self.outstanding.remove(&packet_id);
        self.metrics.packets_lost += 1;
        PacketAckState::Lost
    }

    /// Packet type of an outstanding transmission.
    pub fn outstanding_type(&self, packet_id: PacketId) -> Option<PacketType> {
        self.outstanding.get(&packet_id).map(|sent| sent.packet_type)
    }

    fn on_packet_acked(&mut self, packet_id: PacketId, now: Instant) {
        if !self.acked_ids.check_and_mark(packet_id) {
            return;
        }
        self.metrics.packets_acked += 1;

        if let Some(SentPacket {
            sent_at: Some(sent_at),
            ..
        }) = self.outstanding.remove(&packet_id)
        {
            self.rtt.update(now.saturating_duration_since(sent_at));
        }

        // Retransmissions carry fresh ids; credit the id the sender holds.
        let first_id = match self.reliable.acknowledge(packet_id) {
            Some(pending) => pending.packet_id,
            None => packet_id,
        };
        if first_id != packet_id && !self.acked_ids.check_and_mark(first_id) {
            return;
        }

        if let Some(parent) = self.fragment_chunks.remove(&first_id)
            && let Some(remaining) = self.fragment_parents.get_mut(&parent)
        {
            *remaining -= 1;
            if *remaining == 0 {
                self.fragment_parents.remove(&parent);
                self.acked_ids.check_and_mark(parent);
            }
        }
    }

    // =========================================================================
    // Fragment parents
    // =========================================================================

    /// Track a fragmented packet: `parent` is acked once every chunk is.
    pub fn register_fragment_parent(&mut self, parent: PacketId, chunks: &[PacketId]) {
        self.fragment_parents.insert(parent, chunks.len());
        for chunk in chunks {
            self.fragment_chunks.insert(*chunk, parent);
        }
    }

    /// An unreliable chunk was lost; its parent can never complete.
    ///
    /// Returns the parent the first time one of its chunks is abandoned.
    pub fn abandon_fragment_chunk(&mut self, chunk: PacketId) -> Option<PacketId> {
        let parent = self.fragment_chunks.remove(&chunk)?;
        self.fragment_chunks.retain(|_, p| *p != parent);
        self.fragment_parents.remove(&parent).map(|_| parent)
    }

    // =========================================================================
    // Receive side
    // =========================================================================

    /// Apply a received header's sequence, ack and reliability information.
    ///
    /// Returns `false` if the packet must not be dispatched: a repeated or
    /// too-old local sequence, or a reliable packet already delivered. Acks
    /// carried by the header are applied either way.
    pub fn process_received(&mut self, header: &PacketHeader, now: Instant) -> bool {
        let fresh = self.received.record(header.local_sequence);

        if let Some(ack) = header.ack {
            self.apply_ack(&ack, now);
        }
        if !fresh {
            return false;
        }

        self.last_received = now;
        if let Reliability::Reliable(sequence) = header.reliability {
            // Always ack, even duplicates, so the sender stops retransmitting.
            self.needs_ack = true;
            if !self.received_reliable.check_and_mark(sequence) {
                self.metrics.duplicates_dropped += 1;
                return false;
            }
        }
        true
    }

    fn apply_ack(&mut self, ack: &AckHeader, now: Instant) {
        for packet_id in self.sent.apply_ack(ack) {
            self.on_packet_acked(packet_id, now);
        }
    }

    /// Whether an ack-only reply is owed; clears the flag.
    pub fn take_needs_ack(&mut self) -> bool {
        std::mem::take(&mut self.needs_ack)
    }

    /// Fragment reassembly state.
    pub fn fragments_mut(&mut self) -> &mut FragmentQueue {
        &mut self.fragments
    }
}
