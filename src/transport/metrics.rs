//! Interface-wide counters.

/// Counters aggregated over every connection of an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceMetrics {
    /// Datagrams written to the socket.
    pub datagrams_sent: u64,
    /// Bytes written to the socket.
    pub bytes_sent: u64,
    /// Datagrams taken from the socket and processed.
    pub datagrams_received: u64,
    /// Bytes taken from the socket and processed.
    pub bytes_received: u64,
    /// Datagrams never processed: left over when the time slice ran out,
    /// or dropped by a full socket receive buffer.
    pub datagrams_discarded: u64,
    /// Of the discarded datagrams, those dropped by a full receive buffer.
    pub datagrams_overflowed: u64,
    /// Datagrams dropped because they failed to decode.
    pub decode_failures: u64,
    /// Writes skipped by simulated loss.
    pub simulated_drops: u64,
    /// Packets sent with a compressed body.
    pub packets_compressed: u64,
    /// Packets split into fragments.
    pub packets_fragmented: u64,
    /// Reliable retransmissions.
    pub retransmissions: u64,
    /// Packets declared lost.
    pub packets_lost: u64,
    /// Connections accepted from remote peers.
    pub connections_accepted: u64,
    /// Initiate packets refused.
    pub connections_rejected: u64,
    /// Connections removed.
    pub disconnects: u64,
    /// Live connections at the end of the last update.
    pub active_connections: u64,
}
