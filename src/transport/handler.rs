//! Application collaborators.
//!
//! The interface calls out through four small traits. Each has a default
//! implementation that accepts everything or ignores the event.

use std::net::SocketAddr;

use super::connection::{Connection, DisconnectReason, TerminationEndpoint};
use super::connection_set::ConnectionId;
use super::header::PacketHeader;
use super::window::PacketId;

/// Decides whether an unknown address may open a connection.
pub trait ConnectionValidator: Send {
    /// Inspect the initiate packet from `addr`. Returning `false` drops it.
    fn validate_connect(&mut self, addr: SocketAddr, header: &PacketHeader, payload: &[u8]) -> bool;
}

/// Receives application packets.
pub trait PacketHandler: Send {
    /// Handle one packet. Returning `false` disconnects the connection with
    /// [`DisconnectReason::StreamError`].
    fn on_packet_received(&mut self, connection: &Connection, header: &PacketHeader, payload: &[u8]) -> bool;
}

/// Told when an application packet went unacknowledged.
pub trait PacketLossObserver: Send {
    /// `packet_id` on `connection_id` timed out without an ack.
    ///
    /// `packet_id` is always an id a send call returned. A reliable packet
    /// is reported on its first loss only, while retransmission carries on.
    fn on_packet_lost(&mut self, connection_id: ConnectionId, packet_id: PacketId);
}

/// Told about connection lifecycle.
pub trait ConnectionObserver: Send {
    /// A connection reached `Connected`.
    fn on_connect(&mut self, connection: &Connection);

    /// A connection was removed. Called exactly once per connection.
    fn on_disconnect(
        &mut self,
        connection_id: ConnectionId,
        reason: DisconnectReason,
        endpoint: TerminationEndpoint,
    );
}

/// Validator that accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ConnectionValidator for AcceptAll {
    fn validate_connect(&mut self, _addr: SocketAddr, _header: &PacketHeader, _payload: &[u8]) -> bool {
        true
    }
}

/// Observer and handler that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl PacketHandler for NoopHandler {
    fn on_packet_received(&mut self, _connection: &Connection, _header: &PacketHeader, _payload: &[u8]) -> bool {
        true
    }
}

impl PacketLossObserver for NoopHandler {
    fn on_packet_lost(&mut self, _connection_id: ConnectionId, _packet_id: PacketId) {}
}

impl ConnectionObserver for NoopHandler {
    fn on_connect(&mut self, _connection: &Connection) {}

    fn on_disconnect(
        &mut self,
        _connection_id: ConnectionId,
        _reason: DisconnectReason,
        _endpoint: TerminationEndpoint,
    ) {
    }
}
