//! The network interface.
//!
//! [`NetworkInterface`] owns the socket, every connection and both timeout
//! queues. The application calls [`update`](NetworkInterface::update) once
//! per frame; everything the transport does on its own (accepting
//! connections, dispatching packets, heartbeats, retransmissions, timeouts,
//! removals) happens inside that call on the caller's thread.
//!
//! Outgoing datagrams are built as
//!
//! ```text
//! endpoint.encode( flags || maybe_compress( header || payload ) )
//! ```
//!
//! and received datagrams are taken apart in reverse.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::config::NetworkConfig;
use super::connection::{
    Connection, ConnectionRole, DisconnectReason, PacketAckState, TerminationEndpoint,
};
use super::connection_set::{ConnectionId, ConnectionSet};
use super::error::{NetworkError, NetworkResult};
use super::fragment::{self, FragmentedPacket, Reassembly};
use super::handler::{
    AcceptAll, ConnectionObserver, ConnectionValidator, NoopHandler, PacketHandler,
    PacketLossObserver,
};
use super::header::{
    CorePacket, Packet, PacketFlags, PacketHeader, PacketType, Reliability, encode_body,
    read_flags,
};
use super::metrics::InterfaceMetrics;
use super::socket::{DatagramSocket, ReceivedDatagram, SocketBinder};
use super::timeout::{PacketTimeoutKey, TimeoutAction, TimeoutQueue};
use super::window::PacketId;
use crate::core::{CompressionError, FLAGS_SIZE, PROTOCOL_VERSION};
use crate::crypto::{PlaintextFactory, SecureEndpointFactory};
use crate::extensions::Compressor;

/// Outcome of one transmission attempt.
struct Sent {
    packet_id: PacketId,
    /// Encode or write failure; the packet is tracked regardless.
    error: Option<NetworkError>,
}

impl Sent {
    fn into_result(self) -> NetworkResult<PacketId> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.packet_id),
        }
    }
}

/// What the connection-timeout sweep asked for.
#[derive(Debug, Clone, Copy)]
enum ConnectionTimeout {
    PollHandshake,
    Heartbeat,
    Idle,
}

/// Connection-oriented transport over a datagram socket.
pub struct NetworkInterface {
    config: NetworkConfig,
    binder: Box<dyn SocketBinder>,
    socket: Option<Arc<dyn DatagramSocket>>,
    clock: Arc<dyn Clock>,
    endpoints: Box<dyn SecureEndpointFactory>,
    compressor: Option<Box<dyn Compressor>>,
    validator: Box<dyn ConnectionValidator>,
    handler: Box<dyn PacketHandler>,
    loss_observer: Box<dyn PacketLossObserver>,
    connection_observer: Box<dyn ConnectionObserver>,
    connections: ConnectionSet,
    /// Heartbeat / idle timeouts; user data is the connection id.
    connection_timeouts: TimeoutQueue,
    /// Ack timeouts; user data is a packed [`PacketTimeoutKey`].
    packet_timeouts: TimeoutQueue,
    pending_removals: Vec<(ConnectionId, TerminationEndpoint)>,
    /// Socket overflow drops already counted in `metrics`.
    socket_dropped: u64,
    metrics: InterfaceMetrics,
}

impl fmt::Debug for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkInterface")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connections.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NetworkInterface {
    /// Start building an interface that opens sockets through `binder`.
    pub fn builder(binder: impl SocketBinder + 'static) -> NetworkInterfaceBuilder {
        NetworkInterfaceBuilder::new(binder)
    }

    /// Configuration in use.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Whether a socket is open.
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Local address of the open socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Interface-wide counters.
    pub fn metrics(&self) -> &InterfaceMetrics {
        &self.metrics
    }

    /// Look up a live connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Id of the connection to `addr`.
    pub fn connection_id(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.connections.id_by_addr(&addr)
    }

    /// Number of live connections, including ones queued for removal.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Open the socket on `port` and start accepting connections.
    pub fn listen(&mut self, port: u16) -> NetworkResult<()> {
        if self.socket.is_some() {
            return Err(NetworkError::AlreadyOpen);
        }
        let socket = self.binder.open(port)?;
        info!(local_addr = ?socket.local_addr().ok(), "listening");
        self.socket = Some(socket);
        self.socket_dropped = 0;
        Ok(())
    }

    /// Open a connection to `addr`.
    ///
    /// Opens an ephemeral socket first if none is open. The connection
    /// starts `Connecting` and becomes `Connected` once the peer answers.
    pub fn connect(&mut self, addr: SocketAddr) -> NetworkResult<ConnectionId> {
        if self.socket.is_none() {
            let socket = self.binder.open(0)?;
            debug!(local_addr = ?socket.local_addr().ok(), "opened socket for outgoing connection");
            self.socket = Some(socket);
            self.socket_dropped = 0;
        }
        if self.connections.id_by_addr(&addr).is_some() {
            return Err(NetworkError::AlreadyConnected(addr));
        }
        if self.connections.len() >= self.config.max_connections {
            return Err(NetworkError::TooManyConnections);
        }

        let endpoint = self.endpoints.create(ConnectionRole::Connector, addr)?;
        let now = self.clock.now();
        let config = &self.config;
        let id = self
            .connections
            .insert_with(addr, |id| {
                Connection::new(id, addr, ConnectionRole::Connector, endpoint, config, now)
            })
            .ok_or(NetworkError::TooManyConnections)?;

        let timeout = self.connection_timeouts.register_item(
            u64::from(id.as_u32()),
            self.config.heartbeat_interval,
            now,
        );
        if let Some(conn) = self.connections.get_mut(id) {
            conn.set_heartbeat_timeout(timeout);
        }
        info!(connection = %id, remote = %addr, "connecting");

        let initiate = CorePacket::InitiateConnection {
            protocol_version: PROTOCOL_VERSION,
        };
        if let Err(e) = self.send_packet(id, initiate.to_packet(), true) {
            // Tracked as reliable; the retransmission path retries it.
            warn!(connection = %id, error = %e, "initial connect write failed");
        }
        Ok(id)
    }

    /// Send a packet that is retransmitted until acknowledged.
    pub fn send_reliable_packet(&mut self, id: ConnectionId, packet: Packet) -> NetworkResult<PacketId> {
        Self::check_application_type(&packet)?;
        self.send_packet(id, packet, true)
    }

    /// Send a packet once.
    pub fn send_unreliable_packet(&mut self, id: ConnectionId, packet: Packet) -> NetworkResult<PacketId> {
        Self::check_application_type(&packet)?;
        self.send_packet(id, packet, false)
    }

    /// Whether the peer acknowledged `packet_id`. `false` for unknown ids.
    pub fn was_packet_acked(&self, id: ConnectionId, packet_id: PacketId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|conn| conn.was_packet_acked(packet_id))
    }

    /// Disconnect a connection, telling the peer why.
    ///
    /// The connection is removed and the observer told at the end of the
    /// next update. Returns `false` if the id is unknown or the connection
    /// is already disconnecting.
    pub fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        match self.connections.get(id) {
            Some(conn) if !conn.is_disconnecting() => {}
            _ => return false,
        }
        if let Err(e) = self.send_packet(id, CorePacket::Terminate { reason }.to_packet(), false) {
            debug!(connection = %id, error = %e, "terminate write failed");
        }
        self.request_disconnect(id, reason, TerminationEndpoint::Local)
    }

    /// Disconnect everything with [`DisconnectReason::Shutdown`], notify
    /// observers and close the socket.
    pub fn close(&mut self) {
        for id in self.connections.ids() {
            self.disconnect(id, DisconnectReason::Shutdown);
        }
        self.process_removals();
        self.packet_timeouts = TimeoutQueue::new();
        self.connection_timeouts = TimeoutQueue::new();
        if self.socket.take().is_some() {
            info!("socket closed");
        }
        self.metrics.active_connections = 0;
    }

    /// Run one frame of the transport.
    ///
    /// Processes received datagrams within the configured time slice,
    /// sweeps connection and packet timeouts, flushes owed acks and removes
    /// disconnected connections. Does nothing while no socket is open.
    pub fn update(&mut self) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        self.receive_batch(socket.as_ref());
        self.count_socket_overflow(socket.as_ref());

        let now = self.clock.now();
        self.sweep_connection_timeouts(now);
        self.sweep_packet_timeouts(now);
        self.flush_acks();
        self.process_removals();
        self.metrics.active_connections = self.connections.len() as u64;
    }

    // =========================================================================
    // Send path
    // =========================================================================

    fn check_application_type(packet: &Packet) -> NetworkResult<()> {
        if packet.packet_type.is_core() {
            return Err(NetworkError::ReservedPacketType(packet.packet_type.0));
        }
        Ok(())
    }

    fn send_packet(&mut self, id: ConnectionId, packet: Packet, reliable: bool) -> NetworkResult<PacketId> {
        let now = self.clock.now();
        let conn = self
            .connections
            .get(id)
            .ok_or(NetworkError::UnknownConnection(id))?;
        if conn.is_disconnecting() {
            return Err(NetworkError::Disconnecting(id));
        }

        let serialized = FLAGS_SIZE + PacketHeader::size_for(reliable) + packet.payload.len();
        if serialized > self.config.mtu && packet.packet_type != PacketType::FRAGMENT {
            return self.send_fragmented(id, packet, reliable, now);
        }
        self.send_single(id, packet, reliable, now)?.into_result()
    }

    fn send_fragmented(
        &mut self,
        id: ConnectionId,
        packet: Packet,
        reliable: bool,
        now: Instant,
    ) -> NetworkResult<PacketId> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or(NetworkError::UnknownConnection(id))?;
        let parent = conn.allocate_packet_id();
        let fragment_sequence = conn.allocate_fragment_sequence();

        let inner_header = PacketHeader::new(packet.packet_type, 0, Reliability::Unreliable);
        let inner = encode_body(PacketFlags::NONE, &inner_header, &packet.payload);
        let chunks = fragment::split(parent, fragment_sequence, &inner, self.config.chunk_size())?;
        debug!(
            connection = %id,
            packet_id = parent,
            chunks = chunks.len(),
            reliable,
            "fragmenting packet"
        );
        self.metrics.packets_fragmented += 1;

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        let mut first_error = None;
        for chunk in chunks {
            let sent = self.send_single(
                id,
                Packet::new(PacketType::FRAGMENT, chunk.to_bytes()),
                reliable,
                now,
            )?;
            chunk_ids.push(sent.packet_id);
            if first_error.is_none() {
                first_error = sent.error;
            }
        }
        if let Some(conn) = self.connections.get_mut(id) {
            conn.register_fragment_parent(parent, &chunk_ids);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(parent),
        }
    }

    /// First transmission of a packet that fits the MTU.
    fn send_single(
        &mut self,
        id: ConnectionId,
        packet: Packet,
        reliable: bool,
        now: Instant,
    ) -> NetworkResult<Sent> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or(NetworkError::UnknownConnection(id))?;
        let packet_id = conn.allocate_packet_id();

        let reliability = if reliable {
            match conn.reliable_queue_mut().enqueue(packet_id, packet.clone()) {
                Some(sequence) => Reliability::Reliable(sequence),
                None => {
                    warn!(connection = %id, "reliable queue full");
                    self.request_disconnect(id, DisconnectReason::ReliableQueueFull, TerminationEndpoint::Local);
                    return Err(NetworkError::ReliableQueueFull);
                }
            }
        } else {
            Reliability::Unreliable
        };

        self.transmit(id, packet_id, &packet, reliability, now)
    }

    /// Serialize, encode and write one transmission, then start its ack
    /// timeout.
    fn transmit(
        &mut self,
        id: ConnectionId,
        packet_id: PacketId,
        packet: &Packet,
        reliability: Reliability,
        now: Instant,
    ) -> NetworkResult<Sent> {
        let socket = self.socket.clone().ok_or(NetworkError::NotOpen)?;
        let conn = self
            .connections
            .get_mut(id)
            .ok_or(NetworkError::UnknownConnection(id))?;
        let header = conn.prepare_header(packet_id, packet.packet_type, reliability);

        let mut body = Vec::with_capacity(header.size() + packet.payload.len());
        header.write(&mut body);
        body.extend_from_slice(&packet.payload);

        let mut flags = PacketFlags::NONE;
        if packet.packet_type != PacketType::INITIATE_CONNECTION
            && let Some(compressor) = &self.compressor
        {
            match compressor.compress(&body) {
                Ok(compressed) if compressed.len() < body.len() => {
                    body = compressed;
                    flags = flags.with_compressed();
                    self.metrics.packets_compressed += 1;
                }
                Ok(_) => {}
                Err(e) => debug!(connection = %id, error = %e, "compression failed, sending uncompressed"),
            }
        }
        let mut plaintext = Vec::with_capacity(FLAGS_SIZE + body.len());
        plaintext.push(flags.as_byte());
        plaintext.extend_from_slice(&body);

        // Nothing but the initiate packet goes out before the secure
        // handshake completes; held packets surface as lost afterwards.
        let held = conn.endpoint().is_connecting()
            && packet.packet_type != PacketType::INITIATE_CONNECTION;
        let mut error = None;
        let sent_at = if held {
            trace!(connection = %id, packet_id, "held until handshake completes");
            None
        } else {
            match conn.endpoint_mut().encode(&plaintext) {
                Err(e) => {
                    warn!(connection = %id, error = %e, "secure endpoint failed to encode");
                    error = Some(NetworkError::Crypto(e));
                }
                Ok(_)
                    if self.config.simulated_loss > 0.0
                        && rand::thread_rng().gen_bool(self.config.simulated_loss) =>
                {
                    trace!(connection = %id, packet_id, "simulated loss");
                    self.metrics.simulated_drops += 1;
                }
                Ok(datagram) => match socket.send_to(&datagram, conn.remote_addr()) {
                    Ok(written) => {
                        let metrics = conn.metrics_mut();
                        metrics.packets_sent += 1;
                        metrics.bytes_sent += written as u64;
                        self.metrics.datagrams_sent += 1;
                        self.metrics.bytes_sent += written as u64;
                    }
                    Err(e) => {
                        warn!(connection = %id, remote = %conn.remote_addr(), error = %e, "socket write failed");
                        error = Some(NetworkError::Io(e));
                    }
                },
            }
            Some(now)
        };

        let tracked = reliability.is_reliable()
            || !packet.packet_type.is_core()
            || packet.packet_type == PacketType::FRAGMENT;
        if tracked {
            conn.track_sent(packet_id, packet.packet_type, sent_at);
            let key = PacketTimeoutKey {
                reliable: reliability.is_reliable(),
                connection_id: id,
                packet_id,
            };
            self.packet_timeouts
                .register_item(key.pack(), conn.packet_timeout(), now);
        }

        Ok(Sent { packet_id, error })
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    fn receive_batch(&mut self, socket: &dyn DatagramSocket) {
        let start = self.clock.now();
        let batch = socket.take_received();
        let total = batch.len();

        for (index, datagram) in batch.into_iter().enumerate() {
            if self.clock.now().saturating_duration_since(start) > self.config.packet_time_slice {
                let discarded = (total - index) as u64;
                self.metrics.datagrams_discarded += discarded;
                debug!(processed = index, discarded, "receive time slice exhausted");
                break;
            }
            self.metrics.datagrams_received += 1;
            self.metrics.bytes_received += datagram.data.len() as u64;

            let now = self.clock.now();
            match self.connections.id_by_addr(&datagram.from) {
                Some(id) => self.receive_from(id, &datagram.data, now),
                None => self.accept(datagram, now),
            }
        }
    }

    fn count_socket_overflow(&mut self, socket: &dyn DatagramSocket) {
        let overflowed = socket.dropped().saturating_sub(self.socket_dropped);
        if overflowed == 0 {
            return;
        }
        self.socket_dropped += overflowed;
        self.metrics.datagrams_overflowed += overflowed;
        self.metrics.datagrams_discarded += overflowed;
        debug!(overflowed, "socket receive buffer overflowed");
    }

    /// Split a decoded datagram into header and payload, decompressing if
    /// flagged.
    fn decode_body(&self, plaintext: &[u8]) -> NetworkResult<(PacketHeader, Vec<u8>)> {
        let (flags, rest) = read_flags(plaintext)?;
        let decompressed;
        let body = if flags.is_compressed() {
            let compressor = self
                .compressor
                .as_ref()
                .ok_or(CompressionError::NoCompressor)?;
            decompressed = compressor.decompress(rest, self.config.max_decompressed_size)?;
            decompressed.as_slice()
        } else {
            rest
        };
        let (header, consumed) = PacketHeader::read(body)?;
        Ok((header, body[consumed..].to_vec()))
    }

    /// Datagram from an address with no connection: only a valid initiate
    /// packet creates one.
    fn accept(&mut self, datagram: ReceivedDatagram, now: Instant) {
        let from = datagram.from;
        let mut endpoint = match self.endpoints.create(ConnectionRole::Acceptor, from) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(remote = %from, error = %e, "failed to create secure endpoint");
                return;
            }
        };
        let plaintext = match endpoint.decode(&datagram.data) {
            Ok(plaintext) if !plaintext.is_empty() => plaintext,
            Ok(_) => return,
            Err(e) => {
                self.metrics.decode_failures += 1;
                trace!(remote = %from, error = %e, "undecodable datagram from unknown address");
                return;
            }
        };
        let (header, payload) = match self.decode_body(&plaintext) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.metrics.decode_failures += 1;
                trace!(remote = %from, error = %e, "malformed datagram from unknown address");
                return;
            }
        };
        if header.packet_type != PacketType::INITIATE_CONNECTION {
            trace!(remote = %from, packet_type = header.packet_type.0, "ignoring packet from unknown address");
            return;
        }

        let protocol_version = match CorePacket::parse(header.packet_type, &payload) {
            Ok(Some(CorePacket::InitiateConnection { protocol_version })) => protocol_version,
            _ => {
                self.metrics.decode_failures += 1;
                return;
            }
        };
        let rejection = if protocol_version != PROTOCOL_VERSION {
            Some(DisconnectReason::ConnectionRejected)
        } else if !self.validator.validate_connect(from, &header, &payload) {
            Some(DisconnectReason::ConnectionRejected)
        } else if self.connections.len() >= self.config.max_connections {
            Some(DisconnectReason::TooManyConnections)
        } else {
            None
        };
        if let Some(reason) = rejection {
            self.metrics.connections_rejected += 1;
            info!(remote = %from, protocol_version, %reason, "connection refused");
            return;
        }

        let config = &self.config;
        let Some(id) = self.connections.insert_with(from, |id| {
            Connection::new(id, from, ConnectionRole::Acceptor, endpoint, config, now)
        }) else {
            self.metrics.connections_rejected += 1;
            return;
        };
        let timeout = self.connection_timeouts.register_item(
            u64::from(id.as_u32()),
            self.config.idle_timeout,
            now,
        );
        if let Some(conn) = self.connections.get_mut(id) {
            conn.set_heartbeat_timeout(timeout);
            conn.process_received(&header, now);
            conn.metrics_mut().packets_received += 1;
            conn.metrics_mut().bytes_received += datagram.data.len() as u64;
        }
        self.metrics.connections_accepted += 1;
        info!(connection = %id, remote = %from, "connection accepted");

        if let Some(conn) = self.connections.get(id) {
            self.connection_observer.on_connect(conn);
        }
        if let Err(e) = self.send_packet(id, CorePacket::ConnectionAck.to_packet(), true) {
            warn!(connection = %id, error = %e, "connection ack write failed");
        }
    }

    fn receive_from(&mut self, id: ConnectionId, data: &[u8], now: Instant) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.is_disconnecting() {
            return;
        }

        let plaintext = match conn.endpoint_mut().decode(data) {
            Ok(plaintext) => {
                conn.reset_decrypt_failures();
                plaintext
            }
            Err(e) => {
                let failures = conn.record_decrypt_failure();
                self.metrics.decode_failures += 1;
                debug!(connection = %id, failures, error = %e, "failed to decode datagram");
                if failures >= self.config.decrypt_failure_limit {
                    self.request_disconnect(id, DisconnectReason::SslFailure, TerminationEndpoint::Local);
                }
                return;
            }
        };
        if plaintext.is_empty() {
            // Consumed by the handshake.
            return;
        }

        let (header, payload) = match self.decode_body(&plaintext) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.metrics.decode_failures += 1;
                debug!(connection = %id, error = %e, "dropping malformed datagram");
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        let Some(timeout) = conn
            .heartbeat_timeout()
            .and_then(|timeout| self.connection_timeouts.retrieve_item(timeout))
        else {
            warn!(connection = %id, "connection timeout entry missing");
            self.request_disconnect(id, DisconnectReason::Unknown, TerminationEndpoint::Local);
            return;
        };
        if !conn.process_received(&header, now) {
            trace!(connection = %id, sequence = header.local_sequence, "duplicate or stale packet");
            return;
        }
        timeout.update_timeout_time(now);
        let metrics = conn.metrics_mut();
        metrics.packets_received += 1;
        metrics.bytes_received += data.len() as u64;

        self.dispatch(id, &header, &payload, now);
    }

    /// Hand a packet to the transport or the application; promote the
    /// connection on success.
    fn dispatch(&mut self, id: ConnectionId, header: &PacketHeader, payload: &[u8], now: Instant) {
        let handled = if header.packet_type.is_core() {
            match CorePacket::parse(header.packet_type, payload) {
                Ok(Some(core)) => self.handle_core(id, core, payload, now),
                Ok(None) => false,
                Err(e) => {
                    warn!(connection = %id, error = %e, "malformed core packet");
                    self.request_disconnect(id, DisconnectReason::Unknown, TerminationEndpoint::Local);
                    false
                }
            }
        } else {
            let Some(conn) = self.connections.get(id) else {
                return;
            };
            if self.handler.on_packet_received(conn, header, payload) {
                true
            } else {
                if !conn.is_disconnecting() {
                    debug!(connection = %id, packet_type = header.packet_type.0, "handler rejected packet");
                    self.request_disconnect(id, DisconnectReason::StreamError, TerminationEndpoint::Local);
                }
                false
            }
        };

        if handled
            && let Some(conn) = self.connections.get_mut(id)
            && conn.mark_connected()
        {
            info!(connection = %id, remote = %conn.remote_addr(), "connected");
            self.connection_observer.on_connect(conn);
        }
    }

    fn handle_core(&mut self, id: ConnectionId, core: CorePacket, payload: &[u8], now: Instant) -> bool {
        match core {
            // Handshake packets: reaching here is all they need to do.
            CorePacket::InitiateConnection { .. } | CorePacket::ConnectionAck => true,
            CorePacket::Heartbeat { is_reply } => {
                if !is_reply
                    && let Err(e) = self.send_packet(id, CorePacket::Heartbeat { is_reply: true }.to_packet(), false)
                {
                    debug!(connection = %id, error = %e, "heartbeat reply failed");
                }
                true
            }
            CorePacket::Terminate { reason } => {
                info!(connection = %id, %reason, "peer terminated connection");
                self.request_disconnect(id, DisconnectReason::TerminatedByRemote, TerminationEndpoint::Remote);
                false
            }
            CorePacket::Fragment => self.receive_fragment(id, payload, now),
        }
    }

    fn receive_fragment(&mut self, id: ConnectionId, payload: &[u8], now: Instant) -> bool {
        let fragment = match FragmentedPacket::from_bytes(payload) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.metrics.decode_failures += 1;
                debug!(connection = %id, error = %e, "dropping malformed fragment");
                return false;
            }
        };
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        let inner = match conn.fragments_mut().insert(fragment) {
            Reassembly::Complete(inner) => inner,
            Reassembly::Incomplete | Reassembly::Rejected => return true,
        };

        // Reassembled packets carry a bare header; acks and sequencing were
        // handled per chunk.
        let parsed = read_flags(&inner).and_then(|(flags, rest)| {
            if flags != PacketFlags::NONE {
                return Err(crate::core::HeaderError::InvalidFlags(flags.as_byte()));
            }
            PacketHeader::read(rest).map(|(header, consumed)| (header, rest[consumed..].to_vec()))
        });
        match parsed {
            Ok((header, inner_payload)) if header.packet_type != PacketType::FRAGMENT => {
                trace!(connection = %id, size = inner.len(), "reassembled packet");
                self.dispatch(id, &header, &inner_payload, now);
                true
            }
            Ok(_) | Err(_) => {
                warn!(connection = %id, "invalid reassembled packet");
                self.request_disconnect(id, DisconnectReason::Unknown, TerminationEndpoint::Local);
                false
            }
        }
    }

    // =========================================================================
    // Timeouts and housekeeping
    // =========================================================================

    fn sweep_connection_timeouts(&mut self, now: Instant) {
        let connections = &self.connections;
        let timeout_idle = self.config.timeout_idle_connections;
        let mut actions = Vec::new();

        self.connection_timeouts.update_timeouts(now, usize::MAX, |_, item| {
            let id = ConnectionId::from_u32(item.user_data as u32);
            let Some(conn) = connections.get(id) else {
                return TimeoutAction::Delete;
            };
            if conn.is_disconnecting() {
                return TimeoutAction::Refresh;
            }
            if conn.endpoint().is_connecting() {
                actions.push((id, ConnectionTimeout::PollHandshake));
                return TimeoutAction::Refresh;
            }
            match conn.role() {
                ConnectionRole::Connector => {
                    actions.push((id, ConnectionTimeout::Heartbeat));
                    TimeoutAction::Refresh
                }
                ConnectionRole::Acceptor if timeout_idle => {
                    actions.push((id, ConnectionTimeout::Idle));
                    TimeoutAction::Delete
                }
                ConnectionRole::Acceptor => TimeoutAction::Refresh,
            }
        });

        for (id, action) in actions {
            match action {
                ConnectionTimeout::PollHandshake => self.poll_handshake(id),
                ConnectionTimeout::Heartbeat => {
                    let heartbeat = CorePacket::Heartbeat { is_reply: false }.to_packet();
                    if let Err(e) = self.send_packet(id, heartbeat, false) {
                        debug!(connection = %id, error = %e, "heartbeat failed");
                    }
                }
                ConnectionTimeout::Idle => {
                    info!(connection = %id, "idle timeout");
                    self.request_disconnect(id, DisconnectReason::Timeout, TerminationEndpoint::Local);
                }
            }
        }
    }

    fn poll_handshake(&mut self, id: ConnectionId) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if let Some(datagram) = conn.endpoint_mut().poll_handshake()
            && let Err(e) = socket.send_to(&datagram, conn.remote_addr())
        {
            warn!(connection = %id, error = %e, "handshake write failed");
        }
    }

    fn sweep_packet_timeouts(&mut self, now: Instant) {
        let connections = &mut self.connections;
        let mut lost = Vec::new();

        self.packet_timeouts.update_timeouts(
            now,
            self.config.max_packet_timeouts_per_update,
            |_, item| {
                let key = PacketTimeoutKey::unpack(item.user_data);
                let Some(conn) = connections.get_mut(key.connection_id) else {
                    return TimeoutAction::Delete;
                };
                let packet_type = conn.outstanding_type(key.packet_id);
                match conn.packet_ack_state(key.packet_id, now) {
                    PacketAckState::Acked => TimeoutAction::Delete,
                    PacketAckState::Pending => TimeoutAction::Refresh,
                    PacketAckState::Lost => {
                        lost.push((key, packet_type));
                        TimeoutAction::Delete
                    }
                }
            },
        );

        for (key, packet_type) in lost {
            self.on_packet_lost(key, packet_type, now);
        }
    }

    fn on_packet_lost(&mut self, key: PacketTimeoutKey, packet_type: Option<PacketType>, now: Instant) {
        let id = key.connection_id;
        self.metrics.packets_lost += 1;
        trace!(connection = %id, packet_id = key.packet_id, reliable = key.reliable, "packet lost");

        if key.reliable {
            self.retransmit(id, key.packet_id, now);
        } else if packet_type == Some(PacketType::FRAGMENT) {
            if let Some(conn) = self.connections.get_mut(id)
                && let Some(parent) = conn.abandon_fragment_chunk(key.packet_id)
            {
                self.loss_observer.on_packet_lost(id, parent);
            }
        } else if packet_type.is_some_and(|packet_type| !packet_type.is_core()) {
            self.loss_observer.on_packet_lost(id, key.packet_id);
        }
    }

    fn retransmit(&mut self, id: ConnectionId, lost_id: PacketId, now: Instant) {
        let max_retransmits = self.config.max_reliable_retransmits;
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.is_disconnecting() {
            return;
        }
        let Some(pending) = conn.reliable_queue_mut().take_lost(lost_id) else {
            return;
        };
        // Reported once, under the id the application was given.
        if pending.retransmit_count == 0 && !pending.packet.packet_type.is_core() {
            self.loss_observer.on_packet_lost(id, pending.packet_id);
        }
        if pending.retransmit_count >= max_retransmits {
            warn!(
                connection = %id,
                reliable_sequence = pending.reliable_sequence,
                "reliable packet exhausted retransmissions"
            );
            self.request_disconnect(id, DisconnectReason::ReliableTransportFailure, TerminationEndpoint::Local);
            return;
        }

        let packet_id = conn.allocate_packet_id();
        conn.metrics_mut().retransmissions += 1;
        self.metrics.retransmissions += 1;
        debug!(
            connection = %id,
            lost_id,
            packet_id,
            reliable_sequence = pending.reliable_sequence,
            attempt = pending.retransmit_count + 1,
            "retransmitting reliable packet"
        );

        let reliability = Reliability::Reliable(pending.reliable_sequence);
        let packet = pending.packet.clone();
        conn.reliable_queue_mut().requeue(packet_id, pending);
        match self.transmit(id, packet_id, &packet, reliability, now) {
            Ok(Sent { error: Some(e), .. }) | Err(e) => {
                debug!(connection = %id, error = %e, "retransmission write failed");
            }
            Ok(_) => {}
        }
    }

    /// Send an ack-only heartbeat to every connection owed one.
    fn flush_acks(&mut self) {
        for id in self.connections.ids() {
            let owed = self
                .connections
                .get_mut(id)
                .is_some_and(|conn| !conn.is_disconnecting() && conn.take_needs_ack());
            if owed
                && let Err(e) = self.send_packet(id, CorePacket::Heartbeat { is_reply: true }.to_packet(), false)
            {
                debug!(connection = %id, error = %e, "ack reply failed");
            }
        }
    }

    fn request_disconnect(
        &mut self,
        id: ConnectionId,
        reason: DisconnectReason,
        endpoint: TerminationEndpoint,
    ) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        if !conn.request_disconnect(reason) {
            return false;
        }
        info!(connection = %id, remote = %conn.remote_addr(), %reason, ?endpoint, "disconnecting");
        self.pending_removals.push((id, endpoint));
        true
    }

    fn process_removals(&mut self) {
        for (id, endpoint) in std::mem::take(&mut self.pending_removals) {
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            let reason = conn.disconnect_reason().unwrap_or(DisconnectReason::Unknown);
            self.connection_observer.on_disconnect(id, reason, endpoint);

            if let Some(timeout) = conn.heartbeat_timeout() {
                self.connection_timeouts.remove_item(timeout);
            }
            self.connections.remove(id);
            self.metrics.disconnects += 1;
            debug!(connection = %id, %reason, "connection removed");
        }
    }
}

/// Builder for [`NetworkInterface`].
pub struct NetworkInterfaceBuilder {
    config: NetworkConfig,
    binder: Box<dyn SocketBinder>,
    clock: Arc<dyn Clock>,
    endpoints: Box<dyn SecureEndpointFactory>,
    compressor: Option<Box<dyn Compressor>>,
    validator: Box<dyn ConnectionValidator>,
    handler: Box<dyn PacketHandler>,
    loss_observer: Box<dyn PacketLossObserver>,
    connection_observer: Box<dyn ConnectionObserver>,
}

impl NetworkInterfaceBuilder {
    /// Defaults: plaintext endpoints, no compression, accept-all validator,
    /// no-op handler and observers, system clock.
    pub fn new(binder: impl SocketBinder + 'static) -> Self {
        Self {
            config: NetworkConfig::default(),
            binder: Box::new(binder),
            clock: Arc::new(SystemClock),
            endpoints: Box::new(PlaintextFactory),
            compressor: None,
            validator: Box::new(AcceptAll),
            handler: Box::new(NoopHandler),
            loss_observer: Box::new(NoopHandler),
            connection_observer: Box::new(NoopHandler),
        }
    }

    /// Use `config`.
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Read time from `clock`.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Create secure endpoints with `factory`.
    pub fn endpoint_factory(mut self, factory: impl SecureEndpointFactory + 'static) -> Self {
        self.endpoints = Box::new(factory);
        self
    }

    /// Compress packet bodies with `compressor`.
    pub fn compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Some(Box::new(compressor));
        self
    }

    /// Decide on incoming connections with `validator`.
    pub fn validator(mut self, validator: impl ConnectionValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Deliver application packets to `handler`.
    pub fn packet_handler(mut self, handler: impl PacketHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Report lost packets to `observer`.
    pub fn loss_observer(mut self, observer: impl PacketLossObserver + 'static) -> Self {
        self.loss_observer = Box::new(observer);
        self
    }

    /// Report connects and disconnects to `observer`.
    pub fn connection_observer(mut self, observer: impl ConnectionObserver + 'static) -> Self {
        self.connection_observer = Box::new(observer);
        self
    }

    /// Validate the configuration and build.
    pub fn build(self) -> NetworkResult<NetworkInterface> {
        self.config.validate()?;
        Ok(NetworkInterface {
            config: self.config,
            binder: self.binder,
            socket: None,
            clock: self.clock,
            endpoints: self.endpoints,
            compressor: self.compressor,
            validator: self.validator,
            handler: self.handler,
            loss_observer: self.loss_observer,
            connection_observer: self.connection_observer,
            connections: ConnectionSet::new(),
            connection_timeouts: TimeoutQueue::new(),
            packet_timeouts: TimeoutQueue::new(),
            pending_removals: Vec::new(),
            socket_dropped: 0,
            metrics: InterfaceMetrics::default(),
        })
    }
}
