//! End-to-end behavior of two interfaces over an in-memory network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use datagram_transport::prelude::*;
use datagram_transport::transport::{PacketFlags, Reliability, encode_body, read_flags};

const IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const SERVER_PORT: u16 = 7000;
const APP: PacketType = PacketType(0x10);

#[derive(Debug, Default)]
struct Events {
    received: Vec<(ConnectionId, PacketType, Vec<u8>)>,
    lost: Vec<(ConnectionId, PacketId)>,
    connected: Vec<ConnectionId>,
    disconnected: Vec<(ConnectionId, DisconnectReason, TerminationEndpoint)>,
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Events>>,
    /// Moved forward by this much for every delivered packet.
    tick: Option<(ManualClock, Duration)>,
}

impl Recorder {
    fn events(&self) -> MutexGuard<'_, Events> {
        self.events.lock().unwrap()
    }
}

impl PacketHandler for Recorder {
    fn on_packet_received(&mut self, connection: &Connection, header: &PacketHeader, payload: &[u8]) -> bool {
        if let Some((clock, by)) = &self.tick {
            clock.advance(*by);
        }
        self.events()
            .received
            .push((connection.id(), header.packet_type, payload.to_vec()));
        true
    }
}

impl PacketLossObserver for Recorder {
    fn on_packet_lost(&mut self, connection_id: ConnectionId, packet_id: PacketId) {
        self.events().lost.push((connection_id, packet_id));
    }
}

impl ConnectionObserver for Recorder {
    fn on_connect(&mut self, connection: &Connection) {
        self.events().connected.push(connection.id());
    }

    fn on_disconnect(&mut self, id: ConnectionId, reason: DisconnectReason, endpoint: TerminationEndpoint) {
        self.events().disconnected.push((id, reason, endpoint));
    }
}

struct Peer {
    iface: NetworkInterface,
    recorder: Recorder,
}

impl Peer {
    fn new(network: &MemoryNetwork, clock: &ManualClock, config: NetworkConfig) -> Self {
        Self::with_recorder(network, clock, config, Recorder::default())
    }

    fn with_recorder(network: &MemoryNetwork, clock: &ManualClock, config: NetworkConfig, recorder: Recorder) -> Self {
        let iface = NetworkInterface::builder(network.binder(IP))
            .config(config)
            .clock(clock.clone())
            .packet_handler(recorder.clone())
            .loss_observer(recorder.clone())
            .connection_observer(recorder.clone())
            .build()
            .unwrap();
        Self { iface, recorder }
    }

    fn addr(&self) -> SocketAddr {
        self.iface.local_addr().unwrap()
    }
}

struct Setup {
    network: MemoryNetwork,
    clock: ManualClock,
    server: Peer,
    client: Peer,
    /// Client-side id of the connection to the server.
    id: ConnectionId,
}

fn server_addr() -> SocketAddr {
    SocketAddr::new(IP, SERVER_PORT)
}

/// Connect a client to a listening server and settle the handshake.
fn connected(server_config: NetworkConfig, client_config: NetworkConfig) -> Setup {
    let network = MemoryNetwork::new();
    let clock = ManualClock::new();
    let mut server = Peer::new(&network, &clock, server_config);
    server.iface.listen(SERVER_PORT).unwrap();
    let mut client = Peer::new(&network, &clock, client_config);

    let id = client.iface.connect(server_addr()).unwrap();
    server.iface.update();
    client.iface.update();
    server.iface.update();

    Setup {
        network,
        clock,
        server,
        client,
        id,
    }
}

fn default_setup() -> Setup {
    connected(NetworkConfig::default(), NetworkConfig::default())
}

#[test]
fn test_connect_completes_handshake() {
    let setup = default_setup();
    let conn = setup.client.iface.connection(setup.id).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(setup.client.recorder.events().connected, vec![setup.id]);

    let server_id = setup.server.iface.connection_id(setup.client.addr()).unwrap();
    assert_eq!(setup.server.recorder.events().connected, vec![server_id]);
    // Initiate and connection ack were both acknowledged.
    assert!(conn.reliable_queue().is_empty());
    assert!(setup.server.iface.connection(server_id).unwrap().reliable_queue().is_empty());
}

#[test]
fn test_crafted_connection_ack_promotes() {
    let network = MemoryNetwork::new();
    let clock = ManualClock::new();
    let mut client = Peer::new(&network, &clock, NetworkConfig::default());
    // Something bound at the server address so the initiate lands somewhere.
    let mut fake = Peer::new(&network, &clock, NetworkConfig::default());
    fake.iface.listen(SERVER_PORT).unwrap();

    let id = client.iface.connect(server_addr()).unwrap();
    assert_eq!(client.iface.connection(id).unwrap().state(), ConnectionState::Connecting);

    let header = PacketHeader::new(PacketType::CONNECTION_ACK, 0, Reliability::Reliable(0));
    network.inject(client.addr(), server_addr(), encode_body(PacketFlags::NONE, &header, &[]));
    client.iface.update();

    assert_eq!(client.iface.connection(id).unwrap().state(), ConnectionState::Connected);
    assert_eq!(client.recorder.events().connected, vec![id]);
}

#[test]
fn test_unreliable_and_reliable_delivery() {
    let mut setup = default_setup();
    let unreliable = setup
        .client
        .iface
        .send_unreliable_packet(setup.id, Packet::new(APP, b"fast".to_vec()))
        .unwrap();
    let reliable = setup
        .client
        .iface
        .send_reliable_packet(setup.id, Packet::new(PacketType(0x11), b"sure".to_vec()))
        .unwrap();
    assert!(!setup.client.iface.was_packet_acked(setup.id, reliable));

    setup.server.iface.update();
    {
        let events = setup.server.recorder.events();
        let payloads: Vec<_> = events.received.iter().map(|(_, t, p)| (t.0, p.clone())).collect();
        assert_eq!(payloads, vec![(0x10, b"fast".to_vec()), (0x11, b"sure".to_vec())]);
    }

    // The server owed an ack for the reliable packet and sent it.
    setup.client.iface.update();
    assert!(setup.client.iface.was_packet_acked(setup.id, unreliable));
    assert!(setup.client.iface.was_packet_acked(setup.id, reliable));
    let conn = setup.client.iface.connection(setup.id).unwrap();
    assert!(conn.reliable_queue().is_empty());
}

#[test]
fn test_loss_reported_once_then_retransmitted() {
    let mut setup = default_setup();
    let packet_id = setup
        .client
        .iface
        .send_reliable_packet(setup.id, Packet::new(APP, b"lost".to_vec()))
        .unwrap();
    // The server never updates, so nothing is acked.
    setup.network.drain(server_addr());

    setup.clock.advance(Duration::from_millis(100));
    setup.client.iface.update();
    assert!(setup.client.recorder.events().lost.is_empty());

    setup.clock.advance(Duration::from_millis(150));
    setup.client.iface.update();
    assert_eq!(setup.client.recorder.events().lost, vec![(setup.id, packet_id)]);
    assert_eq!(setup.client.iface.metrics().retransmissions, 1);

    // The retransmission reaches the server under the same reliable sequence.
    setup.server.iface.update();
    {
        let events = setup.server.recorder.events();
        assert_eq!(events.received.len(), 1);
        assert_eq!(events.received[0].2, b"lost");
    }

    // Its ack is credited to the id the caller holds.
    setup.client.iface.update();
    assert!(setup.client.iface.was_packet_acked(setup.id, packet_id));
    assert!(setup.client.iface.connection(setup.id).unwrap().reliable_queue().is_empty());
}

#[test]
fn test_retransmitted_packet_reported_once_and_acked() {
    let mut setup = default_setup();
    let packet_id = setup
        .client
        .iface
        .send_reliable_packet(setup.id, Packet::new(APP, b"again".to_vec()))
        .unwrap();

    // Drop the first two transmissions.
    for _ in 0..2 {
        setup.network.drain(server_addr());
        setup.clock.advance(Duration::from_millis(250));
        setup.client.iface.update();
    }
    assert_eq!(setup.client.iface.metrics().retransmissions, 2);
    assert!(!setup.client.iface.was_packet_acked(setup.id, packet_id));

    for _ in 0..3 {
        setup.server.iface.update();
        setup.client.iface.update();
    }
    assert!(setup.client.iface.was_packet_acked(setup.id, packet_id));
    assert_eq!(setup.client.recorder.events().lost, vec![(setup.id, packet_id)]);
    assert_eq!(setup.server.recorder.events().received.len(), 1);

    // Nothing left to time out.
    setup.clock.advance(Duration::from_secs(1));
    setup.client.iface.update();
    assert_eq!(setup.client.recorder.events().lost, vec![(setup.id, packet_id)]);
    assert_eq!(setup.client.iface.metrics().retransmissions, 2);
}

#[test]
fn test_duplicate_reliable_delivered_once() {
    let mut setup = default_setup();
    setup
        .client
        .iface
        .send_reliable_packet(setup.id, Packet::new(APP, b"once".to_vec()))
        .unwrap();
    let original = setup.network.drain(server_addr());
    assert_eq!(original.len(), 1);

    // Let it time out so the client re-sends, then deliver both copies.
    setup.clock.advance(Duration::from_millis(250));
    setup.client.iface.update();
    for datagram in original {
        setup.network.inject(server_addr(), datagram.from, datagram.data);
    }
    setup.server.iface.update();

    let server_id = setup.server.iface.connection_id(setup.client.addr()).unwrap();
    assert_eq!(setup.server.recorder.events().received.len(), 1);
    let metrics = setup.server.iface.connection(server_id).unwrap().metrics();
    assert_eq!(metrics.duplicates_dropped, 1);
}

#[test]
fn test_retransmit_limit_disconnects() {
    let config = NetworkConfig::builder().max_reliable_retransmits(2).build().unwrap();
    let mut setup = connected(NetworkConfig::default(), config);
    let packet_id = setup
        .client
        .iface
        .send_reliable_packet(setup.id, Packet::new(APP, vec![1; 8]))
        .unwrap();

    for _ in 0..3 {
        setup.clock.advance(Duration::from_millis(250));
        setup.client.iface.update();
    }

    let events = setup.client.recorder.events();
    // Three transmissions lost, one report.
    assert_eq!(events.lost, vec![(setup.id, packet_id)]);
    assert_eq!(setup.client.iface.metrics().packets_lost, 3);
    assert_eq!(
        events.disconnected,
        vec![(setup.id, DisconnectReason::ReliableTransportFailure, TerminationEndpoint::Local)]
    );
    drop(events);
    assert_eq!(setup.client.iface.connection_count(), 0);
}

#[test]
fn test_fragmented_reliable_packet() {
    let mut setup = default_setup();
    let config = setup.client.iface.config().clone();
    // Flags and an unreliable header travel inside the fragments.
    let payload: Vec<u8> = (0..3 * config.chunk_size() - 12).map(|i| i as u8).collect();

    let parent = setup
        .client
        .iface
        .send_reliable_packet(setup.id, Packet::new(APP, payload.clone()))
        .unwrap();
    assert_eq!(setup.network.pending(server_addr()), 3);
    assert_eq!(setup.client.iface.metrics().packets_fragmented, 1);
    assert!(!setup.client.iface.was_packet_acked(setup.id, parent));

    setup.server.iface.update();
    {
        let events = setup.server.recorder.events();
        assert_eq!(events.received.len(), 1);
        assert_eq!(events.received[0].1, APP);
        assert_eq!(events.received[0].2, payload);
    }

    setup.client.iface.update();
    assert!(setup.client.iface.was_packet_acked(setup.id, parent));
}

#[test]
fn test_local_sequence_increases_across_fragments() {
    let mut setup = default_setup();
    let mtu = setup.client.iface.config().mtu;
    setup
        .client
        .iface
        .send_unreliable_packet(setup.id, Packet::new(APP, vec![1]))
        .unwrap();
    setup
        .client
        .iface
        .send_unreliable_packet(setup.id, Packet::new(APP, vec![2; 2 * mtu]))
        .unwrap();
    setup
        .client
        .iface
        .send_unreliable_packet(setup.id, Packet::new(APP, vec![3]))
        .unwrap();

    let datagrams = setup.network.drain(server_addr());
    assert_eq!(datagrams.len(), 5);
    let headers: Vec<PacketHeader> = datagrams
        .iter()
        .map(|datagram| {
            let (_, body) = read_flags(&datagram.data).unwrap();
            PacketHeader::read(body).unwrap().0
        })
        .collect();

    let types: Vec<_> = headers.iter().map(|header| header.packet_type).collect();
    assert_eq!(types[0], APP);
    assert!(types[1..4].iter().all(|t| *t == PacketType::FRAGMENT));
    assert_eq!(types[4], APP);
    for pair in headers.windows(2) {
        assert_eq!(pair[1].local_sequence, pair[0].local_sequence.wrapping_add(1));
    }
}

#[test]
fn test_lost_unreliable_fragment_abandons_parent() {
    let mut setup = default_setup();
    let payload = vec![7u8; 2 * setup.client.iface.config().mtu];
    let parent = setup
        .client
        .iface
        .send_unreliable_packet(setup.id, Packet::new(APP, payload))
        .unwrap();
    let mut chunks = setup.network.drain(server_addr());
    assert!(chunks.len() >= 2);
    chunks.pop();
    for datagram in chunks {
        setup.network.inject(server_addr(), datagram.from, datagram.data);
    }
    setup.server.iface.update();
    assert!(setup.server.recorder.events().received.is_empty());

    setup.clock.advance(Duration::from_millis(250));
    setup.client.iface.update();
    assert_eq!(setup.client.recorder.events().lost, vec![(setup.id, parent)]);
    assert!(!setup.client.iface.was_packet_acked(setup.id, parent));
}

#[test]
fn test_receive_time_slice() {
    let network = MemoryNetwork::new();
    let clock = ManualClock::new();
    let recorder = Recorder {
        tick: Some((clock.clone(), Duration::from_micros(100))),
        ..Recorder::default()
    };
    let config = NetworkConfig::builder()
        .packet_time_slice(Duration::from_millis(1))
        .build()
        .unwrap();
    let mut server = Peer::with_recorder(&network, &clock, config, recorder);
    server.iface.listen(SERVER_PORT).unwrap();
    let mut client = Peer::new(&network, &clock, NetworkConfig::default());
    client.iface.connect(server_addr()).unwrap();
    server.iface.update();
    client.iface.update();
    server.iface.update();
    let received_before = server.iface.metrics().datagrams_received;

    for sequence in 0..1100u16 {
        let header = PacketHeader::new(APP, 100 + sequence, Reliability::Unreliable);
        network.inject(server_addr(), client.addr(), encode_body(PacketFlags::NONE, &header, &[0]));
    }
    server.iface.update();

    assert_eq!(server.recorder.events().received.len(), 11);
    assert_eq!(server.iface.metrics().datagrams_received - received_before, 11);
    assert_eq!(server.iface.metrics().datagrams_discarded, 1089);
}

#[test]
fn test_disconnect_reaches_peer() {
    let mut setup = default_setup();
    let server_id = setup.server.iface.connection_id(setup.client.addr()).unwrap();

    assert!(setup.client.iface.disconnect(setup.id, DisconnectReason::TerminatedByUser));
    setup.client.iface.update();
    setup.server.iface.update();

    assert_eq!(
        setup.client.recorder.events().disconnected,
        vec![(setup.id, DisconnectReason::TerminatedByUser, TerminationEndpoint::Local)]
    );
    assert_eq!(
        setup.server.recorder.events().disconnected,
        vec![(server_id, DisconnectReason::TerminatedByRemote, TerminationEndpoint::Remote)]
    );
    assert_eq!(setup.client.iface.connection_count(), 0);
    assert_eq!(setup.server.iface.connection_count(), 0);

    // Removed ids stay dead.
    assert!(!setup.client.iface.disconnect(setup.id, DisconnectReason::TerminatedByUser));
    assert!(matches!(
        setup.client.iface.send_unreliable_packet(setup.id, Packet::new(APP, vec![])),
        Err(NetworkError::UnknownConnection(_))
    ));
}

#[test]
fn test_idle_acceptor_times_out() {
    let config = NetworkConfig::builder()
        .idle_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut setup = connected(config, NetworkConfig::default());
    let server_id = setup.server.iface.connection_id(setup.client.addr()).unwrap();

    setup.clock.advance(Duration::from_millis(800));
    setup.server.iface.update();
    assert_eq!(setup.server.iface.connection_count(), 1);

    setup.clock.advance(Duration::from_millis(400));
    setup.server.iface.update();
    assert_eq!(
        setup.server.recorder.events().disconnected,
        vec![(server_id, DisconnectReason::Timeout, TerminationEndpoint::Local)]
    );
    assert_eq!(setup.server.iface.connection_count(), 0);
}

#[test]
fn test_heartbeats_keep_connection_alive() {
    let config = NetworkConfig::builder()
        .idle_timeout(Duration::from_secs(3))
        .build()
        .unwrap();
    let mut setup = connected(config, NetworkConfig::default());

    // Default heartbeat interval is 2s, well inside the 3s idle timeout.
    for _ in 0..10 {
        setup.clock.advance(Duration::from_millis(500));
        setup.client.iface.update();
        setup.server.iface.update();
    }
    assert_eq!(setup.server.iface.connection_count(), 1);
    assert!(setup.server.recorder.events().disconnected.is_empty());
}

#[test]
fn test_idle_timeout_can_be_disabled() {
    let config = NetworkConfig::builder()
        .idle_timeout(Duration::from_secs(1))
        .timeout_idle_connections(false)
        .build()
        .unwrap();
    let mut setup = connected(config, NetworkConfig::default());

    setup.clock.advance(Duration::from_secs(5));
    setup.server.iface.update();
    assert_eq!(setup.server.iface.connection_count(), 1);
}

#[test]
fn test_simulated_loss_drops_everything() {
    let config = NetworkConfig::builder().simulated_loss(1.0).build().unwrap();
    let mut setup = connected(NetworkConfig::default(), config);
    // The initiate packet was dropped too.
    assert_eq!(setup.server.iface.connection_count(), 0);
    assert!(setup.client.iface.metrics().simulated_drops > 0);
    assert_eq!(setup.client.iface.metrics().datagrams_sent, 0);

    setup.client.iface.update();
    assert_eq!(setup.network.pending(server_addr()), 0);
}

#[cfg(feature = "compression")]
#[test]
fn test_compression_sets_flag_and_round_trips() {
    let network = MemoryNetwork::new();
    let clock = ManualClock::new();
    let server_recorder = Recorder::default();
    let mut server = NetworkInterface::builder(network.binder(IP))
        .clock(clock.clone())
        .compressor(ZstdCompressor::new())
        .packet_handler(server_recorder.clone())
        .build()
        .unwrap();
    server.listen(SERVER_PORT).unwrap();
    let mut client = NetworkInterface::builder(network.binder(IP))
        .clock(clock.clone())
        .compressor(ZstdCompressor::new())
        .build()
        .unwrap();
    let id = client.connect(server_addr()).unwrap();

    // The initiate packet is never compressed.
    let initiate = network.drain(server_addr());
    assert_eq!(initiate[0].data[0], 0x00);
    for datagram in initiate {
        network.inject(server_addr(), datagram.from, datagram.data);
    }
    server.update();
    client.update();

    client.send_unreliable_packet(id, Packet::new(APP, vec![0u8; 500])).unwrap();
    client.send_unreliable_packet(id, Packet::new(APP, vec![1u8; 4])).unwrap();
    let datagrams = network.drain(server_addr());
    let compressed = datagrams.iter().find(|d| d.data[0] == 0x01).unwrap();
    assert!(compressed.data.len() < 500);
    assert!(datagrams.iter().any(|d| d.data[0] == 0x00 && d.data.ends_with(&[1u8; 4])));
    assert!(client.metrics().packets_compressed >= 1);

    for datagram in datagrams {
        network.inject(server_addr(), datagram.from, datagram.data);
    }
    server.update();
    let events = server_recorder.events();
    let payloads: Vec<_> = events.received.iter().map(|(_, _, p)| p.clone()).collect();
    assert_eq!(payloads, vec![vec![0u8; 500], vec![1u8; 4]]);
}
