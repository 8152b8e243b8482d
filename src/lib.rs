//! # datagram-transport
//!
//! Connection-oriented transport over UDP for real-time applications.
//!
//! A [`NetworkInterface`](transport::NetworkInterface) owns one socket and
//! any number of connections to remote peers. Over each connection it
//! provides:
//!
//! - **Unreliable packets**: sent once, loss reported to an observer
//! - **Reliable packets**: retransmitted until acknowledged, delivered once
//! - **Piggybacked acks**: every header acks the last 33 received sequences
//! - **Fragmentation**: packets over the MTU are split and reassembled
//! - **Compression**: optional, per packet, only when it actually shrinks
//! - **Encryption**: pluggable [`SecureEndpoint`](crypto::SecureEndpoint)s
//!
//! All work happens inside [`update`](transport::NetworkInterface::update),
//! called once per frame from a single thread. Time is read from a
//! [`Clock`](transport::Clock) so the whole stack can be driven
//! deterministically in tests.
//!
//! ## Feature Flags
//!
//! - `crypto` (default): pre-shared-key endpoint (HKDF-SHA256, XChaCha20-Poly1305)
//! - `compression` (default): zstd compressor
//!
//! ## Modules
//!
//! - [`core`]: Constants and error types (always included)
//! - [`transport`]: Wire format, connections and the network interface
//! - [`crypto`]: Secure endpoints
//! - [`extensions`]: Compression
//!
//! ## Example Usage
//!
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use datagram_transport::prelude::*;
//!
//! let network = MemoryNetwork::new();
//! let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
//!
//! let mut server = NetworkInterface::builder(network.binder(ip)).build()?;
//! server.listen(7000)?;
//!
//! let mut client = NetworkInterface::builder(network.binder(ip)).build()?;
//! let id = client.connect(server.local_addr().ok_or(NetworkError::NotOpen)?)?;
//!
//! server.update(); // accepts and answers
//! client.update(); // sees the answer
//! assert_eq!(
//!     client.connection(id).map(|c| c.state()),
//!     Some(ConnectionState::Connected)
//! );
//!
//! client.send_reliable_packet(id, Packet::new(PacketType(0x10), b"hello".to_vec()))?;
//! # Ok::<(), NetworkError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod crypto;
pub mod extensions;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{CompressionError, ConfigError, CryptoError, FragmentError, HeaderError};

    pub use crate::transport::{
        Clock, Connection, ConnectionId, ConnectionObserver, ConnectionRole, ConnectionState,
        ConnectionValidator, CorePacket, DisconnectReason, InterfaceMetrics, ManualClock,
        MemoryNetwork, NetworkConfig, NetworkError, NetworkInterface, NetworkResult, Packet,
        PacketHandler, PacketHeader, PacketId, PacketLossObserver, PacketType, SystemClock,
        TerminationEndpoint, UdpBinder,
    };

    pub use crate::crypto::{PlaintextFactory, SecureEndpoint, SecureEndpointFactory};

    #[cfg(feature = "crypto")]
    pub use crate::crypto::PskFactory;

    pub use crate::extensions::Compressor;

    #[cfg(feature = "compression")]
    pub use crate::extensions::ZstdCompressor;
}

pub use transport::{
    ConnectionId, DisconnectReason, NetworkConfig, NetworkError, NetworkInterface, Packet,
    PacketType,
};
