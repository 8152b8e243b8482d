//! Protocol constants.
//!
//! Wire sizes are fixed by the envelope format and MUST NOT be changed
//! without bumping [`PROTOCOL_VERSION`]. Timing values are the defaults used
//! by [`NetworkConfig`](crate::transport::NetworkConfig).

use std::time::Duration;

/// Protocol version carried in the connection-initiating packet.
pub const PROTOCOL_VERSION: u16 = 0x0001;

// =============================================================================
// WIRE SIZES
// =============================================================================

/// Size of the cleartext flags byte that precedes every header.
pub const FLAGS_SIZE: usize = 1;

/// Header size for an unreliable packet
/// (type + header flags + local sequence + ack base + ack bits).
pub const UNRELIABLE_HEADER_SIZE: usize = 2 + 1 + 2 + 2 + 4;

/// Header size for a reliable packet (adds the reliable sequence id).
pub const RELIABLE_HEADER_SIZE: usize = UNRELIABLE_HEADER_SIZE + 4;

/// Fragment envelope size
/// (original packet id + fragment sequence + chunk index + chunk count).
pub const FRAGMENT_ENVELOPE_SIZE: usize = 4 + 4 + 1 + 1;

/// Smallest fragment overhead that keeps a chunk packet within the MTU.
pub const MIN_FRAGMENT_OVERHEAD: usize = FLAGS_SIZE + RELIABLE_HEADER_SIZE + FRAGMENT_ENVELOPE_SIZE;

/// Maximum number of chunks a single packet may be split into.
pub const MAX_FRAGMENT_CHUNKS: usize = u8::MAX as usize;

/// Largest datagram the socket layer will read or write.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Number of remote sequences covered by the ack bitfield.
pub const ACK_BITFIELD_SIZE: u16 = 32;

/// Number of sent sequences remembered for ack matching.
pub const SENT_WINDOW_SIZE: usize = 1024;

/// Number of ids tracked by an [`IdWindow`](crate::transport::IdWindow).
pub const ID_WINDOW_SIZE: usize = 1024;

// =============================================================================
// DEFAULT TUNABLES
// =============================================================================

/// Default maximum transmission unit for a serialized packet.
pub const DEFAULT_MTU: usize = 1200;

/// Default bytes deducted from the MTU for each fragment chunk.
pub const DEFAULT_FRAGMENT_OVERHEAD: usize = 32;

/// Default wall-clock budget for processing received datagrams per update.
pub const DEFAULT_PACKET_TIME_SLICE: Duration = Duration::from_millis(8);

/// Default heartbeat interval for Connector-role connections.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Default idle timeout for Acceptor-role connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default floor for the per-packet ack timeout.
pub const DEFAULT_MIN_PACKET_TIMEOUT: Duration = Duration::from_millis(200);

/// Default multiplier applied to the smoothed RTT to derive an ack timeout.
pub const DEFAULT_RTT_FUDGE: f64 = 2.0;

/// Default bound on packet timeouts processed per update.
pub const DEFAULT_MAX_PACKET_TIMEOUTS_PER_UPDATE: usize = 1000;

/// Default cap on live connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default number of reliable packets awaiting ack per connection.
pub const DEFAULT_RELIABLE_QUEUE_CAPACITY: usize = 512;

/// Default retransmission attempts before a reliable packet is abandoned.
pub const DEFAULT_MAX_RELIABLE_RETRANSMITS: u32 = 10;

/// Default consecutive decrypt failures tolerated per connection.
pub const DEFAULT_DECRYPT_FAILURE_LIMIT: u32 = 3;

/// Default number of partially reassembled packets kept per connection.
pub const DEFAULT_MAX_FRAGMENT_GROUPS: usize = 16;

/// Default capacity of the reader task's datagram channel.
pub const DEFAULT_RECEIVE_QUEUE_CAPACITY: usize = 8192;

/// Default limit on the size of a decompressed payload.
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 64 * 1024;

// =============================================================================
// CRYPTO SIZES
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Symmetric key size.
pub const KEY_SIZE: usize = 32;
