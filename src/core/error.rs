//! Error types shared across layers.

use thiserror::Error;

/// Errors that can occur when decoding a packet header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Buffer ended before the header did.
    #[error("header too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Reserved bits of the cleartext flags byte are set.
    #[error("invalid packet flags: 0x{0:02x} (reserved bits must be 0)")]
    InvalidFlags(u8),

    /// Reserved bits of the header flags are set.
    #[error("invalid header flags: 0x{0:02x} (reserved bits must be 0)")]
    InvalidHeaderFlags(u8),

    /// A core packet carried a payload it cannot be parsed from.
    #[error("malformed core packet payload for type 0x{0:04x}")]
    MalformedCorePacket(u16),
}

/// Errors that can occur when splitting or reassembling fragments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Fragment envelope is truncated.
    #[error("fragment too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Chunk index is not below the chunk count.
    #[error("invalid chunk index {index} for count {count}")]
    InvalidIndex {
        /// Index carried by the chunk.
        index: u8,
        /// Count carried by the chunk.
        count: u8,
    },

    /// Packet would need more chunks than the envelope can express.
    #[error("packet of {size} bytes exceeds fragmentation limit of {max} bytes")]
    TooLarge {
        /// Serialized packet size.
        size: usize,
        /// Largest size that can be fragmented.
        max: usize,
    },

    /// Chunk size leaves no room for payload.
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
}

/// Errors from compression operations.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Compression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Decompression failed.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Compressed flag set but no compressor is configured.
    #[error("compressed packet received without a configured compressor")]
    NoCompressor,

    /// Decompressed size exceeds safety limit.
    #[error("decompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Actual decompressed size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

/// Errors in the secure endpoint layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Datagram is shorter than nonce plus tag.
    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Handshake could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Fragment overhead does not fit the fragment envelope or the MTU.
    #[error("fragment overhead {overhead} must be in [{min}, mtu {mtu})")]
    FragmentOverhead {
        /// Configured overhead.
        overhead: usize,
        /// Smallest valid overhead.
        min: usize,
        /// Configured MTU.
        mtu: usize,
    },

    /// MTU is larger than a datagram can be.
    #[error("mtu {0} exceeds the maximum datagram size")]
    MtuTooLarge(usize),

    /// RTT multiplier below 1.0.
    #[error("rtt fudge {0} must be >= 1.0")]
    RttFudge(f64),

    /// Simulated loss outside [0, 1].
    #[error("simulated loss {0} must be within [0.0, 1.0]")]
    SimulatedLoss(f64),

    /// Connection cap exceeds what a connection id can address.
    #[error("max connections {0} exceeds the addressable slot count")]
    TooManyConnections(usize),

    /// A value that must be non-zero was zero.
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}
