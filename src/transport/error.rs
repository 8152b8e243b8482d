//! Transport layer error types.
//!
//! Errors raised while decoding a received datagram never reach the
//! application; the interface drops the datagram (or escalates into a
//! disconnect) and logs. Errors from the public operations are returned.

use std::io;

use thiserror::Error;

use super::connection_set::ConnectionId;
use crate::core::{CompressionError, ConfigError, CryptoError, FragmentError, HeaderError};

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Header or core packet parsing error.
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// Fragment envelope error.
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Secure endpoint failed to encode or decode.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration rejected.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// `listen` called while a socket is already open.
    #[error("socket already open")]
    AlreadyOpen,

    /// No socket is open.
    #[error("socket not open")]
    NotOpen,

    /// The id does not name a live connection.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The connection is shutting down and accepts no new packets.
    #[error("connection {0} is disconnecting")]
    Disconnecting(ConnectionId),

    /// A connection to this address already exists.
    #[error("already connected to {0}")]
    AlreadyConnected(std::net::SocketAddr),

    /// Connection limit reached.
    #[error("too many connections")]
    TooManyConnections,

    /// Reliable send queue is full.
    #[error("reliable queue full")]
    ReliableQueueFull,

    /// Application attempted to send a reserved packet type.
    #[error("packet type 0x{0:04x} is reserved for the transport")]
    ReservedPacketType(u16),
}

impl NetworkError {
    /// Check if this error came from decoding received bytes.
    ///
    /// Such errors drop the datagram without replying.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            NetworkError::Header(_)
                | NetworkError::Fragment(_)
                | NetworkError::Compression(_)
                | NetworkError::Crypto(_)
        )
    }

    /// Check if this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetworkError::ReliableQueueFull | NetworkError::Disconnecting(_)
        )
    }
}

/// Result type for transport operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
