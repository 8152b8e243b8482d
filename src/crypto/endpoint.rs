//! Secure endpoint boundary.
//!
//! Every datagram a connection writes passes through its endpoint's
//! [`encode`](SecureEndpoint::encode) and every datagram it reads through
//! [`decode`](SecureEndpoint::decode). The transport never looks at what the
//! endpoint does in between.

use std::net::SocketAddr;

use crate::core::CryptoError;
use crate::transport::ConnectionRole;

/// Per-connection transform applied to whole datagrams.
pub trait SecureEndpoint: Send {
    /// Whether the endpoint still needs handshake traffic before it can
    /// carry application data. Sends other than the connection-initiating
    /// packet are held back while this is true.
    fn is_connecting(&self) -> bool;

    /// Drive the handshake. Returns a raw datagram to send to the peer, if
    /// the handshake has one to send.
    fn poll_handshake(&mut self) -> Option<Vec<u8>>;

    /// Turn an outgoing plaintext datagram into wire bytes.
    fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Turn received wire bytes into plaintext.
    ///
    /// An empty result means the datagram was consumed by the handshake and
    /// carries nothing for the transport.
    fn decode(&mut self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Builds a [`SecureEndpoint`] for each new connection.
pub trait SecureEndpointFactory: Send {
    /// Create the endpoint for a connection to `remote_addr`.
    fn create(
        &self,
        role: ConnectionRole,
        remote_addr: SocketAddr,
    ) -> Result<Box<dyn SecureEndpoint>, CryptoError>;
}

/// Pass-through endpoint for unencrypted transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextEndpoint;

impl SecureEndpoint for PlaintextEndpoint {
    fn is_connecting(&self) -> bool {
        false
    }

    fn poll_handshake(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decode(&mut self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(datagram.to_vec())
    }
}

/// Factory for [`PlaintextEndpoint`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextFactory;

impl SecureEndpointFactory for PlaintextFactory {
    fn create(
        &self,
        _role: ConnectionRole,
        _remote_addr: SocketAddr,
    ) -> Result<Box<dyn SecureEndpoint>, CryptoError> {
        Ok(Box::new(PlaintextEndpoint))
    }
}
