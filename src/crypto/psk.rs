//! Pre-shared-key secure endpoint.
//!
//! Both sides derive a pair of directional keys from a shared secret:
//!
//! ```text
//! key_material = HKDF-SHA256(salt = "datagram-transport psk v1", ikm = secret,
//!                            info = "directional keys", 64)
//! connector -> acceptor = key_material[..32]
//! acceptor -> connector = key_material[32..]
//! ```
//!
//! Each datagram is sealed under a random 24-byte nonce. A connector counts
//! as handshaking until it has authenticated one datagram from the acceptor,
//! which proves the acceptor holds the same secret.

use std::net::SocketAddr;
use std::sync::Arc;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::aead::{SessionKey, open, seal};
use super::endpoint::{SecureEndpoint, SecureEndpointFactory};
use crate::core::{CryptoError, KEY_SIZE};
use crate::transport::ConnectionRole;

const SALT: &[u8] = b"datagram-transport psk v1";
const INFO: &[u8] = b"directional keys";

/// Keys derived from a pre-shared secret.
#[derive(Debug, Clone)]
pub struct PskKeys {
    connector_to_acceptor: SessionKey,
    acceptor_to_connector: SessionKey,
}

impl PskKeys {
    /// Derive both directional keys from `secret`.
    pub fn derive(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::KeyDerivationFailed);
        }
        let hk = Hkdf::<Sha256>::new(Some(SALT), secret);
        let mut key_material = Zeroizing::new([0u8; 2 * KEY_SIZE]);
        hk.expand(INFO, &mut key_material[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut first = [0u8; KEY_SIZE];
        let mut second = [0u8; KEY_SIZE];
        first.copy_from_slice(&key_material[..KEY_SIZE]);
        second.copy_from_slice(&key_material[KEY_SIZE..]);
        let keys = Self {
            connector_to_acceptor: SessionKey::from_bytes(first),
            acceptor_to_connector: SessionKey::from_bytes(second),
        };
        first.zeroize();
        second.zeroize();
        Ok(keys)
    }
}

/// XChaCha20-Poly1305 endpoint keyed from a pre-shared secret.
#[derive(Debug)]
pub struct PskEndpoint {
    send_key: SessionKey,
    recv_key: SessionKey,
    authenticated: bool,
}

impl PskEndpoint {
    /// Create the endpoint for one side of a connection.
    pub fn new(keys: &PskKeys, role: ConnectionRole) -> Self {
        let (send_key, recv_key) = match role {
            ConnectionRole::Connector => (
                keys.connector_to_acceptor.clone(),
                keys.acceptor_to_connector.clone(),
            ),
            ConnectionRole::Acceptor => (
                keys.acceptor_to_connector.clone(),
                keys.connector_to_acceptor.clone(),
            ),
        };
        Self {
            send_key,
            recv_key,
            // The acceptor only exists after authenticating the initiator.
            authenticated: role == ConnectionRole::Acceptor,
        }
    }
}

impl SecureEndpoint for PskEndpoint {
    fn is_connecting(&self) -> bool {
        !self.authenticated
    }

    fn poll_handshake(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(&self.send_key, &[], plaintext)
    }

    fn decode(&mut self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = open(&self.recv_key, &[], datagram)?;
        self.authenticated = true;
        Ok(plaintext)
    }
}

/// Factory handing every connection a [`PskEndpoint`] over the same keys.
#[derive(Debug, Clone)]
pub struct PskFactory {
    keys: Arc<PskKeys>,
}

impl PskFactory {
    /// Derive keys from `secret`.
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            keys: Arc::new(PskKeys::derive(secret)?),
        })
    }
}

impl SecureEndpointFactory for PskFactory {
    fn create(
        &self,
        role: ConnectionRole,
        _remote_addr: SocketAddr,
    ) -> Result<Box<dyn SecureEndpoint>, CryptoError> {
        Ok(Box::new(PskEndpoint::new(&self.keys, role)))
    }
}
