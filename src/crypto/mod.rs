//! Secure endpoints.
//!
//! [`SecureEndpoint`] is the seam between the transport and whatever
//! protects its datagrams. [`PlaintextEndpoint`] passes bytes through;
//! with the `crypto` feature, [`PskEndpoint`] seals every datagram with
//! XChaCha20-Poly1305 under keys derived from a pre-shared secret.

mod endpoint;

#[cfg(feature = "crypto")]
mod aead;
#[cfg(feature = "crypto")]
mod psk;

pub use endpoint::*;

#[cfg(feature = "crypto")]
pub use aead::{SessionKey, open, seal};
#[cfg(feature = "crypto")]
pub use psk::{PskEndpoint, PskFactory, PskKeys};
