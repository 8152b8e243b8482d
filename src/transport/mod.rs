//! Transport layer.
//!
//! Turns a datagram socket into a set of connections that carry reliable and
//! unreliable packets. It provides:
//!
//! - **Wire format**: [`PacketHeader`], [`CorePacket`] and packet flags
//! - **Connections**: [`Connection`] state, ack windows and RTT estimation
//! - **Reliability**: [`ReliableQueue`] with retransmission on ack timeout
//! - **Fragmentation**: [`split`] and [`FragmentQueue`] for packets over the MTU
//! - **Timeouts**: [`TimeoutQueue`] driving heartbeats, idle and ack timeouts
//! - **Interface**: [`NetworkInterface`], the single-threaded entry point
//! - **Sockets**: [`UdpBinder`] over tokio and [`MemoryNetwork`] for tests
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Application                  │
//! │   PacketHandler, observers, validator   │
//! ├─────────────────────────────────────────┤
//! │         NetworkInterface::update        │  ← This module
//! │   acks, reliability, fragments, timers  │
//! ├─────────────────────────────────────────┤
//! │   Compressor (optional)                 │
//! ├─────────────────────────────────────────┤
//! │   SecureEndpoint (plaintext or PSK)     │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod clock;
mod config;
mod connection;
mod connection_set;
mod error;
mod fragment;
mod handler;
mod header;
mod interface;
mod memory;
mod metrics;
mod reliable;
mod socket;
mod timeout;
mod timing;
mod window;

pub use clock::*;
pub use config::*;
pub use connection::*;
pub use connection_set::*;
pub use error::*;
pub use fragment::{FragmentQueue, FragmentedPacket, Reassembly, split};
pub use handler::*;
pub use header::*;
pub use interface::*;
pub use memory::*;
pub use metrics::*;
pub use reliable::*;
pub use socket::*;
pub use timeout::*;
pub use timing::{RttEstimator, constants as timing_constants};
pub use window::*;
