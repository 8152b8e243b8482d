//! Network interface configuration.

use std::time::Duration;

use super::connection_set::ConnectionId;
use crate::core::{
    ConfigError, DEFAULT_DECRYPT_FAILURE_LIMIT, DEFAULT_FRAGMENT_OVERHEAD,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_DECOMPRESSED_SIZE, DEFAULT_MAX_FRAGMENT_GROUPS,
    DEFAULT_MAX_PACKET_TIMEOUTS_PER_UPDATE, DEFAULT_MAX_RELIABLE_RETRANSMITS,
    DEFAULT_MIN_PACKET_TIMEOUT, DEFAULT_MTU, DEFAULT_PACKET_TIME_SLICE,
    DEFAULT_RECEIVE_QUEUE_CAPACITY, DEFAULT_RELIABLE_QUEUE_CAPACITY, DEFAULT_RTT_FUDGE,
    MAX_DATAGRAM_SIZE, MIN_FRAGMENT_OVERHEAD,
};

/// Tunables for a [`NetworkInterface`](super::NetworkInterface).
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Wall-clock budget for processing received datagrams per update.
    pub packet_time_slice: Duration,

    /// How often connectors send a heartbeat.
    pub heartbeat_interval: Duration,

    /// How long an acceptor may stay silent before it is timed out.
    pub idle_timeout: Duration,

    /// Floor for the per-packet ack timeout.
    pub min_packet_timeout: Duration,

    /// Multiplier applied to the smoothed RTT for the ack timeout.
    pub rtt_fudge: f64,

    /// Packet timeouts processed per update; the rest wait.
    pub max_packet_timeouts_per_update: usize,

    /// Bytes deducted from the MTU for each fragment chunk.
    pub fragment_overhead: usize,

    /// Disconnect acceptors that stay silent for `idle_timeout`.
    pub timeout_idle_connections: bool,

    /// Largest serialized packet sent without fragmenting.
    pub mtu: usize,

    /// Cap on live connections.
    pub max_connections: usize,

    /// Reliable packets awaiting ack per connection.
    pub reliable_queue_capacity: usize,

    /// Retransmissions before a reliable packet is abandoned.
    pub max_reliable_retransmits: u32,

    /// Consecutive undecodable datagrams tolerated per connection.
    pub decrypt_failure_limit: u32,

    /// Partially reassembled packets kept per connection.
    pub max_fragment_groups: usize,

    /// Datagrams buffered between the socket reader and `update`.
    pub receive_queue_capacity: usize,

    /// Limit on a decompressed packet body.
    pub max_decompressed_size: usize,

    /// Probability in [0, 1] of silently skipping a socket write.
    pub simulated_loss: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            packet_time_slice: DEFAULT_PACKET_TIME_SLICE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            min_packet_timeout: DEFAULT_MIN_PACKET_TIMEOUT,
            rtt_fudge: DEFAULT_RTT_FUDGE,
            max_packet_timeouts_per_update: DEFAULT_MAX_PACKET_TIMEOUTS_PER_UPDATE,
            fragment_overhead: DEFAULT_FRAGMENT_OVERHEAD,
            timeout_idle_connections: true,
            mtu: DEFAULT_MTU,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reliable_queue_capacity: DEFAULT_RELIABLE_QUEUE_CAPACITY,
            max_reliable_retransmits: DEFAULT_MAX_RELIABLE_RETRANSMITS,
            decrypt_failure_limit: DEFAULT_DECRYPT_FAILURE_LIMIT,
            max_fragment_groups: DEFAULT_MAX_FRAGMENT_GROUPS,
            receive_queue_capacity: DEFAULT_RECEIVE_QUEUE_CAPACITY,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
            simulated_loss: 0.0,
        }
    }
}

impl NetworkConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder::new()
    }

    /// Payload bytes carried by each fragment chunk.
    pub fn chunk_size(&self) -> usize {
        self.mtu - self.fragment_overhead
    }

    /// Check every value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::MtuTooLarge(self.mtu));
        }
        if self.fragment_overhead < MIN_FRAGMENT_OVERHEAD || self.fragment_overhead >= self.mtu {
            return Err(ConfigError::FragmentOverhead {
                overhead: self.fragment_overhead,
                min: MIN_FRAGMENT_OVERHEAD,
                mtu: self.mtu,
            });
        }
        if self.rtt_fudge.is_nan() || self.rtt_fudge < 1.0 {
            return Err(ConfigError::RttFudge(self.rtt_fudge));
        }
        if !(0.0..=1.0).contains(&self.simulated_loss) {
            return Err(ConfigError::SimulatedLoss(self.simulated_loss));
        }
        if self.max_connections > ConnectionId::MAX_SLOTS {
            return Err(ConfigError::TooManyConnections(self.max_connections));
        }

        let non_zero = [
            (self.max_connections, "max_connections"),
            (self.reliable_queue_capacity, "reliable_queue_capacity"),
            (self.max_fragment_groups, "max_fragment_groups"),
            (self.receive_queue_capacity, "receive_queue_capacity"),
            (self.max_packet_timeouts_per_update, "max_packet_timeouts_per_update"),
            (self.decrypt_failure_limit as usize, "decrypt_failure_limit"),
        ];
        for (value, name) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for (value, name) in [
            (self.heartbeat_interval, "heartbeat_interval"),
            (self.idle_timeout, "idle_timeout"),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }
}

/// Builder for [`NetworkConfig`].
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    config: NetworkConfig,
}

impl NetworkConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive time slice.
    pub fn packet_time_slice(mut self, slice: Duration) -> Self {
        self.config.packet_time_slice = slice;
        self
    }

    /// Set the connector heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the acceptor idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the ack timeout floor.
    pub fn min_packet_timeout(mut self, timeout: Duration) -> Self {
        self.config.min_packet_timeout = timeout;
        self
    }

    /// Set the RTT multiplier.
    pub fn rtt_fudge(mut self, fudge: f64) -> Self {
        self.config.rtt_fudge = fudge;
        self
    }

    /// Set the packet timeouts processed per update.
    pub fn max_packet_timeouts_per_update(mut self, max: usize) -> Self {
        self.config.max_packet_timeouts_per_update = max;
        self
    }

    /// Set the per-chunk fragment overhead.
    pub fn fragment_overhead(mut self, overhead: usize) -> Self {
        self.config.fragment_overhead = overhead;
        self
    }

    /// Enable or disable acceptor idle timeouts.
    pub fn timeout_idle_connections(mut self, enabled: bool) -> Self {
        self.config.timeout_idle_connections = enabled;
        self
    }

    /// Set the MTU.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the connection cap.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the reliable queue capacity.
    pub fn reliable_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.reliable_queue_capacity = capacity;
        self
    }

    /// Set the retransmission limit.
    pub fn max_reliable_retransmits(mut self, max: u32) -> Self {
        self.config.max_reliable_retransmits = max;
        self
    }

    /// Set the consecutive decode failure limit.
    pub fn decrypt_failure_limit(mut self, limit: u32) -> Self {
        self.config.decrypt_failure_limit = limit;
        self
    }

    /// Set the partial fragment group limit.
    pub fn max_fragment_groups(mut self, max: usize) -> Self {
        self.config.max_fragment_groups = max;
        self
    }

    /// Set the receive queue capacity.
    pub fn receive_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.receive_queue_capacity = capacity;
        self
    }

    /// Set the decompressed size limit.
    pub fn max_decompressed_size(mut self, max: usize) -> Self {
        self.config.max_decompressed_size = max;
        self
    }

    /// Set the simulated loss probability.
    pub fn simulated_loss(mut self, probability: f64) -> Self {
        self.config.simulated_loss = probability;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
