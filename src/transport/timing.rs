//! Round-trip time estimation.
//!
//! Smoothing follows RFC 6298. Samples come from acked transmissions that
//! reached the socket. A retransmission gets a packet id of its own, so an
//! ack always matches the transmission it answers.

use std::time::Duration;

/// RTT smoothing constants.
pub mod constants {
    use std::time::Duration;

    /// Alpha for SRTT smoothing (0.125 = 1/8).
    pub const SRTT_ALPHA: f64 = 0.125;

    /// Beta for RTTVAR smoothing (0.25 = 1/4).
    pub const RTTVAR_BETA: f64 = 0.25;

    /// Largest sample accepted; anything above is a stale ack.
    pub const MAX_SAMPLE: Duration = Duration::from_secs(60);
}

/// Smoothed RTT estimator.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Samples folded in so far.
    samples: u64,
}

impl RttEstimator {
    /// Create an estimator with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a new sample.
    ///
    /// - First measurement: SRTT = sample, RTTVAR = sample / 2
    /// - Subsequent: RTTVAR = 0.75 * RTTVAR + 0.25 * |SRTT - sample|,
    ///   SRTT = 0.875 * SRTT + 0.125 * sample
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.min(constants::MAX_SAMPLE).as_secs_f64() * 1000.0;

        if self.samples == 0 {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
        } else {
            self.rttvar = (1.0 - constants::RTTVAR_BETA) * self.rttvar
                + constants::RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt =
                (1.0 - constants::SRTT_ALPHA) * self.srtt + constants::SRTT_ALPHA * sample_ms;
        }
        self.samples += 1;
    }

    /// Smoothed RTT; zero before the first sample.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt / 1000.0)
    }

    /// RTT variance; zero before the first sample.
    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar / 1000.0)
    }

    /// Whether at least one sample has been folded in.
    pub fn is_initialized(&self) -> bool {
        self.samples > 0
    }

    /// Number of samples folded in.
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// How long to wait for an ack before declaring a packet lost:
    /// `max(floor, SRTT * fudge)`.
    pub fn packet_timeout(&self, floor: Duration, fudge: f64) -> Duration {
        if !self.is_initialized() {
            return floor;
        }
        floor.max(Duration::from_secs_f64(self.srtt * fudge / 1000.0))
    }
}
