//! Mesh configuration

use std::time::Duration;

/// Tunables the core recognizes
///
/// Defaults match the wire-compatibility constants; change them only
/// when every node in the mesh agrees.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Initial hop budget for new packets
    pub max_ttl: u8,
    /// Maximum serialized packet size, bytes
    pub max_packet_size: usize,
    /// Seen-set high watermark
    pub seen_set_high: usize,
    /// Seen-set size after compaction
    pub seen_set_low: usize,
    /// Period between ANNOUNCE broadcasts
    pub announce_period: Duration,
    /// DISCOVER packets emitted per scan burst, one per second
    pub scan_announce_burst: u32,
    /// Quiet time before a locally observed peer is marked disconnected
    pub soft_peer_timeout: Duration,
    /// Quiet time before a locally observed peer is reported lost
    pub hard_peer_timeout: Duration,
    /// Quiet time before a network-observed peer is marked disconnected
    pub remote_soft_peer_timeout: Duration,
    /// Base retry delay
    pub retry_base: Duration,
    /// Retry backoff multiplier
    pub retry_factor: f64,
    /// Retry delay ceiling
    pub retry_cap: Duration,
    /// Retry attempts before a message fails
    pub max_retries: u32,
    /// Minimum age of a pending entry before a reconnect drain re-emits it
    pub reconnect_drain_floor: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_ttl: 10,
            max_packet_size: 512,
            seen_set_high: 2000,
            seen_set_low: 1000,
            announce_period: Duration::from_millis(3000),
            scan_announce_burst: 5,
            soft_peer_timeout: Duration::from_millis(15_000),
            hard_peer_timeout: Duration::from_millis(45_000),
            remote_soft_peer_timeout: Duration::from_millis(60_000),
            retry_base: Duration::from_millis(2000),
            retry_factor: 1.5,
            retry_cap: Duration::from_millis(60_000),
            max_retries: 20,
            reconnect_drain_floor: Duration::from_millis(10_000),
        }
    }
}

impl MeshConfig {
    /// Hop budget on a packet as it leaves its originator
    ///
    /// The origin's own emission consumes the first unit of the
    /// `max_ttl` budget; relayers burn the rest. An 11-node chain is
    /// exactly reachable at the default budget of 10.
    pub fn initial_ttl(&self) -> u8 {
        self.max_ttl.saturating_sub(1)
    }

    /// Backoff delay before retry attempt `retries + 1`
    ///
    /// `min(base * factor^retries, cap)`
    pub fn retry_delay(&self, retries: u32) -> Duration {
        let base = self.retry_base.as_millis() as f64;
        let delay = base * self.retry_factor.powi(retries.min(64) as i32);
        let capped = delay.min(self.retry_cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Set the hop budget
    pub fn with_max_ttl(mut self, ttl: u8) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Set retry pacing
    pub fn with_retry(mut self, base: Duration, factor: f64, cap: Duration, max: u32) -> Self {
        self.retry_base = base;
        self.retry_factor = factor;
        self.retry_cap = cap;
        self.max_retries = max;
        self
    }

    /// Set presence pacing
    pub fn with_announce_period(mut self, period: Duration) -> Self {
        self.announce_period = period;
        self
    }

    /// Set peer liveness windows; the hard timeout is three soft windows
    pub fn with_peer_timeouts(mut self, soft: Duration, remote_soft: Duration) -> Self {
        self.soft_peer_timeout = soft;
        self.hard_peer_timeout = soft * 3;
        self.remote_soft_peer_timeout = remote_soft;
        self
    }
}
