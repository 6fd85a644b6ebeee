//! Stack-wide tunables.

use std::time::Duration;

/// Default maximum segment size, in payload bytes.
pub const DEFAULT_MSS: usize = 1460;

/// Which address the ICMP Time-Exceeded reply is routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExceededRoute {
    /// Look up the next hop for the expired packet's source.
    Source,
    /// Look up the next hop for our own address. Kept for interoperability
    /// with routers that expect the reply to leave through the local route.
    LocalAddress,
}

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Largest payload carried by one segment; also the initial window limit.
    pub mss: usize,
    /// Retransmission timeout used before any RTT sample exists.
    pub initial_rto: Duration,
    /// TTL stamped on locally originated packets.
    pub default_ttl: u8,
    /// How long a connection that sent its FIN may linger before eviction.
    pub close_timeout: Duration,
    /// How long a connection may go without an accepted segment from the peer
    /// before eviction. Covers handshakes that never complete.
    pub idle_timeout: Duration,
    pub time_exceeded_route: TimeExceededRoute,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            mss: DEFAULT_MSS,
            initial_rto: Duration::from_secs(1),
            default_ttl: 64,
            close_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            time_exceeded_route: TimeExceededRoute::Source,
        }
    }
}

impl StackConfig {
    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss;
        self
    }

    pub fn with_initial_rto(mut self, rto: Duration) -> Self {
        self.initial_rto = rto;
        self
    }

    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_time_exceeded_route(mut self, route: TimeExceededRoute) -> Self {
        self.time_exceeded_route = route;
        self
    }
}
