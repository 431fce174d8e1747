//! Puncher, listener, dialer and cache configuration.

use std::net::SocketAddr;
use std::time::Duration;

use npp_relay::RelayClientConfig;

/// Application protocol published when none is configured.
pub const DEFAULT_PROTOCOL: &str = "grpc";

/// Configuration shared by TCP and QUIC punchers.
#[derive(Debug, Clone, Copy)]
pub struct PunchConfig {
    /// Connect attempts per TCP candidate.
    pub max_attempts: usize,
    /// Timeout of a single connect attempt.
    pub connect_timeout: Duration,
    /// How long a dial keeps waiting for an inbound connection after every
    /// active attempt failed.
    pub passive_grace: Duration,
    /// How long an accepting puncher waits for the dialer to select a
    /// connection before dropping it.
    pub selection_timeout: Duration,
    /// Concurrent publish-and-punch rounds of an accepting puncher.
    pub max_concurrent_punches: usize,
    /// Capacity of the queues holding connections not yet accepted.
    pub queue_capacity: usize,
    /// Backlog of the passive TCP listener.
    pub backlog: u32,
}

impl PunchConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: 3,
            connect_timeout: Duration::from_secs(5),
            passive_grace: Duration::from_secs(1),
            selection_timeout: Duration::from_secs(10),
            max_concurrent_punches: 16,
            queue_capacity: 64,
            backlog: 128,
        }
    }

    /// Sets the connect attempts per TCP candidate.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the timeout of a single connect attempt.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the passive grace period.
    #[must_use]
    pub const fn with_passive_grace(mut self, grace: Duration) -> Self {
        self.passive_grace = grace;
        self
    }

    /// Sets the selection timeout.
    #[must_use]
    pub const fn with_selection_timeout(mut self, timeout: Duration) -> Self {
        self.selection_timeout = timeout;
        self
    }

    /// Sets the number of concurrent punch rounds.
    #[must_use]
    pub const fn with_max_concurrent_punches(mut self, max: usize) -> Self {
        self.max_concurrent_punches = max;
        self
    }
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`crate::Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address of the plain TCP listener.
    pub bind_addr: SocketAddr,
    /// Rendezvous servers, tried in order whenever a puncher is built.
    pub rendezvous: Vec<SocketAddr>,
    /// Relay nodes to register with.
    pub relays: Vec<SocketAddr>,
    /// Application protocol published on Rendezvous.
    pub protocol: String,
    /// Runs a QUIC puncher next to the TCP one.
    pub quic: bool,
    /// Number of concurrent relay registrations.
    pub relay_concurrency: usize,
    /// Capacity of the punched and relayed connection queues.
    pub backlog: usize,
    /// First delay after a failure.
    pub min_backoff: Duration,
    /// Largest delay after repeated failures.
    pub max_backoff: Duration,
    /// Puncher settings.
    pub punch: PunchConfig,
    /// Relay client settings.
    pub relay: RelayClientConfig,
}

impl ListenerConfig {
    /// Creates a configuration accepting plain TCP on `bind_addr` only.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            rendezvous: Vec::new(),
            relays: Vec::new(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            quic: false,
            relay_concurrency: 2,
            backlog: 128,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            punch: PunchConfig::new(),
            relay: RelayClientConfig::new(),
        }
    }

    /// Sets the Rendezvous servers.
    #[must_use]
    pub fn with_rendezvous(mut self, rendezvous: Vec<SocketAddr>) -> Self {
        self.rendezvous = rendezvous;
        self
    }

    /// Sets the relay nodes.
    #[must_use]
    pub fn with_relays(mut self, relays: Vec<SocketAddr>) -> Self {
        self.relays = relays;
        self
    }

    /// Sets the published protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Enables the QUIC puncher.
    #[must_use]
    pub const fn with_quic(mut self) -> Self {
        self.quic = true;
        self
    }

    /// Sets the number of concurrent relay registrations.
    #[must_use]
    pub const fn with_relay_concurrency(mut self, concurrency: usize) -> Self {
        self.relay_concurrency = concurrency;
        self
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    /// Sets the puncher settings.
    #[must_use]
    pub const fn with_punch(mut self, punch: PunchConfig) -> Self {
        self.punch = punch;
        self
    }
}

/// Configuration for [`crate::Dialer`].
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Rendezvous servers, tried in order for each punch.
    pub rendezvous: Vec<SocketAddr>,
    /// Relay nodes used as the last resort.
    pub relays: Vec<SocketAddr>,
    /// Application protocol resolved on Rendezvous.
    pub protocol: String,
    /// Tries a QUIC punch before the TCP one.
    pub quic: bool,
    /// Timeout of the direct TCP dial.
    pub direct_timeout: Duration,
    /// Timeout of the QUIC punch.
    pub quic_timeout: Duration,
    /// Timeout of the TCP punch.
    pub tcp_timeout: Duration,
    /// Puncher settings.
    pub punch: PunchConfig,
    /// Relay client settings.
    pub relay: RelayClientConfig,
}

impl DialerConfig {
    /// Creates a configuration that only dials directly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rendezvous: Vec::new(),
            relays: Vec::new(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            quic: false,
            direct_timeout: Duration::from_secs(5),
            quic_timeout: Duration::from_secs(5),
            tcp_timeout: Duration::from_secs(5),
            punch: PunchConfig::new(),
            relay: RelayClientConfig::new(),
        }
    }

    /// Sets the Rendezvous servers.
    #[must_use]
    pub fn with_rendezvous(mut self, rendezvous: Vec<SocketAddr>) -> Self {
        self.rendezvous = rendezvous;
        self
    }

    /// Sets the relay nodes.
    #[must_use]
    pub fn with_relays(mut self, relays: Vec<SocketAddr>) -> Self {
        self.relays = relays;
        self
    }

    /// Sets the resolved protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Enables the QUIC punch.
    #[must_use]
    pub const fn with_quic(mut self) -> Self {
        self.quic = true;
        self
    }

    /// Sets the direct, QUIC and TCP timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, direct: Duration, quic: Duration, tcp: Duration) -> Self {
        self.direct_timeout = direct;
        self.quic_timeout = quic;
        self.tcp_timeout = tcp;
        self
    }

    /// Sets the puncher settings.
    #[must_use]
    pub const fn with_punch(mut self, punch: PunchConfig) -> Self {
        self.punch = punch;
        self
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`crate::CachedDialer`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Period of the idle collection pass.
    pub gc_interval: Duration,
    /// Idle time after which a cached connection is closed.
    pub idle_timeout: Duration,
}

impl CacheConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(15 * 60),
        }
    }

    /// Sets the collection period.
    #[must_use]
    pub const fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punch_defaults() {
        let config = PunchConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_concurrent_punches, 16);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn listener_backoff_defaults() {
        let config = ListenerConfig::new("0.0.0.0:0".parse().expect("addr"));
        assert_eq!(config.min_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(8));
        assert!(config.rendezvous.is_empty());
        assert!(!config.quic);
    }

    #[test]
    fn dialer_timeouts_default_to_five_seconds() {
        let config = DialerConfig::default().with_quic();
        assert!(config.quic);
        assert_eq!(config.quic_timeout, Duration::from_secs(5));
        assert_eq!(config.tcp_timeout, Duration::from_secs(5));
    }

    #[test]
    fn cache_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.gc_interval, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(900));
    }
}
