//! Relay node and relay client configuration.

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{RelayError, RelayResult};

/// Default port of a relay node.
pub const DEFAULT_PORT: u16 = 12240;

/// Default gossip port of a relay node.
pub const DEFAULT_GOSSIP_PORT: u16 = 12241;

/// Builds the default cluster member name, `<hostname>-<uuid>`.
pub fn default_node_name() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "relay".to_string());
    format!("{hostname}-{}", Uuid::new_v4())
}

/// Gossip membership configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique member name.
    pub name: String,
    /// UDP address to gossip on.
    pub bind_addr: SocketAddr,
    /// Address other members should gossip to, if different from the bound one.
    pub announce: Option<SocketAddr>,
    /// Shared secret all members derive the gossip key from.
    pub secret: Vec<u8>,
    /// Gossip addresses of members to join through.
    pub seeds: Vec<SocketAddr>,
    /// Period between heartbeats.
    pub interval: Duration,
    /// How long a member's heartbeat may stall before it is declared gone.
    pub failure_timeout: Duration,
    /// Number of random members pushed to per interval.
    pub fanout: usize,
}

impl GossipConfig {
    /// Creates a configuration for a member gossiping on `bind_addr`.
    #[must_use]
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr, secret: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            announce: None,
            secret,
            seeds: Vec::new(),
            interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            fanout: 3,
        }
    }

    /// Parses the shared secret from hex.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the string is not valid hex.
    pub fn secret_from_hex(secret: &str) -> RelayResult<Vec<u8>> {
        hex::decode(secret.trim_start_matches("0x"))
            .map_err(|e| RelayError::Config(format!("invalid gossip secret: {e}")))
    }

    /// Sets the announced gossip address.
    #[must_use]
    pub const fn with_announce(mut self, addr: SocketAddr) -> Self {
        self.announce = Some(addr);
        self
    }

    /// Sets the members to join through.
    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the failure timeout.
    #[must_use]
    pub const fn with_failure_timeout(mut self, timeout: Duration) -> Self {
        self.failure_timeout = timeout;
        self
    }

    /// Sets the push fanout.
    #[must_use]
    pub const fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Checks the configuration for values the membership cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] describing the first problem found.
    pub fn validate(&self) -> RelayResult<()> {
        if self.name.is_empty() {
            return Err(RelayError::Config("member name must not be empty".into()));
        }
        if self.secret.is_empty() {
            return Err(RelayError::Config("gossip secret must not be empty".into()));
        }
        if self.interval.is_zero() {
            return Err(RelayError::Config("gossip interval must be positive".into()));
        }
        if self.failure_timeout <= self.interval {
            return Err(RelayError::Config(
                "failure timeout must exceed the gossip interval".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`crate::RelayServer`].
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// TCP address to accept relay connections on.
    pub bind_addr: SocketAddr,
    /// Relay address other members hand out, if different from the bound one.
    pub announce: Option<SocketAddr>,
    /// Cluster membership.
    pub cluster: GossipConfig,
    /// TCP address of the monitoring service, `None` disables it.
    pub monitor_addr: Option<SocketAddr>,
    /// Time allowed for the handshake frame to arrive.
    pub handshake_timeout: Duration,
    /// How long a SERVER waits for a CLIENT.
    pub server_wait_timeout: Duration,
    /// How long a CLIENT waits for a SERVER.
    pub client_wait_timeout: Duration,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Size of each forwarding buffer.
    pub buffer_size: usize,
}

impl RelayServerConfig {
    /// Creates a configuration accepting relay connections on `bind_addr`.
    #[must_use]
    pub fn new(bind_addr: SocketAddr, cluster: GossipConfig) -> Self {
        Self {
            bind_addr,
            announce: None,
            cluster,
            monitor_addr: None,
            handshake_timeout: Duration::from_secs(30),
            server_wait_timeout: Duration::from_secs(60),
            client_wait_timeout: Duration::from_secs(30),
            max_connections: 10_000,
            buffer_size: 32 * 1024,
        }
    }

    /// Sets the announced relay address.
    #[must_use]
    pub const fn with_announce(mut self, addr: SocketAddr) -> Self {
        self.announce = Some(addr);
        self
    }

    /// Enables the monitoring service.
    #[must_use]
    pub const fn with_monitor(mut self, addr: SocketAddr) -> Self {
        self.monitor_addr = Some(addr);
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets how long SERVER and CLIENT peers wait for a match.
    #[must_use]
    pub const fn with_wait_timeouts(mut self, server: Duration, client: Duration) -> Self {
        self.server_wait_timeout = server;
        self.client_wait_timeout = client;
        self
    }

    /// Sets the connection limit.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the forwarding buffer size.
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] describing the first problem found.
    pub fn validate(&self) -> RelayResult<()> {
        self.cluster.validate()?;
        if self.buffer_size == 0 {
            return Err(RelayError::Config("buffer size must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(RelayError::Config("connection limit must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration for [`crate::RelayDialer`] and [`crate::RelayListener`].
#[derive(Debug, Clone, Copy)]
pub struct RelayClientConfig {
    /// Timeout for each TCP connect.
    pub connect_timeout: Duration,
    /// TCP keepalive applied to relayed sockets.
    pub keepalive: Duration,
    /// How many times discovery is repeated after a `WrongNode` answer.
    pub max_redirects: usize,
}

impl RelayClientConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(15),
            max_redirects: 2,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the keepalive interval.
    #[must_use]
    pub const fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
