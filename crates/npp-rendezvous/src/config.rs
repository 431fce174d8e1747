//! Rendezvous server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::resolver::PublicIpSource;

/// Default port of a Rendezvous server.
pub const DEFAULT_PORT: u16 = 14099;

/// Configuration for [`crate::RendezvousServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address to listen on.
    pub bind_addr: SocketAddr,
    /// UDP address of the QUIC listener, `None` disables QUIC.
    pub quic_addr: Option<SocketAddr>,
    /// Where the server learns its own public IP.
    pub public_ip: PublicIpSource,
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Maximum number of in-flight calls per session.
    pub max_calls_per_session: usize,
}

impl ServerConfig {
    /// Creates a TCP-only configuration listening on `bind_addr`.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            quic_addr: None,
            public_ip: PublicIpSource::default(),
            max_sessions: 10_000,
            max_calls_per_session: 256,
        }
    }

    /// Enables QUIC on the same port number as the TCP listener.
    #[must_use]
    pub const fn with_quic(mut self) -> Self {
        self.quic_addr = Some(self.bind_addr);
        self
    }

    /// Enables QUIC on an explicit UDP address.
    #[must_use]
    pub const fn with_quic_addr(mut self, addr: SocketAddr) -> Self {
        self.quic_addr = Some(addr);
        self
    }

    /// Sets the public IP source.
    #[must_use]
    pub fn with_public_ip(mut self, source: PublicIpSource) -> Self {
        self.public_ip = source;
        self
    }

    /// Sets the session limit.
    #[must_use]
    pub const fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the per-session call limit.
    #[must_use]
    pub const fn with_max_calls_per_session(mut self, max: usize) -> Self {
        self.max_calls_per_session = max;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))
    }
}

/// Configuration for [`crate::RendezvousClient`].
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Time allowed to establish and authenticate the session.
    pub connect_timeout: Duration,
    /// Capacity of the outgoing request queue.
    pub request_queue: usize,
}

impl ClientConfig {
    /// Creates the default client configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_queue: 64,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
