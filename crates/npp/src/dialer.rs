//! Dialer trying direct TCP, punching and the relay in turn.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use npp_core::{TransportCredentials, WalletAddress};
use npp_relay::RelayDialer;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::DialerConfig;
use crate::conn::{ConnSource, NppConn};
use crate::error::{MultiError, NppError, NppResult};
use crate::metrics::DialMetrics;
use crate::puncher::{PunchClient, QuicTransport, TcpTransport};

/// Address of a peer: its identity and, optionally, a network address
/// where it may be reachable directly.
///
/// Written as `0x<identity>@<host:port>` or just `0x<identity>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialTarget {
    /// Identity published on Rendezvous and registered with relays.
    pub identity: WalletAddress,
    /// `host:port` tried with plain TCP first.
    pub network: Option<String>,
}

impl DialTarget {
    /// Target reachable only through punching or relays.
    #[must_use]
    pub const fn identity(identity: WalletAddress) -> Self {
        Self {
            identity,
            network: None,
        }
    }

    /// Target with a direct network address.
    #[must_use]
    pub fn with_network(identity: WalletAddress, network: impl Into<String>) -> Self {
        Self {
            identity,
            network: Some(network.into()),
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.network {
            Some(network) => write!(f, "{}@{network}", self.identity),
            None => write!(f, "{}", self.identity),
        }
    }
}

impl FromStr for DialTarget {
    type Err = NppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (identity, network) = match s.split_once('@') {
            Some((identity, network)) => (identity, Some(network)),
            None => (s, None),
        };
        let identity = identity
            .parse()
            .map_err(|e| NppError::InvalidTarget(format!("{s}: {e}")))?;
        match network {
            Some("") => Err(NppError::InvalidTarget(format!("{s}: empty network address"))),
            Some(network) => Ok(Self::with_network(identity, network)),
            None => Ok(Self::identity(identity)),
        }
    }
}

/// Connects to peers by the cheapest method that works.
///
/// Order: plain TCP to the network address, QUIC punch, TCP punch, relay.
/// Each punch gets its own Rendezvous session, dropped once the dial ends.
#[derive(Debug)]
pub struct Dialer {
    credentials: TransportCredentials,
    config: DialerConfig,
    relay: RelayDialer,
    metrics: Arc<DialMetrics>,
}

impl Dialer {
    /// Creates a dialer.
    #[must_use]
    pub fn new(config: DialerConfig, credentials: TransportCredentials) -> Self {
        let relay = RelayDialer::new(config.relays.clone(), config.relay.clone());
        Self {
            credentials,
            config,
            relay,
            metrics: Arc::new(DialMetrics::default()),
        }
    }

    /// Per-target dial statistics.
    pub fn metrics(&self) -> Arc<DialMetrics> {
        self.metrics.clone()
    }

    /// Connects to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`NppError::Exhausted`] listing the failure of every method
    /// that was tried.
    pub async fn dial(&self, target: &DialTarget) -> NppResult<NppConn> {
        let started = Instant::now();
        let result = self.try_methods(target).await;
        let elapsed = started.elapsed();
        self.metrics
            .record(&target.to_string(), result.as_ref().ok().map(NppConn::source), elapsed);
        match &result {
            Ok(conn) => info!(target = %target, source = %conn.source(), elapsed = ?elapsed, "dialed"),
            Err(e) => warn!(target = %target, error = %e, elapsed = ?elapsed, "dial failed"),
        }
        result
    }

    async fn try_methods(&self, target: &DialTarget) -> NppResult<NppConn> {
        let mut errors = MultiError::new();

        if let Some(network) = &target.network {
            match self.dial_direct(network).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(target = %target, error = %e, "direct dial failed");
                    errors.push(format!("direct: {e}"));
                }
            }
        }

        if !self.config.rendezvous.is_empty() {
            if self.config.quic {
                match bounded(self.config.quic_timeout, self.punch_quic(target.identity)).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        debug!(target = %target, error = %e, "quic punch failed");
                        errors.push(format!("quic: {e}"));
                    }
                }
            }
            match bounded(self.config.tcp_timeout, self.punch_tcp(target.identity)).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(target = %target, error = %e, "tcp punch failed");
                    errors.push(format!("tcp: {e}"));
                }
            }
        }

        if !self.config.relays.is_empty() {
            match self.relay.dial(target.identity).await {
                Ok(stream) => return Ok(NppConn::tcp(stream, ConnSource::Relayed)?),
                Err(e) => {
                    debug!(target = %target, error = %e, "relay dial failed");
                    errors.push(format!("relay: {e}"));
                }
            }
        }

        Err(NppError::Exhausted(errors))
    }

    async fn dial_direct(&self, network: &str) -> NppResult<NppConn> {
        let stream = bounded(self.config.direct_timeout, async {
            TcpStream::connect(network).await.map_err(NppError::from)
        })
        .await?;
        stream.set_nodelay(true)?;
        Ok(NppConn::tcp(stream, ConnSource::Direct)?)
    }

    async fn punch_tcp(&self, identity: WalletAddress) -> NppResult<NppConn> {
        let transport = TcpTransport::connect(
            &self.config.rendezvous,
            &self.credentials,
            &self.config.protocol,
            self.config.punch,
        )
        .await?;
        PunchClient::new(transport, self.config.punch).dial(identity).await
    }

    async fn punch_quic(&self, identity: WalletAddress) -> NppResult<NppConn> {
        let bind = SocketAddr::from(([0, 0, 0, 0], 0));
        let transport = QuicTransport::connect(
            bind,
            &self.config.rendezvous,
            &self.credentials,
            &self.config.protocol,
            self.config.punch,
        )
        .await?;
        PunchClient::new(transport, self.config.punch).dial(identity).await
    }
}

async fn bounded<T>(limit: Duration, attempt: impl Future<Output = NppResult<T>>) -> NppResult<T> {
    tokio::time::timeout(limit, attempt)
        .await
        .map_err(|_| NppError::Timeout(limit))?
}
