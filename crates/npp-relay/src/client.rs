//! Relay client: the CLIENT and SERVER sides of a relayed connection.
//!
//! Both sides walk the configured relay addresses in order. For each one
//! they first ask which cluster node owns the target address (DISCOVER),
//! then handshake with that node. A `WrongNode` answer means the cluster
//! changed between the two steps, so discovery is repeated a bounded
//! number of times before moving on to the next relay.

use std::net::SocketAddr;

use npp_core::codec::{MAX_RELAY_FRAME, read_message, write_message};
use npp_core::net::set_keepalive;
use npp_core::wire::{DiscoverResponse, HandshakeRequest, HandshakeResponse, PeerType};
use npp_core::{PeerId, TransportCredentials, WalletAddress};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::RelayClientConfig;
use crate::error::{ProtocolErrorKind, RelayError, RelayResult};

/// Protocol name carried in relay handshakes.
const RELAY_PROTOCOL: &str = "tcp";

/// Opens relayed connections to a remote SERVER.
#[derive(Debug, Clone)]
pub struct RelayDialer {
    relays: Vec<SocketAddr>,
    config: RelayClientConfig,
}

impl RelayDialer {
    /// Creates a dialer walking `relays` in order.
    #[must_use]
    pub fn new(relays: Vec<SocketAddr>, config: RelayClientConfig) -> Self {
        Self { relays, config }
    }

    /// Connects to any SERVER registered for `target`.
    ///
    /// The returned socket carries the peer's bytes directly.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoRelays`] without relays, or
    /// [`RelayError::Exhausted`] listing every relay's failure.
    pub async fn dial(&self, target: WalletAddress) -> RelayResult<TcpStream> {
        self.dial_pinned(target, None).await
    }

    /// Connects to the SERVER instance `server` of `target`, or to any
    /// instance when `server` is `None`.
    ///
    /// # Errors
    ///
    /// See [`Self::dial`].
    pub async fn dial_pinned(&self, target: WalletAddress, server: Option<PeerId>) -> RelayResult<TcpStream> {
        let handshake = HandshakeRequest {
            peer_type: PeerType::Client as i32,
            addr: target.to_vec(),
            sign: Vec::new(),
            uuid: server.map(|id| id.to_string()).unwrap_or_default(),
            protocol: RELAY_PROTOCOL.to_string(),
        };
        let stream = open(&self.relays, &self.config, target, &handshake).await?;
        info!(target = %target, "relayed connection established");
        Ok(stream)
    }
}

/// Accepts relayed connections for the local wallet address.
#[derive(Debug, Clone)]
pub struct RelayListener {
    relays: Vec<SocketAddr>,
    credentials: TransportCredentials,
    config: RelayClientConfig,
}

impl RelayListener {
    /// Creates a listener registering with `relays` under the address of
    /// `credentials`.
    #[must_use]
    pub fn new(relays: Vec<SocketAddr>, credentials: TransportCredentials, config: RelayClientConfig) -> Self {
        Self {
            relays,
            credentials,
            config,
        }
    }

    /// Registers as a SERVER and waits until a CLIENT is matched.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoRelays`] without relays, or
    /// [`RelayError::Exhausted`] listing every relay's failure, including
    /// a node's `Timeout` when no CLIENT arrived in time.
    pub async fn accept(&self) -> RelayResult<TcpStream> {
        let addr = self.credentials.wallet_address();
        let handshake = HandshakeRequest {
            peer_type: PeerType::Server as i32,
            addr: addr.to_vec(),
            sign: self.credentials.sign_address(),
            uuid: String::new(),
            protocol: RELAY_PROTOCOL.to_string(),
        };
        let stream = open(&self.relays, &self.config, addr, &handshake).await?;
        info!(addr = %addr, "accepted relayed connection");
        Ok(stream)
    }
}

async fn open(
    relays: &[SocketAddr],
    config: &RelayClientConfig,
    target: WalletAddress,
    handshake: &HandshakeRequest,
) -> RelayResult<TcpStream> {
    if relays.is_empty() {
        return Err(RelayError::NoRelays);
    }
    let mut failures = Vec::with_capacity(relays.len());
    for &relay in relays {
        match open_via(relay, config, target, handshake).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(relay = %relay, target = %target, error = %e, "relay attempt failed");
                failures.push(format!("{relay}: {e}"));
            }
        }
    }
    Err(RelayError::Exhausted(failures))
}

async fn open_via(
    relay: SocketAddr,
    config: &RelayClientConfig,
    target: WalletAddress,
    handshake: &HandshakeRequest,
) -> RelayResult<TcpStream> {
    let mut redirects = 0;
    loop {
        let node = discover(relay, config, target).await?;
        debug!(relay = %relay, node = %node, target = %target, "discovered relay node");
        match join(node, config, handshake).await {
            Err(e) if e.kind() == Some(ProtocolErrorKind::WrongNode) && redirects < config.max_redirects => {
                redirects += 1;
                debug!(node = %node, target = %target, redirects, "relay node no longer owns the address");
            }
            result => return result,
        }
    }
}

async fn connect(addr: SocketAddr, config: &RelayClientConfig) -> RelayResult<TcpStream> {
    let unreachable = |reason: String| RelayError::Unreachable { addr, reason };
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| unreachable(format!("connect timed out after {:?}", config.connect_timeout)))?
        .map_err(|e| unreachable(e.to_string()))?;
    stream.set_nodelay(true)?;
    set_keepalive(&stream, config.keepalive)?;
    Ok(stream)
}

/// Asks `relay` which node owns `target`.
async fn discover(relay: SocketAddr, config: &RelayClientConfig, target: WalletAddress) -> RelayResult<SocketAddr> {
    let mut stream = connect(relay, config).await?;
    let request = HandshakeRequest {
        peer_type: PeerType::Discover as i32,
        addr: target.to_vec(),
        ..Default::default()
    };
    write_message(&mut stream, &request, MAX_RELAY_FRAME).await?;
    let response: DiscoverResponse = read_message(&mut stream, MAX_RELAY_FRAME).await?;
    if response.error != 0 {
        return Err(RelayError::from_code(response.error, response.description));
    }
    let mut node: SocketAddr = response.addr.parse().map_err(|_| RelayError::Unreachable {
        addr: relay,
        reason: format!("invalid node address {:?}", response.addr),
    })?;
    if node.ip().is_unspecified() {
        node.set_ip(relay.ip());
    }
    Ok(node)
}

/// Handshakes with the owning node and waits for the match.
async fn join(node: SocketAddr, config: &RelayClientConfig, handshake: &HandshakeRequest) -> RelayResult<TcpStream> {
    let mut stream = connect(node, config).await?;
    write_message(&mut stream, handshake, MAX_RELAY_FRAME).await?;
    let response: HandshakeResponse = read_message(&mut stream, MAX_RELAY_FRAME).await?;
    if response.error != 0 {
        return Err(RelayError::from_code(response.error, response.description));
    }
    Ok(stream)
}
