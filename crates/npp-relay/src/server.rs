//! Relay node accepting SERVER, CLIENT and DISCOVER connections.
//!
//! Every connection starts with one [`HandshakeRequest`] frame. DISCOVER
//! peers are told which node owns their address; SERVER and CLIENT peers
//! are parked in a waiting hall keyed by address until the opposite side
//! arrives, then both receive an OK response and the node copies bytes
//! between them until both directions are finished.

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use npp_core::codec::{MAX_RELAY_FRAME, read_message, write_message};
use npp_core::wire::{DiscoverResponse, HandshakeRequest, HandshakeResponse, PeerType};
use npp_core::{PeerId, ProtoError, Registration, Role, WalletAddress, verify_address_signature};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cluster::{Member, Membership};
use crate::config::RelayServerConfig;
use crate::error::{ProtocolErrorKind, RelayError, RelayResult};
use crate::metrics::NetCounters;
use crate::monitor::MonitorServer;
use crate::state::{Leg, RelayNode, RelayState, Signal, Waiter};

/// Relay node.
///
/// [`RelayServer::bind`] opens the listeners and joins the cluster so the
/// node's addresses are known before [`RelayServer::serve`] starts.
#[derive(Debug)]
pub struct RelayServer {
    /// Node configuration.
    config: RelayServerConfig,
    /// State shared with connection tasks and the monitor.
    state: Arc<RelayState>,
    /// Relay listener.
    listener: TcpListener,
    /// Cluster membership.
    membership: Membership,
    /// Monitoring service, if enabled.
    monitor: Option<MonitorServer>,
    /// Connection limit.
    connections: Arc<Semaphore>,
    /// Shutdown signal sender.
    shutdown_tx: mpsc::Sender<()>,
    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

/// Stops a running [`RelayServer`] or [`MonitorServer`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(pub(crate) mpsc::Sender<()>);

impl ShutdownHandle {
    /// Signals the server to stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the server has already stopped.
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.0
            .send(())
            .await
            .map_err(|_| RelayError::Io(std::io::ErrorKind::BrokenPipe.into()))
    }
}

/// Timeouts and buffer sizes a connection task needs.
#[derive(Debug, Clone, Copy)]
struct Limits {
    handshake: Duration,
    server_wait: Duration,
    client_wait: Duration,
    buffer_size: usize,
}

impl Limits {
    const fn from_config(config: &RelayServerConfig) -> Self {
        Self {
            handshake: config.handshake_timeout,
            server_wait: config.server_wait_timeout,
            client_wait: config.client_wait_timeout,
            buffer_size: config.buffer_size,
        }
    }

    const fn wait(&self, role: Role) -> Duration {
        match role {
            Role::Server => self.server_wait,
            Role::Client => self.client_wait,
        }
    }
}

impl RelayServer {
    /// Binds the relay listener, joins the cluster and, if configured,
    /// binds the monitoring service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a socket cannot
    /// be bound.
    pub async fn bind(config: RelayServerConfig) -> RelayResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| RelayError::BindFailed(config.bind_addr, e))?;
        let local_addr = listener.local_addr()?;
        let announced = config.announce.unwrap_or(local_addr);
        info!(addr = %local_addr, announce = %announced, name = %config.cluster.name, "exposing Relay server");

        let state = Arc::new(RelayState::new(RelayNode {
            name: config.cluster.name.clone(),
            addr: announced,
        }));
        let membership =
            Membership::start(config.cluster.clone(), announced.to_string(), state.clone()).await?;
        let monitor = match config.monitor_addr {
            Some(addr) => Some(MonitorServer::bind(addr, state.clone()).await?),
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        Ok(Self {
            connections: Arc::new(Semaphore::new(config.max_connections)),
            config,
            state,
            listener,
            membership,
            monitor,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Address of the relay listener.
    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Address of the gossip socket.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.membership.local_addr()
    }

    /// Address of the monitoring service, if enabled.
    pub fn monitor_addr(&self) -> Option<SocketAddr> {
        self.monitor.as_ref().and_then(|m| m.local_addr().ok())
    }

    /// The local node.
    pub fn node(&self) -> &RelayNode {
        self.state.node()
    }

    /// Node state, for introspection.
    pub fn state(&self) -> Arc<RelayState> {
        self.state.clone()
    }

    /// Live cluster members.
    pub fn members(&self) -> Vec<Member> {
        self.membership.members()
    }

    /// Returns a handle that stops [`Self::serve`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Accepts relay connections until shut down, then leaves the cluster.
    pub async fn serve(mut self) -> RelayResult<()> {
        let limits = Limits::from_config(&self.config);
        let mut connections = JoinSet::new();
        let monitor = self.monitor.take().map(|monitor| {
            let handle = monitor.shutdown_handle();
            (handle, tokio::spawn(monitor.serve()))
        });

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Some(permit) = self.admit(peer) {
                                let state = self.state.clone();
                                connections.spawn(handle_connection(state, limits, stream, peer, permit));
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Some((handle, task)) = monitor {
            let _ = handle.shutdown().await;
            let _ = task.await;
        }
        self.membership.leave().await;
        connections.shutdown().await;
        info!("Relay server stopped");
        Ok(())
    }

    fn admit(&self, peer: SocketAddr) -> Option<OwnedSemaphorePermit> {
        let permit = self.connections.clone().try_acquire_owned().ok();
        if permit.is_none() {
            warn!(
                peer = %peer,
                max = self.config.max_connections,
                "Connection rejected: max connections reached"
            );
        }
        permit
    }
}

async fn handle_connection(
    state: Arc<RelayState>,
    limits: Limits,
    mut stream: TcpStream,
    remote: SocketAddr,
    _permit: OwnedSemaphorePermit,
) {
    let guard = state.metrics().open_connection();
    debug!(peer = %remote, "accepted relay connection");

    let handshake = match tokio::time::timeout(
        limits.handshake,
        read_message::<_, HandshakeRequest>(&mut stream, MAX_RELAY_FRAME),
    )
    .await
    {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(ProtoError::Closed)) => {
            debug!(peer = %remote, "connection closed before handshake");
            return;
        }
        Ok(Err(e)) => {
            reject(&mut stream, ProtocolErrorKind::InvalidHandshake, e.to_string()).await;
            return;
        }
        Err(_) => {
            reject(&mut stream, ProtocolErrorKind::Timeout, "handshake timed out").await;
            return;
        }
    };

    match PeerType::try_from(handshake.peer_type) {
        Ok(PeerType::Discover) => discover(&state, stream, &handshake).await,
        Ok(PeerType::Server) => {
            let leg = Leg { stream, remote, _guard: guard };
            meet(&state, limits, leg, &handshake, Role::Server).await;
        }
        Ok(PeerType::Client) => {
            let leg = Leg { stream, remote, _guard: guard };
            meet(&state, limits, leg, &handshake, Role::Client).await;
        }
        Err(_) => {
            let description = format!("unknown peer type {}", handshake.peer_type);
            reject(&mut stream, ProtocolErrorKind::UnknownPeerType, description).await;
        }
    }
}

/// Sends a protocol error in reply to a SERVER or CLIENT handshake.
async fn reject(stream: &mut TcpStream, kind: ProtocolErrorKind, description: impl Into<String>) {
    let response = HandshakeResponse {
        error: kind.code(),
        description: description.into(),
    };
    debug!(error = kind.code(), description = %response.description, "rejecting relay peer");
    if let Err(e) = write_message(stream, &response, MAX_RELAY_FRAME).await {
        warn!(error = %e, "Failed to send error reply");
    }
}

async fn discover(state: &RelayState, mut stream: TcpStream, handshake: &HandshakeRequest) {
    let response = match WalletAddress::from_slice(&handshake.addr) {
        Ok(addr) => match state.continuum().get(&addr) {
            Some(node) => {
                debug!(addr = %addr, node = %node, "redirecting discover request");
                DiscoverResponse {
                    addr: node.addr.to_string(),
                    ..Default::default()
                }
            }
            None => DiscoverResponse {
                error: ProtocolErrorKind::NoNodes.code(),
                description: "the cluster has no members".to_string(),
                ..Default::default()
            },
        },
        Err(e) => DiscoverResponse {
            error: ProtocolErrorKind::InvalidHandshake.code(),
            description: e.to_string(),
            ..Default::default()
        },
    };
    if let Err(e) = write_message(&mut stream, &response, MAX_RELAY_FRAME).await {
        debug!(error = %e, "failed to answer discover request");
    }
}

/// Checks a SERVER or CLIENT handshake, returning the address and the
/// optional SERVER pin.
fn validate(handshake: &HandshakeRequest, role: Role) -> Result<(WalletAddress, Option<PeerId>), String> {
    let addr = WalletAddress::from_slice(&handshake.addr).map_err(|e| e.to_string())?;
    match role {
        Role::Server => {
            verify_address_signature(&addr, &handshake.sign).map_err(|e| e.to_string())?;
            Ok((addr, None))
        }
        Role::Client if handshake.uuid.is_empty() => Ok((addr, None)),
        Role::Client => {
            let pin = handshake
                .uuid
                .parse::<PeerId>()
                .map_err(|e| format!("invalid server uuid: {e}"))?;
            Ok((addr, Some(pin)))
        }
    }
}

/// Drops one continuum tracking reference when the waiter is done.
struct Tracking<'a> {
    state: &'a RelayState,
    addr: WalletAddress,
}

impl Drop for Tracking<'_> {
    fn drop(&mut self) {
        self.state.continuum().stop_tracking(&self.addr);
    }
}

enum Wait {
    Signal(Option<Signal>),
    TimedOut,
    HungUp,
}

async fn meet(state: &RelayState, limits: Limits, mut leg: Leg, handshake: &HandshakeRequest, role: Role) {
    let (addr, pin) = match validate(handshake, role) {
        Ok(parsed) => parsed,
        Err(description) => {
            reject(&mut leg.stream, ProtocolErrorKind::InvalidHandshake, description).await;
            return;
        }
    };
    match state.continuum().get(&addr) {
        None => {
            reject(&mut leg.stream, ProtocolErrorKind::NoNodes, "the cluster has no members").await;
            return;
        }
        // Discovery may have returned an owner that has changed since.
        Some(owner) if owner.name != state.node().name => {
            reject(&mut leg.stream, ProtocolErrorKind::WrongNode, format!("{addr} is served by {owner}")).await;
            return;
        }
        Some(_) => {}
    }

    let id = PeerId::new();
    state.continuum().track(addr);
    let _tracking = Tracking { state, addr };

    let (tx, mut rx) = oneshot::channel();
    {
        let mut room = state.hall().lock();
        loop {
            let popped = match role {
                Role::Client => room.pop_random_where(&addr, Role::Server, |server, _| {
                    pin.is_none_or(|pin| pin == *server)
                }),
                Role::Server => room.pop_random_where(&addr, Role::Client, |_, client| client.pin.is_none()),
            };
            let Some((peer_id, waiter)) = popped else {
                break;
            };
            match waiter.tx.send(Signal::Matched(leg)) {
                Ok(()) => {
                    debug!(addr = %addr, id = %id, peer = %peer_id, "handed connection to waiting peer");
                    return;
                }
                // The waiter gave up after it was popped; try the next one.
                Err(Signal::Matched(back)) => leg = back,
                Err(Signal::Discard) => return,
            }
        }
        room.insert(
            addr,
            role,
            id,
            Waiter {
                remote: leg.remote,
                pin,
                tx,
            },
        );
    }
    let registration = Registration::new(state.hall().clone(), addr, role, id);
    info!(addr = %addr, id = %id, role = ?role, peer = %leg.remote, "relay peer waiting");

    if !state.owns(&addr) {
        registration.withdraw();
        reject(&mut leg.stream, ProtocolErrorKind::WrongNode, format!("{addr} moved to another node")).await;
        return;
    }

    let wait = limits.wait(role);
    let outcome = tokio::select! {
        result = tokio::time::timeout(wait, &mut rx) => match result {
            Ok(signal) => Wait::Signal(signal.ok()),
            Err(_) => Wait::TimedOut,
        },
        () = hung_up(&leg.stream) => Wait::HungUp,
    };
    let signal = match outcome {
        Wait::Signal(signal) => signal,
        lost => {
            if registration.withdraw().is_some() {
                if matches!(lost, Wait::TimedOut) {
                    reject(&mut leg.stream, ProtocolErrorKind::Timeout, format!("no peer arrived within {wait:?}")).await;
                } else {
                    debug!(addr = %addr, id = %id, "waiting peer hung up");
                }
                return;
            }
            // Someone took this waiter at the last moment.
            rx.await.ok()
        }
    };

    match signal {
        Some(Signal::Matched(peer)) => {
            let counters = state.metrics().net(addr);
            let (server, client) = match role {
                Role::Server => (leg, peer),
                Role::Client => (peer, leg),
            };
            relay(addr, server, client, &counters, limits.buffer_size).await;
        }
        Some(Signal::Discard) => {
            reject(&mut leg.stream, ProtocolErrorKind::WrongNode, format!("{addr} moved to another node")).await;
        }
        None => debug!(addr = %addr, id = %id, "waiter dropped without a signal"),
    }
}

/// Completes once the parked peer closes its connection.
///
/// A peer that sends data before being matched is not watched any further.
async fn hung_up(stream: &TcpStream) {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).await {
        Ok(0) | Err(_) => {}
        Ok(_) => future::pending().await,
    }
}

async fn relay(addr: WalletAddress, mut server: Leg, mut client: Leg, counters: &NetCounters, buffer_size: usize) {
    let ok = HandshakeResponse::default();
    if let Err(e) = write_message(&mut server.stream, &ok, MAX_RELAY_FRAME).await {
        warn!(peer = %server.remote, error = %e, "Failed to confirm relay to server");
        return;
    }
    if let Err(e) = write_message(&mut client.stream, &ok, MAX_RELAY_FRAME).await {
        warn!(peer = %client.remote, error = %e, "Failed to confirm relay to client");
        return;
    }
    info!(addr = %addr, server = %server.remote, client = %client.remote, "relaying");

    let (server_read, server_write) = server.stream.split();
    let (client_read, client_write) = client.stream.split();
    let (to_client, to_server) = tokio::join!(
        transmit(server_read, client_write, buffer_size, |n| counters.add_tx(n)),
        transmit(client_read, server_write, buffer_size, |n| counters.add_rx(n)),
    );
    info!(
        addr = %addr,
        server = %server.remote,
        client = %client.remote,
        tx_bytes = to_client.unwrap_or_default(),
        rx_bytes = to_server.unwrap_or_default(),
        "finished relaying"
    );
}

/// Copies `from` into `to` until EOF, then half-closes `to`.
async fn transmit<R, W, F>(mut from: R, mut to: W, buffer_size: usize, count: F) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    let result = loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = to.write_all(&buf[..n]).await {
            break Err(e);
        }
        total += n as u64;
        count(n as u64);
    };
    let _ = to.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use ed25519_dalek::SigningKey;
    use npp_core::TransportCredentials;
    use rand::rngs::OsRng;

    fn config() -> RelayServerConfig {
        let gossip = GossipConfig::new(
            format!("node-{}", PeerId::new()),
            "127.0.0.1:0".parse().expect("addr"),
            vec![7; 32],
        );
        RelayServerConfig::new("127.0.0.1:0".parse().expect("addr"), gossip)
            .with_monitor("127.0.0.1:0".parse().expect("addr"))
    }

    async fn start(config: RelayServerConfig) -> (SocketAddr, Arc<RelayState>, ShutdownHandle) {
        let server = RelayServer::bind(config).await.expect("bind");
        let addr = server.local_addr().expect("addr");
        let state = server.state();
        let handle = server.shutdown_handle();
        tokio::spawn(server.serve());
        (addr, state, handle)
    }

    fn credentials() -> TransportCredentials {
        TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials")
    }

    fn server_handshake(credentials: &TransportCredentials) -> HandshakeRequest {
        HandshakeRequest {
            peer_type: PeerType::Server as i32,
            addr: credentials.wallet_address().to_vec(),
            sign: credentials.sign_address(),
            uuid: String::new(),
            protocol: "tcp".to_string(),
        }
    }

    fn client_handshake(target: WalletAddress) -> HandshakeRequest {
        HandshakeRequest {
            peer_type: PeerType::Client as i32,
            addr: target.to_vec(),
            sign: Vec::new(),
            uuid: String::new(),
            protocol: "tcp".to_string(),
        }
    }

    async fn send_handshake(relay: SocketAddr, handshake: &HandshakeRequest) -> TcpStream {
        let mut stream = TcpStream::connect(relay).await.expect("connect");
        write_message(&mut stream, handshake, MAX_RELAY_FRAME).await.expect("handshake");
        stream
    }

    async fn response(stream: &mut TcpStream) -> HandshakeResponse {
        tokio::time::timeout(Duration::from_secs(5), read_message(stream, MAX_RELAY_FRAME))
            .await
            .expect("response in time")
            .expect("response")
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    // ===== Validation Tests =====

    #[test]
    fn server_handshake_requires_a_valid_signature() {
        let owner = credentials();
        let mut handshake = server_handshake(&owner);
        assert!(validate(&handshake, Role::Server).is_ok());

        handshake.sign = credentials().sign_address();
        assert!(validate(&handshake, Role::Server).is_err());
        handshake.sign.clear();
        assert!(validate(&handshake, Role::Server).is_err());
    }

    #[test]
    fn client_handshake_accepts_optional_pin() {
        let target = WalletAddress::from_bytes([1; 20]);
        let mut handshake = client_handshake(target);
        assert_eq!(validate(&handshake, Role::Client).expect("valid"), (target, None));

        let pin = PeerId::new();
        handshake.uuid = pin.to_string();
        assert_eq!(validate(&handshake, Role::Client).expect("valid"), (target, Some(pin)));

        handshake.uuid = "not-a-uuid".to_string();
        assert!(validate(&handshake, Role::Client).is_err());
        handshake.addr = vec![1; 3];
        assert!(validate(&handshake, Role::Client).is_err());
    }

    #[tokio::test]
    async fn transmit_counts_and_half_closes() {
        let (mut source, from) = tokio::io::duplex(64);
        let (to, mut sink) = tokio::io::duplex(64);
        let counted = std::sync::atomic::AtomicU64::new(0);

        source.write_all(b"hello relay").await.expect("write");
        drop(source);
        let total = transmit(from, to, 4, |n| {
            counted.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        })
        .await
        .expect("transmit");

        let mut received = Vec::new();
        sink.read_to_end(&mut received).await.expect("read to eof");
        assert_eq!(received, b"hello relay");
        assert_eq!(total, 11);
        assert_eq!(counted.load(std::sync::atomic::Ordering::Relaxed), 11);
    }

    // ===== Relay Tests =====

    #[tokio::test]
    async fn server_then_client_are_relayed() {
        let (relay, state, _handle) = start(config()).await;
        let credentials = credentials();
        let target = credentials.wallet_address();

        let mut server = send_handshake(relay, &server_handshake(&credentials)).await;
        assert!(eventually(|| state.waiting() == 1).await);
        let mut client = send_handshake(relay, &client_handshake(target)).await;

        assert_eq!(response(&mut server).await.error, 0);
        assert_eq!(response(&mut client).await.error, 0);

        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.expect("write");
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"pong!");

        // Half-close travels through the relay.
        client.shutdown().await.expect("shutdown");
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.expect("eof");
        assert!(rest.is_empty());
        drop(server);

        assert!(eventually(|| {
            let metrics = state.metrics().snapshot();
            metrics.conn_current == 0
                && metrics.net.get(&target.to_string()).is_some_and(|n| n.tx_bytes == 5 && n.rx_bytes == 4)
        })
        .await);
        assert_eq!(state.waiting(), 0);
    }

    #[tokio::test]
    async fn client_may_arrive_first() {
        let (relay, state, _handle) = start(config()).await;
        let credentials = credentials();

        let mut client = send_handshake(relay, &client_handshake(credentials.wallet_address())).await;
        assert!(eventually(|| state.waiting() == 1).await);
        let mut server = send_handshake(relay, &server_handshake(&credentials)).await;

        assert_eq!(response(&mut client).await.error, 0);
        assert_eq!(response(&mut server).await.error, 0);
    }

    #[tokio::test]
    async fn one_client_takes_one_of_two_servers() {
        let (relay, state, _handle) = start(config()).await;
        let credentials = credentials();
        let target = credentials.wallet_address();

        let _first = send_handshake(relay, &server_handshake(&credentials)).await;
        let _second = send_handshake(relay, &server_handshake(&credentials)).await;
        assert!(eventually(|| state.info().state.get(&target.to_string()).is_some_and(|m| m.servers.len() == 2)).await);

        let mut client = send_handshake(relay, &client_handshake(target)).await;
        assert_eq!(response(&mut client).await.error, 0);
        assert!(eventually(|| state.info().state.get(&target.to_string()).is_some_and(|m| m.servers.len() == 1)).await);
    }

    #[tokio::test]
    async fn pinned_client_gets_the_named_server() {
        let (relay, state, _handle) = start(config()).await;
        let credentials = credentials();
        let target = credentials.wallet_address();

        let mut first = send_handshake(relay, &server_handshake(&credentials)).await;
        assert!(eventually(|| state.waiting() == 1).await);
        let pinned = state.info().state[&target.to_string()].servers.keys().next().cloned().expect("id");
        let _second = send_handshake(relay, &server_handshake(&credentials)).await;
        assert!(eventually(|| state.info().state[&target.to_string()].servers.len() == 2).await);

        let mut handshake = client_handshake(target);
        handshake.uuid = pinned.clone();
        let mut client = send_handshake(relay, &handshake).await;
        assert_eq!(response(&mut client).await.error, 0);
        assert_eq!(response(&mut first).await.error, 0);

        let remaining = state.info().state[&target.to_string()].servers.clone();
        assert!(!remaining.contains_key(&pinned));
    }

    #[tokio::test]
    async fn unmatched_peer_times_out() {
        let config = config().with_wait_timeouts(Duration::from_millis(200), Duration::from_millis(100));
        let (relay, state, _handle) = start(config).await;

        let mut client = send_handshake(relay, &client_handshake(WalletAddress::from_bytes([4; 20]))).await;
        let reply = response(&mut client).await;
        assert_eq!(reply.error, ProtocolErrorKind::Timeout.code());
        assert!(eventually(|| state.waiting() == 0).await);
    }

    #[tokio::test]
    async fn hung_up_waiter_is_withdrawn() {
        let (relay, state, _handle) = start(config()).await;
        let credentials = credentials();

        let server = send_handshake(relay, &server_handshake(&credentials)).await;
        assert!(eventually(|| state.waiting() == 1).await);
        drop(server);
        assert!(eventually(|| state.waiting() == 0).await);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (relay, _state, _handle) = start(config()).await;
        let mut handshake = server_handshake(&credentials());
        handshake.sign = credentials().sign_address();

        let mut server = send_handshake(relay, &handshake).await;
        assert_eq!(response(&mut server).await.error, ProtocolErrorKind::InvalidHandshake.code());
    }

    #[tokio::test]
    async fn unknown_peer_type_is_rejected() {
        let (relay, _state, _handle) = start(config()).await;
        let mut handshake = client_handshake(WalletAddress::from_bytes([1; 20]));
        handshake.peer_type = 9;

        let mut stream = send_handshake(relay, &handshake).await;
        assert_eq!(response(&mut stream).await.error, ProtocolErrorKind::UnknownPeerType.code());
    }

    #[tokio::test]
    async fn slow_handshake_times_out() {
        let config = config().with_handshake_timeout(Duration::from_millis(100));
        let (relay, _state, _handle) = start(config).await;

        let mut stream = TcpStream::connect(relay).await.expect("connect");
        assert_eq!(response(&mut stream).await.error, ProtocolErrorKind::Timeout.code());
    }

    #[tokio::test]
    async fn discover_names_the_owner() {
        let (relay, _state, _handle) = start(config()).await;
        let mut handshake = client_handshake(WalletAddress::from_bytes([2; 20]));
        handshake.peer_type = PeerType::Discover as i32;

        let mut stream = send_handshake(relay, &handshake).await;
        let reply: DiscoverResponse = read_message(&mut stream, MAX_RELAY_FRAME).await.expect("reply");
        assert_eq!(reply.error, 0);
        assert_eq!(reply.addr, relay.to_string());
    }

    #[tokio::test]
    async fn foreign_address_gets_wrong_node() {
        let (relay, state, _handle) = start(config()).await;
        state.continuum().add(
            RelayNode {
                name: "zz-other".to_string(),
                addr: "127.0.0.1:9".parse().expect("addr"),
            },
            1,
        );
        let foreign = (0..=255u8)
            .map(|i| WalletAddress::from_bytes([i; 20]))
            .find(|addr| !state.owns(addr))
            .expect("an address owned elsewhere");

        let mut client = send_handshake(relay, &client_handshake(foreign)).await;
        assert_eq!(response(&mut client).await.error, ProtocolErrorKind::WrongNode.code());
    }

    #[tokio::test]
    async fn reassignment_discards_waiters_with_wrong_node() {
        let (relay, state, _handle) = start(config()).await;
        let credentials = credentials();
        let target = credentials.wallet_address();

        let mut server = send_handshake(relay, &server_handshake(&credentials)).await;
        assert!(eventually(|| state.waiting() == 1).await);

        // Force the address away by joining members until one takes it.
        let mut i = 0;
        while state.owns(&target) {
            let member = Member {
                name: format!("other-{i}"),
                addr: "127.0.0.2:1".parse().expect("addr"),
                meta: "127.0.0.2:2".to_string(),
            };
            crate::cluster::MembershipEvents::on_join(state.as_ref(), &member);
            i += 1;
        }

        assert_eq!(response(&mut server).await.error, ProtocolErrorKind::WrongNode.code());
        assert_eq!(state.waiting(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_node() {
        let server = RelayServer::bind(config()).await.expect("bind");
        let addr = server.local_addr().expect("addr");
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.serve());

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join").expect("serve");
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
