//! Integration test crate for the NAT Punching Protocol.
//!
//! The tests under `tests/` span several crates. This library only holds
//! the fixtures they share: in-process Rendezvous servers and relay nodes
//! bound to loopback ports.

#![forbid(unsafe_code)]
#![allow(clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use npp_core::TransportCredentials;
use npp_relay::{GossipConfig, RelayMonitorClient, RelayServer, RelayServerConfig};
use npp_rendezvous::{PublicIpSource, RendezvousServer, RendezvousService, ServerConfig};
use rand::rngs::OsRng;

/// Gossip secret shared by fixture relay nodes.
pub const CLUSTER_SECRET: [u8; 32] = [7; 32];

/// Fresh random credentials.
pub fn credentials() -> TransportCredentials {
    TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials")
}

/// Loopback address with an OS-assigned port.
pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A loopback port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(loopback()).await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr
}

/// Running Rendezvous server.
pub struct Rendezvous {
    /// TCP address; QUIC listens on the same port number.
    pub addr: SocketAddr,
    /// Matching service, for waiting-room checks.
    pub service: Arc<RendezvousService>,
}

/// Starts a Rendezvous server on loopback serving TCP and QUIC.
pub async fn start_rendezvous() -> Rendezvous {
    let config = ServerConfig::new(loopback())
        .with_quic()
        .with_public_ip(PublicIpSource::Disabled);
    let server = RendezvousServer::bind(config, &credentials()).await.expect("bind rendezvous");
    let addr = server.local_addr().expect("addr");
    let service = server.service();
    tokio::spawn(server.serve());
    Rendezvous { addr, service }
}

/// Running relay node.
pub struct Relay {
    /// Relay address.
    pub addr: SocketAddr,
    /// Gossip address.
    pub gossip: SocketAddr,
    /// Monitoring service address.
    pub monitor: SocketAddr,
    /// Stops the node.
    pub shutdown: npp_relay::ShutdownHandle,
}

/// Starts a relay node on loopback, joining through `seeds`.
pub async fn start_relay(name: &str, seeds: Vec<SocketAddr>) -> Relay {
    let gossip = GossipConfig::new(name, loopback(), CLUSTER_SECRET.to_vec())
        .with_seeds(seeds)
        .with_interval(Duration::from_millis(100))
        .with_failure_timeout(Duration::from_secs(2));
    let config = RelayServerConfig::new(loopback(), gossip).with_monitor(loopback());
    let server = RelayServer::bind(config).await.expect("bind relay");
    let relay = Relay {
        addr: server.local_addr().expect("addr"),
        gossip: server.gossip_addr(),
        monitor: server.monitor_addr().expect("monitor enabled"),
        shutdown: server.shutdown_handle(),
    };
    tokio::spawn(server.serve());
    relay
}

/// Waits until the node behind `monitor` sees `nodes` cluster members.
pub async fn wait_for_cluster(monitor: SocketAddr, nodes: usize) -> bool {
    for _ in 0..100 {
        if let Ok(mut client) = RelayMonitorClient::connect(monitor).await {
            if client.cluster().await.is_ok_and(|members| members.len() == nodes) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Polls `check` until it holds, for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
