//! Rendezvous server accepting sessions over TCP and QUIC.

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;

use npp_core::auth::{AUTH_TIMEOUT, ChannelBinding};
use npp_core::tls::Acceptor;
use npp_core::{PROTOCOL_TCP, PROTOCOL_UDP, TransportCredentials};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{RendezvousError, RendezvousResult};
use crate::resolver::PublicIpResolver;
use crate::service::RendezvousService;
use crate::session::{QUIC_SESSION_PREAMBLE, run_session};

/// Rendezvous server.
///
/// [`RendezvousServer::bind`] opens the listeners so their addresses are
/// known before [`RendezvousServer::serve`] starts accepting sessions.
#[derive(Debug)]
pub struct RendezvousServer {
    /// Server configuration.
    config: ServerConfig,
    /// Matching service shared by all sessions.
    service: Arc<RendezvousService>,
    /// TCP listener.
    listener: TcpListener,
    /// QUIC endpoint, if enabled.
    endpoint: Option<quinn::Endpoint>,
    /// TLS acceptor for TCP sessions.
    tls: Acceptor,
    /// Session limit.
    sessions: Arc<Semaphore>,
    /// Shutdown signal sender.
    shutdown_tx: mpsc::Sender<()>,
    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

/// Stops a running [`RendezvousServer`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(mpsc::Sender<()>);

impl ShutdownHandle {
    /// Signals the server to stop accepting and abort all sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the server has already stopped.
    pub async fn shutdown(&self) -> RendezvousResult<()> {
        self.0
            .send(())
            .await
            .map_err(|_| RendezvousError::SessionClosed)
    }
}

impl RendezvousServer {
    /// Binds the TCP listener and, if configured, the QUIC endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if either socket cannot be bound.
    pub async fn bind(
        config: ServerConfig,
        credentials: &TransportCredentials,
    ) -> RendezvousResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| RendezvousError::BindFailed(config.bind_addr, e))?;
        let tcp_addr = listener.local_addr()?;
        info!(addr = %tcp_addr, "exposing Rendezvous TCP server");

        let endpoint = match config.quic_addr {
            Some(addr) => {
                // Port 0 follows the TCP port so both transports share a number.
                let addr = if addr.port() == 0 && addr.ip() == config.bind_addr.ip() {
                    tcp_addr
                } else {
                    addr
                };
                let server_config = credentials.quic_server_config()?;
                let endpoint = quinn::Endpoint::server(server_config, addr)
                    .map_err(|e| RendezvousError::BindFailed(addr, e))?;
                info!(addr = %endpoint.local_addr()?, "exposing Rendezvous QUIC server");
                Some(endpoint)
            }
            None => None,
        };

        let tls = Acceptor::new(credentials)?;
        let resolver = PublicIpResolver::new(config.public_ip.clone());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        Ok(Self {
            sessions: Arc::new(Semaphore::new(config.max_sessions)),
            service: Arc::new(RendezvousService::new(resolver)),
            config,
            listener,
            endpoint,
            tls,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Address of the TCP listener.
    pub fn local_addr(&self) -> RendezvousResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Address of the QUIC endpoint, if enabled.
    pub fn quic_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    /// The matching service, for introspection.
    pub fn service(&self) -> Arc<RendezvousService> {
        self.service.clone()
    }

    /// Returns a handle that stops [`Self::serve`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Accepts sessions until shut down.
    pub async fn serve(mut self) -> RendezvousResult<()> {
        let mut sessions = JoinSet::new();
        let max_calls = self.config.max_calls_per_session;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Some(permit) = self.admit(peer) {
                                let service = self.service.clone();
                                let acceptor = self.tls.clone();
                                sessions.spawn(handle_tcp(service, acceptor, stream, peer, max_calls, permit));
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                incoming = accept_quic(self.endpoint.as_ref()) => {
                    match incoming {
                        Some(incoming) => {
                            let peer = incoming.remote_address();
                            if let Some(permit) = self.admit(peer) {
                                let service = self.service.clone();
                                sessions.spawn(handle_quic(service, incoming, max_calls, permit));
                            }
                        }
                        None => {
                            warn!("QUIC endpoint closed, continuing with TCP only");
                            self.endpoint = None;
                        }
                    }
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Some(endpoint) = &self.endpoint {
            endpoint.close(0u32.into(), b"shutdown");
        }
        sessions.shutdown().await;
        info!("Rendezvous server stopped");
        Ok(())
    }

    fn admit(&self, peer: SocketAddr) -> Option<OwnedSemaphorePermit> {
        let permit = self.sessions.clone().try_acquire_owned().ok();
        if permit.is_none() {
            warn!(
                peer = %peer,
                max = self.config.max_sessions,
                "Connection rejected: max sessions reached"
            );
        }
        permit
    }
}

async fn accept_quic(endpoint: Option<&quinn::Endpoint>) -> Option<quinn::Incoming> {
    match endpoint {
        Some(endpoint) => endpoint.accept().await,
        None => future::pending().await,
    }
}

async fn handle_tcp(
    service: Arc<RendezvousService>,
    acceptor: Acceptor,
    stream: TcpStream,
    peer: SocketAddr,
    max_calls: usize,
    _permit: OwnedSemaphorePermit,
) {
    debug!(peer = %peer, "New TCP session");
    let (stream, binding) =
        match tokio::time::timeout(AUTH_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "TLS handshake timed out");
                return;
            }
        };
    let (reader, writer) = tokio::io::split(stream);
    match run_session(service, reader, writer, &binding, peer, PROTOCOL_TCP, max_calls).await {
        Ok(()) => debug!(peer = %peer, "TCP session closed"),
        Err(e) => debug!(peer = %peer, error = %e, "TCP session failed"),
    }
}

async fn handle_quic(
    service: Arc<RendezvousService>,
    incoming: quinn::Incoming,
    max_calls: usize,
    _permit: OwnedSemaphorePermit,
) {
    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(e) => {
            debug!(error = %e, "QUIC handshake failed");
            return;
        }
    };
    let peer = connection.remote_address();
    debug!(peer = %peer, "New QUIC session");

    let (send, mut recv) = match connection.accept_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            debug!(peer = %peer, error = %e, "QUIC session stream not opened");
            return;
        }
    };
    let mut preamble = [0u8; 1];
    if let Err(e) = recv.read_exact(&mut preamble).await {
        debug!(peer = %peer, error = %e, "QUIC session preamble not received");
        return;
    }
    if preamble[0] != QUIC_SESSION_PREAMBLE {
        debug!(peer = %peer, "unexpected QUIC session preamble");
        connection.close(1u32.into(), b"bad preamble");
        return;
    }

    let binding = match ChannelBinding::from_quic(&connection) {
        Ok(binding) => binding,
        Err(e) => {
            debug!(peer = %peer, error = %e, "QUIC channel binding unavailable");
            connection.close(1u32.into(), b"no channel binding");
            return;
        }
    };
    match run_session(service, recv, send, &binding, peer, PROTOCOL_UDP, max_calls).await {
        Ok(()) => debug!(peer = %peer, "QUIC session closed"),
        Err(e) => debug!(peer = %peer, error = %e, "QUIC session failed"),
    }
    connection.close(0u32.into(), b"done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RendezvousClient;
    use crate::config::ClientConfig;
    use crate::resolver::PublicIpSource;
    use ed25519_dalek::SigningKey;
    use npp_core::{Addr, WalletAddress, tls};
    use rand::rngs::OsRng;
    use std::time::Duration;

    fn credentials() -> TransportCredentials {
        TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials")
    }

    async fn start(quic: bool) -> (SocketAddr, Option<SocketAddr>, Arc<RendezvousService>, ShutdownHandle) {
        let mut config = ServerConfig::new("127.0.0.1:0".parse().expect("addr"))
            .with_public_ip(PublicIpSource::Disabled);
        if quic {
            config = config.with_quic_addr("127.0.0.1:0".parse().expect("addr"));
        }
        let server = RendezvousServer::bind(config, &credentials()).await.expect("bind");
        let addr = server.local_addr().expect("addr");
        let quic_addr = server.quic_addr();
        let service = server.service();
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.serve());
        (addr, quic_addr, service, shutdown)
    }

    async fn wait_for_waiters(service: &RendezvousService, count: usize) {
        for _ in 0..200 {
            if service.waiting() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("waiting room never reached {count} keys");
    }

    fn private(addr: &str) -> Addr {
        Addr::tcp(addr.parse().expect("addr"))
    }

    // ===== TCP sessions =====

    #[tokio::test]
    async fn tcp_publish_and_resolve_pair_up() {
        let (addr, _, service, shutdown) = start(false).await;
        let server_creds = credentials();
        let server_wallet = server_creds.wallet_address();

        let server = RendezvousClient::connect_tcp(addr, &server_creds, ClientConfig::default())
            .await
            .expect("server session");
        assert_eq!(server.identity(), server_wallet);
        let client = RendezvousClient::connect_tcp(addr, &credentials(), ClientConfig::default())
            .await
            .expect("client session");

        let server_addrs = vec![private("10.0.0.1:7000")];
        let client_addrs = vec![private("10.0.0.2:7001")];
        let (published, resolved) = tokio::join!(
            server.publish("tcp", &server_addrs),
            async {
                wait_for_waiters(&service, 1).await;
                client.resolve("tcp", server_wallet, &client_addrs).await
            }
        );
        let published = published.expect("publish");
        let resolved = resolved.expect("resolve");

        assert_eq!(resolved.public.map(|a| a.socket), Some(server.local_addr()));
        assert_eq!(resolved.private, server_addrs);
        assert_eq!(published.public.map(|a| a.socket), Some(client.local_addr()));
        assert_eq!(published.private, client_addrs);
        assert_eq!(service.waiting(), 0);

        shutdown.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn dropped_call_is_cancelled_on_server() {
        let (addr, _, service, shutdown) = start(false).await;
        let client = RendezvousClient::connect_tcp(addr, &credentials(), ClientConfig::default())
            .await
            .expect("session");
        let target = WalletAddress::from_bytes([9; WalletAddress::LEN]);

        let resolve = client.resolve("tcp", target, &[]);
        assert!(tokio::time::timeout(Duration::from_millis(200), resolve).await.is_err());
        wait_for_waiters(&service, 0).await;
        assert!(!client.is_closed());

        shutdown.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn closing_session_withdraws_waiters() {
        let (addr, _, service, shutdown) = start(false).await;
        let server = RendezvousClient::connect_tcp(addr, &credentials(), ClientConfig::default())
            .await
            .expect("session");

        let publish = tokio::spawn(async move {
            let _ = server.publish("tcp", &[]).await;
        });
        wait_for_waiters(&service, 1).await;
        publish.abort();
        let _ = publish.await;
        wait_for_waiters(&service, 0).await;

        shutdown.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn resolve_all_and_info_over_session() {
        let (addr, _, service, shutdown) = start(false).await;
        let server_creds = credentials();
        let server_wallet = server_creds.wallet_address();
        let server = Arc::new(
            RendezvousClient::connect_tcp(addr, &server_creds, ClientConfig::default())
                .await
                .expect("server session"),
        );
        let observer = RendezvousClient::connect_tcp(addr, &credentials(), ClientConfig::default())
            .await
            .expect("observer session");

        let err = observer.resolve_all(server_wallet).await.expect_err("nothing yet");
        assert!(matches!(err, RendezvousError::NotFound(_)));

        let publisher = {
            let server = server.clone();
            tokio::spawn(async move { server.publish("tcp", &[]).await })
        };
        wait_for_waiters(&service, 1).await;

        let ids = observer.resolve_all(server_wallet).await.expect("resolve all");
        assert_eq!(ids.len(), 1);
        let state = observer.info().await.expect("info");
        assert_eq!(state.state.len(), 1);

        publisher.abort();
        shutdown.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn unreachable_server_is_reported() {
        let probe = TcpListener::bind("127.0.0.1:0").await.expect("probe");
        let addr = probe.local_addr().expect("addr");
        drop(probe);
        let err = RendezvousClient::connect_tcp(addr, &credentials(), ClientConfig::default())
            .await
            .expect_err("nobody listens");
        assert!(matches!(err, RendezvousError::Unreachable { .. }));
        assert!(err.is_transport_failure());
    }

    #[tokio::test]
    async fn shutdown_ends_sessions() {
        let (addr, _, _, shutdown) = start(false).await;
        let client = RendezvousClient::connect_tcp(addr, &credentials(), ClientConfig::default())
            .await
            .expect("session");
        shutdown.shutdown().await.expect("shutdown");

        let target = WalletAddress::from_bytes([1; WalletAddress::LEN]);
        let result = tokio::time::timeout(Duration::from_secs(5), client.resolve("tcp", target, &[]))
            .await
            .expect("call must end with the session");
        assert!(matches!(result, Err(RendezvousError::SessionClosed)));
    }

    // ===== Session binding =====

    #[tokio::test]
    async fn proof_relayed_through_a_forwarder_is_rejected() {
        let (addr, _, service, shutdown) = start(false).await;

        // The forwarder terminates the victim's TLS with its own certificate
        // and opens a second TLS session to the real server.
        let forwarder_creds = credentials();
        let acceptor = Acceptor::new(&forwarder_creds).expect("acceptor");
        let front = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let front_addr = front.local_addr().expect("addr");
        let forwarder = tokio::spawn(async move {
            let (stream, _) = front.accept().await.expect("accept");
            let (mut near, _) = acceptor.accept(stream).await.expect("victim tls");
            let upstream = TcpStream::connect(addr).await.expect("upstream");
            let (mut far, _) = tls::connect(&forwarder_creds, upstream).await.expect("server tls");
            let _ = tokio::io::copy_bidirectional(&mut near, &mut far).await;
        });

        let victim = credentials();
        let err = RendezvousClient::connect_tcp(front_addr, &victim, ClientConfig::default())
            .await
            .expect_err("relayed proof must not bind");
        assert!(matches!(err, RendezvousError::Unreachable { .. }), "{err}");
        assert_eq!(service.waiting(), 0);

        forwarder.abort();
        shutdown.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn tcp_session_is_bound_to_its_own_identity() {
        let (addr, _, _, shutdown) = start(false).await;
        let creds = credentials();
        let client = RendezvousClient::connect_tcp(addr, &creds, ClientConfig::default())
            .await
            .expect("session");
        assert_eq!(client.identity(), creds.wallet_address());
        shutdown.shutdown().await.expect("shutdown");
    }

    // ===== QUIC sessions =====

    #[tokio::test]
    async fn quic_and_tcp_sessions_meet() {
        let (addr, quic_addr, service, shutdown) = start(true).await;
        let quic_addr = quic_addr.expect("quic enabled");

        let server_creds = credentials();
        let server_wallet = server_creds.wallet_address();
        let endpoint = server_creds
            .quic_endpoint("127.0.0.1:0".parse().expect("addr"))
            .expect("endpoint");
        let server = RendezvousClient::connect_quic(&endpoint, quic_addr, &server_creds, ClientConfig::default())
            .await
            .expect("quic session");
        assert_eq!(server.local_addr(), endpoint.local_addr().expect("addr"));

        let client = RendezvousClient::connect_tcp(addr, &credentials(), ClientConfig::default())
            .await
            .expect("tcp session");

        let (published, resolved) = tokio::join!(server.publish("quic+tcp", &[]), async {
            wait_for_waiters(&service, 1).await;
            client.resolve("quic+tcp", server_wallet, &[]).await
        });
        let resolved = resolved.expect("resolve");
        published.expect("publish");
        let public = resolved.public.expect("public addr");
        assert_eq!(public.socket, server.local_addr());
        assert_eq!(public.protocol, "udp");

        shutdown.shutdown().await.expect("shutdown");
    }
}
