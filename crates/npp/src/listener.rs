//! Listener accepting plain, punched and relayed connections.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::FutureExt;
use npp_core::TransportCredentials;
use npp_relay::RelayListener;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::{ListenerConfig, PunchConfig};
use crate::conn::{ConnSource, NppConn};
use crate::error::{NppError, NppResult};
use crate::metrics::ListenerMetrics;
use crate::puncher::{PunchServer, PunchTransport, QuicTransport, Tasks, TcpTransport};

/// Accepts peer connections however they arrive.
///
/// Plain TCP connections are preferred. Punching and relay registration
/// start on the first [`Self::accept`] and run in the background until the
/// listener is closed or dropped.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    credentials: TransportCredentials,
    config: ListenerConfig,
    punched: mpsc::Receiver<NppConn>,
    relayed: mpsc::Receiver<NppConn>,
    senders: Option<(mpsc::Sender<NppConn>, mpsc::Sender<NppConn>)>,
    metrics: Arc<ListenerMetrics>,
    tasks: Tasks,
    closed: bool,
}

impl Listener {
    /// Binds the plain TCP listener.
    ///
    /// # Errors
    ///
    /// Returns [`NppError::Io`] if the address is unavailable.
    pub async fn bind(config: ListenerConfig, credentials: TransportCredentials) -> NppResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, identity = %credentials.wallet_address(), "listening");
        let capacity = config.backlog.max(1);
        let (punched_tx, punched) = mpsc::channel(capacity);
        let (relayed_tx, relayed) = mpsc::channel(capacity);
        Ok(Self {
            listener,
            credentials,
            config,
            punched,
            relayed,
            senders: Some((punched_tx, relayed_tx)),
            metrics: Arc::new(ListenerMetrics::default()),
            tasks: Tasks::default(),
            closed: false,
        })
    }

    /// Address of the plain TCP listener.
    pub fn local_addr(&self) -> NppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepted connection counters.
    pub fn metrics(&self) -> Arc<ListenerMetrics> {
        self.metrics.clone()
    }

    /// Returns the next connection from any source.
    ///
    /// # Errors
    ///
    /// Returns [`NppError::Closed`] after [`Self::close`], and
    /// [`NppError::Io`] if the plain listener fails; the listener stays
    /// usable after the latter.
    pub async fn accept(&mut self) -> NppResult<NppConn> {
        if self.closed {
            return Err(NppError::Closed);
        }
        if let Some(accepted) = self.listener.accept().now_or_never() {
            return self.direct(accepted);
        }
        self.start();
        let conn = tokio::select! {
            biased;
            accepted = self.listener.accept() => return self.direct(accepted),
            Some(conn) = self.punched.recv() => conn,
            Some(conn) = self.relayed.recv() => conn,
        };
        self.metrics.record(conn.source());
        debug!(remote = %conn.remote_addr(), source = %conn.source(), "accepted connection");
        Ok(conn)
    }

    /// Stops background punching and relay registration.
    ///
    /// Connections already returned are not affected.
    pub fn close(&mut self) {
        self.closed = true;
        self.senders = None;
        self.tasks = Tasks::default();
    }

    fn direct(&self, accepted: std::io::Result<(tokio::net::TcpStream, SocketAddr)>) -> NppResult<NppConn> {
        let (stream, peer) = accepted?;
        self.metrics.record(ConnSource::Direct);
        debug!(remote = %peer, "accepted direct connection");
        Ok(NppConn::tcp(stream, ConnSource::Direct)?)
    }

    fn start(&mut self) {
        let Some((punched, relayed)) = self.senders.take() else {
            return;
        };
        let config = &self.config;
        let backoff = Backoff::new(config.min_backoff, config.max_backoff);

        if !config.rendezvous.is_empty() {
            let credentials = self.credentials.clone();
            let rendezvous = config.rendezvous.clone();
            let protocol = config.protocol.clone();
            let punch = config.punch;
            self.tasks.push(tokio::spawn(run_puncher(
                "tcp",
                move || {
                    let credentials = credentials.clone();
                    let rendezvous = rendezvous.clone();
                    let protocol = protocol.clone();
                    async move { TcpTransport::connect(&rendezvous, &credentials, &protocol, punch).await }
                },
                punch,
                backoff.clone(),
                punched.clone(),
            )));

            if config.quic {
                let credentials = self.credentials.clone();
                let rendezvous = config.rendezvous.clone();
                let protocol = config.protocol.clone();
                let bind = SocketAddr::new(config.bind_addr.ip(), 0);
                self.tasks.push(tokio::spawn(run_puncher(
                    "quic",
                    move || {
                        let credentials = credentials.clone();
                        let rendezvous = rendezvous.clone();
                        let protocol = protocol.clone();
                        async move { QuicTransport::connect(bind, &rendezvous, &credentials, &protocol, punch).await }
                    },
                    punch,
                    backoff.clone(),
                    punched,
                )));
            }
        }

        if !config.relays.is_empty() {
            let relay = RelayListener::new(config.relays.clone(), self.credentials.clone(), config.relay.clone());
            for _ in 0..config.relay_concurrency.max(1) {
                self.tasks
                    .push(tokio::spawn(run_relay(relay.clone(), backoff.clone(), relayed.clone())));
            }
        }
    }
}

/// Serves one puncher kind, rebuilding it with backoff after failures.
async fn run_puncher<T, F, Fut>(
    kind: &'static str,
    connect: F,
    punch: PunchConfig,
    mut backoff: Backoff,
    queue: mpsc::Sender<NppConn>,
) where
    T: PunchTransport,
    F: Fn() -> Fut + Send,
    Fut: Future<Output = NppResult<T>> + Send,
{
    loop {
        let err = match connect().await {
            Ok(transport) => {
                let mut server = PunchServer::new(transport, punch);
                loop {
                    match server.accept().await {
                        Ok(conn) => {
                            backoff.reset();
                            if queue.send(conn).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => break e,
                    }
                }
            }
            Err(e) => e,
        };
        let delay = backoff.next_delay();
        warn!(kind, error = %err, delay = ?delay, "puncher failed, rebuilding");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = queue.closed() => return,
        }
    }
}

/// Keeps one relay registration outstanding.
async fn run_relay(relay: RelayListener, mut backoff: Backoff, queue: mpsc::Sender<NppConn>) {
    loop {
        let accepted = tokio::select! {
            accepted = relay.accept() => accepted,
            () = queue.closed() => return,
        };
        match accepted
            .map_err(NppError::from)
            .and_then(|stream| NppConn::tcp(stream, ConnSource::Relayed).map_err(NppError::from))
        {
            Ok(conn) => {
                backoff.reset();
                if queue.send(conn).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                debug!(error = %e, delay = ?delay, "relay registration failed");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
