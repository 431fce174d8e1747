//! Rendezvous client.
//!
//! A client owns one authenticated session and multiplexes calls over it.
//! TCP sessions run over TLS; QUIC sessions use the connection's own.
//! Dropping a call future before it completes sends a `Cancel` frame so the
//! server withdraws the matching waiter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use npp_core::auth::{self, ChannelBinding};
use npp_core::codec::{self, MAX_RPC_FRAME, frame_reader, frame_writer};
use npp_core::net::connect_reusable;
use npp_core::tls;
use npp_core::wire::rendezvous_request::Call;
use npp_core::wire::rendezvous_response::Result as CallResult;
use npp_core::wire::{
    ConnectRequest, Empty, PublishRequest, RendezvousRequest, RendezvousResponse, RendezvousState,
    ResolveAllRequest,
};
use npp_core::{Addr, Candidates, QUIC_SERVER_NAME, TransportCredentials, WalletAddress};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{CODE_INTERNAL, RendezvousError, RendezvousResult};
use crate::session::QUIC_SESSION_PREAMBLE;

type Pending = Mutex<HashMap<u64, oneshot::Sender<CallResult>>>;

#[derive(Debug, Default)]
struct Shared {
    pending: Pending,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every pending call.
        self.pending.lock().clear();
    }
}

/// Connection to a Rendezvous server.
#[derive(Debug)]
pub struct RendezvousClient {
    shared: Arc<Shared>,
    requests: mpsc::Sender<RendezvousRequest>,
    next_call_id: AtomicU64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    identity: WalletAddress,
    tasks: [JoinHandle<()>; 2],
    connection: Option<quinn::Connection>,
}

impl RendezvousClient {
    /// Connects over TCP from an ephemeral local port.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Unreachable`] if the server cannot be
    /// reached or authentication fails.
    pub async fn connect_tcp(
        addr: SocketAddr,
        credentials: &TransportCredentials,
        config: ClientConfig,
    ) -> RendezvousResult<Self> {
        Self::connect_tcp_from(None, addr, credentials, config).await
    }

    /// Connects over TCP from `local`, sharing the local port with other
    /// sockets of this process.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Unreachable`] if the server cannot be
    /// reached or authentication fails.
    pub async fn connect_tcp_from(
        local: Option<SocketAddr>,
        addr: SocketAddr,
        credentials: &TransportCredentials,
        config: ClientConfig,
    ) -> RendezvousResult<Self> {
        let unreachable = |reason: String| RendezvousError::Unreachable { addr, reason };
        tokio::time::timeout(config.connect_timeout, async {
            let stream = connect_reusable(local, addr)
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            let local_addr = stream.local_addr()?;
            let (stream, binding) = tls::connect(credentials, stream)
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            let (reader, writer) = tokio::io::split(stream);
            Self::establish(reader, writer, local_addr, addr, credentials, &binding, config, None).await
        })
        .await
        .map_err(|_| unreachable("connect timed out".to_string()))?
    }

    /// Connects over QUIC through an existing endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Unreachable`] if the server cannot be
    /// reached or authentication fails.
    pub async fn connect_quic(
        endpoint: &quinn::Endpoint,
        addr: SocketAddr,
        credentials: &TransportCredentials,
        config: ClientConfig,
    ) -> RendezvousResult<Self> {
        let unreachable = |reason: String| RendezvousError::Unreachable { addr, reason };
        tokio::time::timeout(config.connect_timeout, async {
            let connection = endpoint
                .connect(addr, QUIC_SERVER_NAME)
                .map_err(|e| unreachable(e.to_string()))?
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            let (mut send, recv) = connection
                .open_bi()
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            send.write_all(&[QUIC_SESSION_PREAMBLE])
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            let local_addr = endpoint.local_addr()?;
            let binding =
                ChannelBinding::from_quic(&connection).map_err(|e| unreachable(e.to_string()))?;
            Self::establish(recv, send, local_addr, addr, credentials, &binding, config, Some(connection))
                .await
        })
        .await
        .map_err(|_| unreachable("connect timed out".to_string()))?
    }

    #[allow(clippy::too_many_arguments)]
    async fn establish<R, W>(
        mut reader: R,
        mut writer: W,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        credentials: &TransportCredentials,
        binding: &ChannelBinding,
        config: ClientConfig,
        connection: Option<quinn::Connection>,
    ) -> RendezvousResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let identity = auth::authenticate(&mut reader, &mut writer, credentials, binding)
            .await
            .map_err(|e| RendezvousError::Unreachable {
                addr: remote_addr,
                reason: e.to_string(),
            })?;
        debug!(server = %remote_addr, local = %local_addr, identity = %identity, "rendezvous session established");

        let shared = Arc::new(Shared::default());
        let (requests_tx, requests_rx) = mpsc::channel(config.request_queue.max(1));
        let reader_task = tokio::spawn(read_responses(reader, shared.clone()));
        let writer_task = tokio::spawn(write_requests(writer, requests_rx, shared.clone()));

        Ok(Self {
            shared,
            requests: requests_tx,
            next_call_id: AtomicU64::new(1),
            local_addr,
            remote_addr,
            identity,
            tasks: [reader_task, writer_task],
            connection,
        })
    }

    /// Local address of the session socket.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the Rendezvous server.
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Identity the server bound to this session.
    pub const fn identity(&self) -> WalletAddress {
        self.identity
    }

    /// Returns true once the session has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolves the server published as `target` under `protocol`.
    ///
    /// Blocks until such a server publishes; drop the future to give up.
    pub async fn resolve(
        &self,
        protocol: &str,
        target: WalletAddress,
        private_addrs: &[Addr],
    ) -> RendezvousResult<Candidates> {
        let request = ConnectRequest {
            id: target.to_vec(),
            protocol: protocol.to_string(),
            private_addrs: private_addrs.iter().map(Addr::to_wire).collect(),
        };
        match self.call(Call::Resolve(request)).await? {
            CallResult::Reply(reply) => Ok(Candidates::from_reply(&reply)),
            other => Err(unexpected(&other)),
        }
    }

    /// Publishes this session's identity under `protocol` and waits for a
    /// resolver.
    pub async fn publish(&self, protocol: &str, private_addrs: &[Addr]) -> RendezvousResult<Candidates> {
        let request = PublishRequest {
            protocol: protocol.to_string(),
            private_addrs: private_addrs.iter().map(Addr::to_wire).collect(),
        };
        match self.call(Call::Publish(request)).await? {
            CallResult::Reply(reply) => Ok(Candidates::from_reply(&reply)),
            other => Err(unexpected(&other)),
        }
    }

    /// Lists the handles of servers waiting under `target`.
    pub async fn resolve_all(&self, target: WalletAddress) -> RendezvousResult<Vec<String>> {
        let request = ResolveAllRequest {
            id: target.to_string(),
        };
        match self.call(Call::ResolveAll(request)).await? {
            CallResult::ResolveAll(reply) => Ok(reply.ids),
            other => Err(unexpected(&other)),
        }
    }

    /// Dumps the server's waiting room.
    pub async fn info(&self) -> RendezvousResult<RendezvousState> {
        match self.call(Call::Info(Empty {})).await? {
            CallResult::Info(state) => Ok(state),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&self, call: Call) -> RendezvousResult<CallResult> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(call_id, tx);
        let mut guard = PendingCall {
            shared: &self.shared,
            requests: &self.requests,
            call_id,
            armed: true,
        };
        if self.is_closed() {
            return Err(RendezvousError::SessionClosed);
        }

        self.requests
            .send(RendezvousRequest {
                call_id,
                call: Some(call),
            })
            .await
            .map_err(|_| RendezvousError::SessionClosed)?;
        let result = rx.await;
        guard.armed = false;

        match result.map_err(|_| RendezvousError::SessionClosed)? {
            CallResult::Error(e) => Err(RendezvousError::from_rpc(e)),
            other => Ok(other),
        }
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(connection) = &self.connection {
            connection.close(0u32.into(), b"closed");
        }
        self.shared.close();
    }
}

/// Cancels a call whose future is dropped before the response arrives.
struct PendingCall<'a> {
    shared: &'a Shared,
    requests: &'a mpsc::Sender<RendezvousRequest>,
    call_id: u64,
    armed: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.pending.lock().remove(&self.call_id);
        let cancel = RendezvousRequest {
            call_id: self.call_id,
            call: Some(Call::Cancel(Empty {})),
        };
        if self.requests.try_send(cancel).is_err() {
            debug!(call_id = self.call_id, "cancel not sent, session busy or closed");
        }
    }
}

fn unexpected(result: &CallResult) -> RendezvousError {
    let kind = match result {
        CallResult::Reply(_) => "reply",
        CallResult::ResolveAll(_) => "resolve-all",
        CallResult::Info(_) => "info",
        CallResult::Error(_) => "error",
    };
    RendezvousError::Remote {
        code: CODE_INTERNAL,
        message: format!("unexpected {kind} response"),
    }
}

async fn read_responses<R>(reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = frame_reader(reader, MAX_RPC_FRAME);
    loop {
        match codec::recv::<_, RendezvousResponse>(&mut frames).await {
            Ok(response) => {
                let waiter = shared.pending.lock().remove(&response.call_id);
                match (waiter, response.result) {
                    (Some(waiter), Some(result)) => {
                        let _ = waiter.send(result);
                    }
                    (Some(_), None) => {
                        debug!(call_id = response.call_id, "empty rendezvous response");
                    }
                    (None, _) => {
                        debug!(call_id = response.call_id, "response for unknown call");
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "rendezvous session ended");
                break;
            }
        }
    }
    shared.close();
}

async fn write_requests<W>(writer: W, mut requests: mpsc::Receiver<RendezvousRequest>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = frame_writer(writer, MAX_RPC_FRAME);
    while let Some(request) = requests.recv().await {
        if let Err(e) = codec::send(&mut sink, &request).await {
            debug!(error = %e, "failed to write rendezvous request");
            break;
        }
    }
    shared.close();
}
