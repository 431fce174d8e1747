//! Monitoring service of a relay node.
//!
//! A plain request/response exchange of framed [`MonitorRequest`] and
//! [`MonitorResponse`] messages; each connection may issue any number of
//! calls, one at a time.

use std::net::SocketAddr;
use std::sync::Arc;

use npp_core::codec::{self, MAX_RPC_FRAME, frame_reader, frame_writer};
use npp_core::wire::monitor_request::Call;
use npp_core::wire::monitor_response::Result as CallResult;
use npp_core::wire::{
    Empty, MonitorRequest, MonitorResponse, RelayClusterReply, RelayInfo, RelayMetrics, RpcError,
};
use npp_core::ProtoError;
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::server::ShutdownHandle;
use crate::state::RelayState;

/// Error code of a response that could not be produced.
const CODE_INTERNAL: i32 = 13;

/// Error code of a request without a call.
const CODE_INVALID_ARGUMENT: i32 = 3;

/// Serves [`MonitorRequest`]s against a node's state.
#[derive(Debug)]
pub struct MonitorServer {
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl MonitorServer {
    /// Binds the monitoring listener.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BindFailed`] if the address is unavailable.
    pub async fn bind(addr: SocketAddr, state: Arc<RelayState>) -> RelayResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::BindFailed(addr, e))?;
        info!(addr = %listener.local_addr()?, "exposing Relay monitoring");
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            listener,
            state,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Address of the monitoring listener.
    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns a handle that stops [`Self::serve`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Answers monitoring connections until shut down.
    pub async fn serve(mut self) -> RelayResult<()> {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            connections.spawn(handle_connection(self.state.clone(), stream, peer));
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept monitoring connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }
        connections.shutdown().await;
        info!("Relay monitoring stopped");
        Ok(())
    }
}

async fn handle_connection(state: Arc<RelayState>, stream: TcpStream, peer: SocketAddr) {
    let (reader, writer) = stream.into_split();
    let mut requests = frame_reader(reader, MAX_RPC_FRAME);
    let mut responses = frame_writer(writer, MAX_RPC_FRAME);
    loop {
        let request: MonitorRequest = match codec::recv(&mut requests).await {
            Ok(request) => request,
            Err(ProtoError::Closed) => return,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dropping monitoring connection");
                return;
            }
        };
        let response = answer(&state, request);
        if let Err(e) = codec::send(&mut responses, &response).await {
            debug!(peer = %peer, error = %e, "failed to write monitoring response");
            return;
        }
    }
}

/// Builds the response to one call.
pub(crate) fn answer(state: &RelayState, request: MonitorRequest) -> MonitorResponse {
    let result = match request.call {
        Some(Call::Cluster(Empty {})) => CallResult::Cluster(RelayClusterReply {
            members: state
                .continuum()
                .nodes()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }),
        Some(Call::Info(Empty {})) => CallResult::Info(state.info()),
        Some(Call::Metrics(Empty {})) => CallResult::Metrics(state.metrics().snapshot()),
        None => CallResult::Error(RpcError {
            code: CODE_INVALID_ARGUMENT,
            message: "request carries no call".to_string(),
        }),
    };
    let response = MonitorResponse {
        result: Some(result),
    };
    if response.encoded_len() > MAX_RPC_FRAME {
        warn!(size = response.encoded_len(), "Monitoring response exceeds the frame limit");
        return MonitorResponse {
            result: Some(CallResult::Error(RpcError {
                code: CODE_INTERNAL,
                message: format!(
                    "response of {} bytes exceeds the {MAX_RPC_FRAME} byte limit",
                    response.encoded_len()
                ),
            })),
        };
    }
    response
}

/// Client of a relay node's monitoring service.
#[derive(Debug)]
pub struct RelayMonitorClient {
    requests: codec::FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
    responses: codec::FrameReader<tokio::net::tcp::OwnedReadHalf>,
}

impl RelayMonitorClient {
    /// Connects to the monitoring service at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unreachable`] if the connection fails.
    pub async fn connect(addr: SocketAddr) -> RelayResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RelayError::Unreachable {
                addr,
                reason: e.to_string(),
            })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            requests: frame_writer(writer, MAX_RPC_FRAME),
            responses: frame_reader(reader, MAX_RPC_FRAME),
        })
    }

    /// Nodes of the continuum as `name@addr`.
    pub async fn cluster(&mut self) -> RelayResult<Vec<String>> {
        match self.call(Call::Cluster(Empty {})).await? {
            CallResult::Cluster(reply) => Ok(reply.members),
            other => Err(unexpected(&other)),
        }
    }

    /// Parked SERVER peers by address.
    pub async fn info(&mut self) -> RelayResult<RelayInfo> {
        match self.call(Call::Info(Empty {})).await? {
            CallResult::Info(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }

    /// Connection and traffic counters.
    pub async fn metrics(&mut self) -> RelayResult<RelayMetrics> {
        match self.call(Call::Metrics(Empty {})).await? {
            CallResult::Metrics(metrics) => Ok(metrics),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&mut self, call: Call) -> RelayResult<CallResult> {
        codec::send(&mut self.requests, &MonitorRequest { call: Some(call) }).await?;
        let response: MonitorResponse = codec::recv(&mut self.responses).await?;
        match response.result {
            Some(CallResult::Error(e)) => Err(RelayError::Remote {
                code: e.code,
                description: e.message,
            }),
            Some(result) => Ok(result),
            None => Err(ProtoError::Closed.into()),
        }
    }
}

fn unexpected(result: &CallResult) -> RelayError {
    let kind = match result {
        CallResult::Cluster(_) => "cluster",
        CallResult::Info(_) => "info",
        CallResult::Metrics(_) => "metrics",
        CallResult::Error(_) => "error",
    };
    RelayError::Remote {
        code: CODE_INTERNAL,
        description: format!("unexpected {kind} response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayNode;
    use npp_core::{PeerId, Role, WalletAddress};
    use tokio::sync::oneshot;

    fn state() -> Arc<RelayState> {
        let state = Arc::new(RelayState::new(RelayNode {
            name: "local".to_string(),
            addr: "127.0.0.1:12240".parse().expect("addr"),
        }));
        state.continuum().add(state.node().clone(), 1);
        state
    }

    async fn start(state: Arc<RelayState>) -> (SocketAddr, ShutdownHandle) {
        let server = MonitorServer::bind("127.0.0.1:0".parse().expect("addr"), state)
            .await
            .expect("bind");
        let addr = server.local_addr().expect("addr");
        let handle = server.shutdown_handle();
        tokio::spawn(server.serve());
        (addr, handle)
    }

    #[test]
    fn empty_request_is_an_error() {
        let response = answer(&state(), MonitorRequest { call: None });
        assert!(matches!(
            response.result,
            Some(CallResult::Error(RpcError { code: CODE_INVALID_ARGUMENT, .. }))
        ));
    }

    #[test]
    fn oversized_info_becomes_an_error() {
        let state = state();
        for i in 0..2_000u32 {
            let mut bytes = [0u8; 20];
            bytes[..4].copy_from_slice(&i.to_be_bytes());
            let (tx, _rx) = oneshot::channel();
            state.hall().lock().insert(
                WalletAddress::from_bytes(bytes),
                Role::Server,
                PeerId::new(),
                crate::state::Waiter {
                    remote: "127.0.0.1:1".parse().expect("addr"),
                    pin: None,
                    tx,
                },
            );
        }
        let response = answer(&state, MonitorRequest { call: Some(Call::Info(Empty {})) });
        assert!(matches!(
            response.result,
            Some(CallResult::Error(RpcError { code: CODE_INTERNAL, .. }))
        ));
    }

    #[tokio::test]
    async fn client_reads_cluster_info_and_metrics() {
        let state = state();
        state.metrics().net(WalletAddress::from_bytes([5; 20])).add_tx(42);
        let (addr, handle) = start(state).await;

        let mut client = RelayMonitorClient::connect(addr).await.expect("connect");
        assert_eq!(client.cluster().await.expect("cluster"), vec!["local@127.0.0.1:12240".to_string()]);
        assert!(client.info().await.expect("info").state.is_empty());
        let metrics = client.metrics().await.expect("metrics");
        assert_eq!(metrics.net[&WalletAddress::from_bytes([5; 20]).to_string()].tx_bytes, 42);

        handle.shutdown().await.expect("shutdown");
    }
}
