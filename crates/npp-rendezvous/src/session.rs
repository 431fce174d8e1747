//! One authenticated Rendezvous session.
//!
//! A session starts with the challenge-response exchange from
//! [`npp_core::auth`], bound to the TLS session underneath, then carries
//! multiplexed calls. Every call runs as
//! its own task so a blocking `Resolve` or `Publish` never stalls the
//! session; a `Cancel` frame aborts the task with the same call id, which
//! drops its waiting-room registration. Ending the session aborts every
//! call still in flight.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use npp_core::auth::{self, ChannelBinding};
use npp_core::codec::{self, MAX_RPC_FRAME, frame_reader, frame_writer};
use npp_core::wire::rendezvous_request::Call;
use npp_core::wire::rendezvous_response::Result as CallResult;
use npp_core::wire::{RendezvousRequest, RendezvousResponse, RpcError};
use npp_core::ProtoError;
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

use crate::error::{CODE_INTERNAL, CODE_RESOURCE_EXHAUSTED, RendezvousResult};
use crate::service::{CallContext, RendezvousService};

/// First byte a client writes on a freshly opened QUIC session stream.
///
/// QUIC only announces a stream to the acceptor once data flows on it, and
/// the server speaks first in the authentication exchange.
pub(crate) const QUIC_SESSION_PREAMBLE: u8 = 0x4e;

/// Runs a session over an already established transport.
pub(crate) async fn run_session<R, W>(
    service: Arc<RendezvousService>,
    mut reader: R,
    mut writer: W,
    binding: &ChannelBinding,
    remote: SocketAddr,
    protocol: &'static str,
    max_calls: usize,
) -> RendezvousResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let wallet = auth::verify_peer(&mut reader, &mut writer, binding).await?;
    debug!(peer = %remote, wallet = %wallet, protocol, "rendezvous session authenticated");
    let ctx = CallContext::authenticated(remote, protocol, wallet);

    let (responses_tx, responses_rx) = mpsc::channel(max_calls.max(1));
    let writer_task = tokio::spawn(write_responses(writer, responses_rx));
    let result = read_calls(service, ctx, reader, responses_tx, max_calls).await;
    writer_task.abort();
    result
}

async fn write_responses<W>(writer: W, mut responses: mpsc::Receiver<RendezvousResponse>)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = frame_writer(writer, MAX_RPC_FRAME);
    while let Some(response) = responses.recv().await {
        if let Err(e) = codec::send(&mut sink, &response).await {
            debug!(error = %e, "failed to write rendezvous response");
            return;
        }
    }
}

async fn read_calls<R>(
    service: Arc<RendezvousService>,
    ctx: CallContext,
    reader: R,
    responses: mpsc::Sender<RendezvousResponse>,
    max_calls: usize,
) -> RendezvousResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = frame_reader(reader, MAX_RPC_FRAME);
    let mut calls: JoinSet<u64> = JoinSet::new();
    let mut handles: HashMap<u64, AbortHandle> = HashMap::new();

    loop {
        tokio::select! {
            frame = codec::recv::<_, RendezvousRequest>(&mut frames) => {
                let request = match frame {
                    Ok(request) => request,
                    Err(ProtoError::Closed) => break,
                    Err(e) => return Err(e.into()),
                };
                let call_id = request.call_id;
                match request.call {
                    Some(Call::Cancel(_)) => {
                        if let Some(handle) = handles.remove(&call_id) {
                            debug!(call_id, "call cancelled by client");
                            handle.abort();
                        }
                    }
                    Some(_) if handles.len() >= max_calls => {
                        warn!(call_id, max_calls, "call rejected: too many calls in flight");
                        let error = RpcError {
                            code: CODE_RESOURCE_EXHAUSTED,
                            message: format!("at most {max_calls} calls may be in flight"),
                        };
                        let _ = responses.send(failure(call_id, error)).await;
                    }
                    Some(call) => {
                        let service = service.clone();
                        let ctx = ctx.clone();
                        let responses = responses.clone();
                        let handle = calls.spawn(async move {
                            let result = dispatch(&service, &ctx, call).await;
                            let _ = responses.send(response(call_id, result)).await;
                            call_id
                        });
                        handles.insert(call_id, handle);
                    }
                    None => {
                        let error = RpcError {
                            code: CODE_INTERNAL,
                            message: "empty call".to_string(),
                        };
                        let _ = responses.send(failure(call_id, error)).await;
                    }
                }
            }
            Some(done) = calls.join_next(), if !calls.is_empty() => {
                if let Ok(call_id) = done {
                    handles.remove(&call_id);
                }
            }
        }
    }
    Ok(())
}

async fn dispatch(service: &RendezvousService, ctx: &CallContext, call: Call) -> CallResult {
    let result = match call {
        Call::Resolve(request) => service.resolve(ctx, request).await.map(CallResult::Reply),
        Call::Publish(request) => service.publish(ctx, request).await.map(CallResult::Reply),
        Call::ResolveAll(request) => service.resolve_all(&request).map(CallResult::ResolveAll),
        Call::Info(_) => service.info().await.map(CallResult::Info),
        Call::Cancel(_) => {
            return CallResult::Error(RpcError {
                code: CODE_INTERNAL,
                message: "cancel is not a call".to_string(),
            });
        }
    };
    result.unwrap_or_else(|e| CallResult::Error(e.to_rpc()))
}

fn failure(call_id: u64, error: RpcError) -> RendezvousResponse {
    RendezvousResponse {
        call_id,
        result: Some(CallResult::Error(error)),
    }
}

/// Wraps a result, replacing it with an error if it cannot fit in a frame.
fn response(call_id: u64, result: CallResult) -> RendezvousResponse {
    let response = RendezvousResponse {
        call_id,
        result: Some(result),
    };
    let size = response.encoded_len();
    if size > MAX_RPC_FRAME {
        return failure(
            call_id,
            RpcError {
                code: CODE_INTERNAL,
                message: format!("response of {size} bytes exceeds the {MAX_RPC_FRAME} byte frame limit"),
            },
        );
    }
    response
}
