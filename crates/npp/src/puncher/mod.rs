//! NAT puncher: races connection attempts over the candidates exchanged
//! through Rendezvous.
//!
//! # Architecture
//!
//! ```text
//!   resolving side (PunchClient)          publishing side (PunchServer)
//!   ----------------------------          -----------------------------
//!   resolve(target) ──► Rendezvous ◄──── publish() x N  (bounded)
//!        │                                     │
//!        ▼                                     ▼
//!   dial every candidate ─────────────►  passive listener
//!   passive listener    ◄─────────────  dial every candidate
//!        │                                     │
//!   first success: write ACK ─────────►  yield only ACKed connections
//!   drop every other socket              (losers see EOF and are dropped)
//! ```
//!
//! Both sides share one local address between the Rendezvous session, the
//! passive listener and the active dials, so the NAT mapping the server
//! observed is the one being punched. [`PunchTransport`] abstracts the
//! three primitives that differ between TCP and QUIC; the state machine in
//! [`PunchClient`] and [`PunchServer`] is shared.

mod client;
mod quic;
mod server;
mod tcp;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use npp_core::Addr;
use npp_rendezvous::RendezvousClient;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conn::NppConn;
use crate::error::{NppError, NppResult};

pub use client::PunchClient;
pub use quic::QuicTransport;
pub use server::PunchServer;
pub use tcp::TcpTransport;

/// Byte the resolving side writes on the connection it keeps.
pub(crate) const SELECTION_ACK: u8 = 0x01;

/// Pause after a failed passive accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// TCP puncher, resolving side.
pub type TcpPunchClient = PunchClient<TcpTransport>;
/// TCP puncher, publishing side.
pub type TcpPunchServer = PunchServer<TcpTransport>;
/// QUIC puncher, resolving side.
pub type QuicPunchClient = PunchClient<QuicTransport>;
/// QUIC puncher, publishing side.
pub type QuicPunchServer = PunchServer<QuicTransport>;

/// Transport primitives a puncher is built from.
pub trait PunchTransport: Send + Sync + 'static {
    /// A connection before selection.
    type Raw: Send + 'static;

    /// Protocol name used on Rendezvous.
    fn protocol(&self) -> &str;

    /// Session with the Rendezvous server, sharing the punching address.
    fn rendezvous(&self) -> &RendezvousClient;

    /// Private candidates of this host for the punching address.
    fn private_addrs(&self) -> NppResult<Vec<Addr>>;

    /// Waits for the next inbound connection on the passive listener.
    ///
    /// Returns [`NppError::Closed`] once the listener is gone.
    fn accept_raw(&self) -> impl Future<Output = NppResult<Self::Raw>> + Send;

    /// Opens an outbound connection to one candidate.
    fn dial_raw(&self, addr: SocketAddr) -> impl Future<Output = NppResult<Self::Raw>> + Send;

    /// Marks `raw` as the chosen connection; used by the resolving side.
    fn select(raw: Self::Raw) -> impl Future<Output = NppResult<NppConn>> + Send;

    /// Waits until the resolving side marks `raw` as chosen.
    fn await_selection(raw: Self::Raw) -> impl Future<Output = NppResult<NppConn>> + Send;
}

/// Background tasks aborted when their owner is dropped.
#[derive(Debug, Default)]
pub(crate) struct Tasks(Vec<JoinHandle<()>>);

impl Tasks {
    pub(crate) fn push(&mut self, handle: JoinHandle<()>) {
        self.0.push(handle);
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Queues inbound connections until `queue` is closed.
///
/// Connections that do not fit are closed right away.
pub(crate) async fn accept_passive<T: PunchTransport>(transport: Arc<T>, queue: mpsc::Sender<T::Raw>) {
    loop {
        let raw = tokio::select! {
            accepted = transport.accept_raw() => accepted,
            () = queue.closed() => return,
        };
        match raw {
            Ok(raw) => match queue.try_send(raw) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(protocol = %transport.protocol(), "passive queue full, closing inbound connection");
                }
                Err(TrySendError::Closed(_)) => return,
            },
            Err(NppError::Closed) => return,
            Err(e) => {
                debug!(protocol = %transport.protocol(), error = %e, "passive accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
