//! TCP punching primitives.

use std::net::SocketAddr;

use npp_core::net::{connect_reusable, listen_reusable};
use npp_core::{Addr, PROTOCOL_TCP, TransportCredentials, local_private_addrs};
use npp_rendezvous::{ClientConfig, RendezvousClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{PunchTransport, SELECTION_ACK};
use crate::config::PunchConfig;
use crate::conn::{ConnSource, NppConn};
use crate::error::{NppError, NppResult};

/// TCP transport: the Rendezvous session, the passive listener and every
/// active dial share one local address.
#[derive(Debug)]
pub struct TcpTransport {
    session: RendezvousClient,
    listener: TcpListener,
    local_addr: SocketAddr,
    protocol: String,
    config: PunchConfig,
}

impl TcpTransport {
    /// Opens a Rendezvous session with the first reachable server of
    /// `rendezvous` and listens on its local address.
    ///
    /// # Errors
    ///
    /// Returns the last [`NppError::Rendezvous`] failure if no server is
    /// reachable, or [`NppError::Io`] if the listener cannot share the
    /// session's address.
    pub async fn connect(
        rendezvous: &[SocketAddr],
        credentials: &TransportCredentials,
        protocol: &str,
        config: PunchConfig,
    ) -> NppResult<Self> {
        let mut last = None;
        for &addr in rendezvous {
            match RendezvousClient::connect_tcp_from(None, addr, credentials, ClientConfig::new()).await {
                Ok(session) => {
                    let local_addr = session.local_addr();
                    let listener = listen_reusable(local_addr, config.backlog)?;
                    debug!(rendezvous = %addr, local = %local_addr, protocol, "tcp punching transport ready");
                    return Ok(Self {
                        session,
                        listener,
                        local_addr,
                        protocol: protocol.to_string(),
                        config,
                    });
                }
                Err(e) => {
                    debug!(rendezvous = %addr, error = %e, "rendezvous unreachable");
                    last = Some(e);
                }
            }
        }
        Err(last.map_or_else(
            || NppError::Transport("no rendezvous servers configured".to_string()),
            NppError::from,
        ))
    }

    /// Local address shared by the session, the listener and the dials.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl PunchTransport for TcpTransport {
    type Raw = TcpStream;

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn rendezvous(&self) -> &RendezvousClient {
        &self.session
    }

    fn private_addrs(&self) -> NppResult<Vec<Addr>> {
        Ok(local_private_addrs(PROTOCOL_TCP, self.local_addr)?)
    }

    async fn accept_raw(&self) -> NppResult<TcpStream> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "inbound punching connection");
        Ok(stream)
    }

    async fn dial_raw(&self, addr: SocketAddr) -> NppResult<TcpStream> {
        let attempts = self.config.max_attempts.max(1);
        let mut last = NppError::Timeout(self.config.connect_timeout);
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.connect_timeout, connect_reusable(Some(self.local_addr), addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    debug!(addr = %addr, attempt, error = %e, "tcp dial failed");
                    last = NppError::Io(e);
                }
                Err(_) => {
                    debug!(addr = %addr, attempt, "tcp dial timed out");
                    last = NppError::Timeout(self.config.connect_timeout);
                }
            }
        }
        Err(last)
    }

    async fn select(mut raw: TcpStream) -> NppResult<NppConn> {
        raw.write_u8(SELECTION_ACK).await?;
        Ok(NppConn::tcp(raw, ConnSource::Punched)?)
    }

    async fn await_selection(mut raw: TcpStream) -> NppResult<NppConn> {
        match raw.read_u8().await? {
            SELECTION_ACK => Ok(NppConn::tcp(raw, ConnSource::Punched)?),
            other => Err(NppError::Transport(format!("unexpected selection byte {other:#04x}"))),
        }
    }
}
