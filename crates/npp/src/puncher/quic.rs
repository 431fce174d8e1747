//! QUIC punching primitives.

use std::net::SocketAddr;

use npp_core::{Addr, PROTOCOL_UDP, QUIC_SERVER_NAME, TransportCredentials, local_private_addrs};
use npp_rendezvous::{ClientConfig, RendezvousClient};
use tracing::debug;

use super::{PunchTransport, SELECTION_ACK};
use crate::config::PunchConfig;
use crate::conn::NppConn;
use crate::error::{NppError, NppResult};

/// QUIC transport: one endpoint is the Rendezvous client, the passive
/// server and the active dialer.
#[derive(Debug)]
pub struct QuicTransport {
    endpoint: quinn::Endpoint,
    session: RendezvousClient,
    local_addr: SocketAddr,
    protocol: String,
    config: PunchConfig,
}

impl QuicTransport {
    /// Binds an endpoint on `bind` and opens a Rendezvous session with the
    /// first reachable server of `rendezvous`.
    ///
    /// The protocol published on Rendezvous is `quic+<protocol>`.
    ///
    /// # Errors
    ///
    /// Returns [`NppError::Transport`] if the endpoint cannot be set up and
    /// the last [`NppError::Rendezvous`] failure if no server is reachable.
    pub async fn connect(
        bind: SocketAddr,
        rendezvous: &[SocketAddr],
        credentials: &TransportCredentials,
        protocol: &str,
        config: PunchConfig,
    ) -> NppResult<Self> {
        let endpoint = credentials.quic_endpoint(bind)?;
        let local_addr = endpoint.local_addr()?;
        let mut last = None;
        for &addr in rendezvous {
            match RendezvousClient::connect_quic(&endpoint, addr, credentials, ClientConfig::new()).await {
                Ok(session) => {
                    debug!(rendezvous = %addr, local = %local_addr, protocol, "quic punching transport ready");
                    return Ok(Self {
                        endpoint,
                        session,
                        local_addr,
                        protocol: format!("quic+{protocol}"),
                        config,
                    });
                }
                Err(e) => {
                    debug!(rendezvous = %addr, error = %e, "rendezvous unreachable over quic");
                    last = Some(e);
                }
            }
        }
        endpoint.close(0u32.into(), b"no rendezvous");
        Err(last.map_or_else(
            || NppError::Transport("no rendezvous servers configured".to_string()),
            NppError::from,
        ))
    }

    /// Local address of the endpoint.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl PunchTransport for QuicTransport {
    type Raw = quinn::Connection;

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn rendezvous(&self) -> &RendezvousClient {
        &self.session
    }

    fn private_addrs(&self) -> NppResult<Vec<Addr>> {
        Ok(local_private_addrs(PROTOCOL_UDP, self.local_addr)?)
    }

    async fn accept_raw(&self) -> NppResult<quinn::Connection> {
        let incoming = self.endpoint.accept().await.ok_or(NppError::Closed)?;
        let remote = incoming.remote_address();
        let connection = tokio::time::timeout(self.config.connect_timeout, incoming)
            .await
            .map_err(|_| NppError::Timeout(self.config.connect_timeout))??;
        debug!(peer = %remote, "inbound punching connection");
        Ok(connection)
    }

    async fn dial_raw(&self, addr: SocketAddr) -> NppResult<quinn::Connection> {
        let connecting = self.endpoint.connect(addr, QUIC_SERVER_NAME)?;
        let connection = tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| NppError::Timeout(self.config.connect_timeout))??;
        Ok(connection)
    }

    async fn select(raw: quinn::Connection) -> NppResult<NppConn> {
        let (mut send, recv) = raw.open_bi().await?;
        send.write_all(&[SELECTION_ACK]).await?;
        Ok(NppConn::quic(raw, send, recv))
    }

    async fn await_selection(raw: quinn::Connection) -> NppResult<NppConn> {
        let (send, mut recv) = raw.accept_bi().await?;
        let mut ack = [0u8; 1];
        recv.read_exact(&mut ack)
            .await
            .map_err(|e| NppError::Transport(e.to_string()))?;
        if ack[0] != SELECTION_ACK {
            return Err(NppError::Transport(format!("unexpected selection byte {:#04x}", ack[0])));
        }
        Ok(NppConn::quic(raw, send, recv))
    }
}

