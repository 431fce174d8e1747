//! TLS over TCP for authenticated sessions.
//!
//! Both ends complete the handshake and export the [`ChannelBinding`] the
//! session proof in [`crate::auth`] is signed over.

use std::fmt;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::auth::ChannelBinding;
use crate::credentials::{QUIC_SERVER_NAME, TransportCredentials};
use crate::error::{ProtoError, ProtoResult};

/// Client end of a TLS session over TCP.
pub type ClientStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Server end of a TLS session over TCP.
pub type ServerStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Accepts TLS sessions presenting the certificate of one identity.
#[derive(Clone)]
pub struct Acceptor(TlsAcceptor);

impl Acceptor {
    /// Builds an acceptor from `credentials`.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects the certificate or key.
    pub fn new(credentials: &TransportCredentials) -> ProtoResult<Self> {
        Ok(Self(TlsAcceptor::from(credentials.tls_server_config()?)))
    }

    /// Runs the server handshake over `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or no binding can be exported.
    pub async fn accept(&self, stream: TcpStream) -> ProtoResult<(ServerStream, ChannelBinding)> {
        let stream = self.0.accept(stream).await?;
        let binding = ChannelBinding::from_tls_server(stream.get_ref().1)?;
        Ok((stream, binding))
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor").finish_non_exhaustive()
    }
}

/// Runs the client handshake over `stream`.
///
/// # Errors
///
/// Returns an error if the handshake fails or no binding can be exported.
pub async fn connect(
    credentials: &TransportCredentials,
    stream: TcpStream,
) -> ProtoResult<(ClientStream, ChannelBinding)> {
    let connector = TlsConnector::from(credentials.tls_client_config()?);
    let name = ServerName::try_from(QUIC_SERVER_NAME).map_err(|e| ProtoError::Tls(e.to_string()))?;
    let stream = connector.connect(name, stream).await?;
    let binding = ChannelBinding::from_tls_client(stream.get_ref().1)?;
    Ok((stream, binding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn credentials() -> TransportCredentials {
        TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials")
    }

    type Ends = ((ServerStream, ChannelBinding), (ClientStream, ChannelBinding));

    async fn pair(server: &TransportCredentials, client: &TransportCredentials) -> Ends {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let acceptor = Acceptor::new(server).expect("acceptor");
        let accepting = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            acceptor.accept(stream).await.expect("server handshake")
        });
        let stream = TcpStream::connect(addr).await.expect("connect");
        let client = connect(client, stream).await.expect("client handshake");
        (accepting.await.expect("join"), client)
    }

    #[tokio::test]
    async fn both_ends_export_the_same_binding() {
        let ((mut server, server_binding), (mut client, client_binding)) =
            pair(&credentials(), &credentials()).await;
        assert_eq!(server_binding, client_binding);

        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn separate_sessions_export_different_bindings() {
        let server = credentials();
        let client = credentials();
        let ((_, first), _) = pair(&server, &client).await;
        let ((_, second), _) = pair(&server, &client).await;
        assert_ne!(first, second);
    }
}
