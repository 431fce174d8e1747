//! Established peer connections.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// How a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnSource {
    /// Plain TCP to a routable address.
    Direct,
    /// TCP through a punched NAT.
    Punched,
    /// QUIC through a punched NAT.
    PunchedQuic,
    /// Forwarded by a relay node.
    Relayed,
}

impl fmt::Display for ConnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Direct => "direct",
            Self::Punched => "npp",
            Self::PunchedQuic => "npp-quic",
            Self::Relayed => "relay",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Quic {
        // Keeps the connection open for as long as the stream is in use.
        _connection: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    },
}

/// A byte stream to a peer, whichever way it was established.
///
/// QUIC connections expose a single bidirectional stream, the one the
/// dialing side opened to select the connection.
#[derive(Debug)]
pub struct NppConn {
    stream: Stream,
    source: ConnSource,
    remote_addr: SocketAddr,
}

impl NppConn {
    /// Wraps a TCP stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address of the stream is unavailable.
    pub fn tcp(stream: TcpStream, source: ConnSource) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            stream: Stream::Tcp(stream),
            source,
            remote_addr,
        })
    }

    /// Wraps a QUIC connection and its selected stream.
    pub fn quic(connection: quinn::Connection, send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        let remote_addr = connection.remote_address();
        Self {
            stream: Stream::Quic {
                _connection: connection,
                send,
                recv,
            },
            source: ConnSource::PunchedQuic,
            remote_addr,
        }
    }

    /// How the connection was established.
    pub const fn source(&self) -> ConnSource {
        self.source
    }

    /// Address of the other end as seen from here.
    ///
    /// For relayed connections this is the relay node.
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns true for QUIC connections.
    pub const fn is_quic(&self) -> bool {
        matches!(self.stream, Stream::Quic { .. })
    }
}

impl AsyncRead for NppConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(stream) => AsyncRead::poll_read(Pin::new(stream), cx, buf),
            Stream::Quic { recv, .. } => AsyncRead::poll_read(Pin::new(recv), cx, buf),
        }
    }
}

impl AsyncWrite for NppConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(stream) => AsyncWrite::poll_write(Pin::new(stream), cx, buf),
            Stream::Quic { send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(stream) => AsyncWrite::poll_flush(Pin::new(stream), cx),
            Stream::Quic { send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(stream) => AsyncWrite::poll_shutdown(Pin::new(stream), cx),
            Stream::Quic { send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn sources_render_like_log_fields() {
        assert_eq!(ConnSource::Direct.to_string(), "direct");
        assert_eq!(ConnSource::PunchedQuic.to_string(), "npp-quic");
        assert_eq!(ConnSource::Relayed.to_string(), "relay");
    }

    #[tokio::test]
    async fn tcp_conn_passes_bytes_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (accepted, _) = listener.accept().await.expect("accept");
        let mut conn = NppConn::tcp(dial.await.expect("join").expect("connect"), ConnSource::Direct).expect("conn");

        assert_eq!(conn.source(), ConnSource::Direct);
        assert_eq!(conn.remote_addr(), addr);
        assert!(!conn.is_quic());

        let mut accepted = accepted;
        conn.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        conn.shutdown().await.expect("shutdown");
        let mut rest = Vec::new();
        accepted.read_to_end(&mut rest).await.expect("eof");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn quic_conn_passes_bytes_both_ways() {
        use ed25519_dalek::SigningKey;
        use npp_core::{QUIC_SERVER_NAME, TransportCredentials};
        use rand::rngs::OsRng;

        let endpoint = |creds: TransportCredentials| {
            creds
                .quic_endpoint("127.0.0.1:0".parse().expect("addr"))
                .expect("endpoint")
        };
        let creds = || TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials");
        let server = endpoint(creds());
        let client = endpoint(creds());
        let server_addr = server.local_addr().expect("addr");

        let accepting = tokio::spawn(async move {
            let connection = server.accept().await.expect("incoming").await.expect("handshake");
            let (send, mut recv) = connection.accept_bi().await.expect("stream");
            let mut first = [0u8; 1];
            recv.read_exact(&mut first).await.expect("first byte");
            (server, NppConn::quic(connection, send, recv))
        });
        let connection = client
            .connect(server_addr, QUIC_SERVER_NAME)
            .expect("connect")
            .await
            .expect("handshake");
        let (mut send, recv) = connection.open_bi().await.expect("stream");
        send.write_all(&[1]).await.expect("first byte");
        let mut dialed = NppConn::quic(connection, send, recv);
        let (_server, mut accepted) = accepting.await.expect("join");

        assert!(dialed.is_quic());
        assert_eq!(dialed.source(), ConnSource::PunchedQuic);
        assert_eq!(dialed.remote_addr(), server_addr);

        dialed.write_all(b"ping").await.expect("write");
        dialed.flush().await.expect("flush");
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        accepted.write_all(b"pong").await.expect("write");
        dialed.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"pong");

        dialed.shutdown().await.expect("shutdown");
        let mut rest = Vec::new();
        accepted.read_to_end(&mut rest).await.expect("eof");
        assert!(rest.is_empty());
    }
}
