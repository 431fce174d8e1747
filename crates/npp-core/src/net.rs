//! Socket helpers shared by punchers and relay clients.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Creates a TCP socket of the same family as `addr` that may share its
/// local address with other sockets of this process.
///
/// Punching relies on the Rendezvous session, the passive listener and
/// every active dial using one local port, so the NAT mapping observed by
/// Rendezvous is the one peers aim at.
pub fn reusable_tcp_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    Ok(socket)
}

/// Connects to `remote`, optionally from a fixed shared local address.
pub async fn connect_reusable(local: Option<SocketAddr>, remote: SocketAddr) -> io::Result<TcpStream> {
    let socket = reusable_tcp_socket(remote)?;
    if let Some(local) = local {
        socket.bind(local)?;
    }
    socket.connect(remote).await
}

/// Listens on a local address that is already used by an outgoing socket.
pub fn listen_reusable(local: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = reusable_tcp_socket(local)?;
    socket.bind(local)?;
    socket.listen(backlog)
}

/// Enables TCP keepalive probes on an established stream.
pub fn set_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle).with_interval(idle);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
