//! Candidate endpoints and their public/private classification.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::ProtoError;
use crate::wire;

/// Transport protocol tag for TCP endpoints.
pub const PROTOCOL_TCP: &str = "tcp";

/// Transport protocol tag for UDP (QUIC) endpoints.
pub const PROTOCOL_UDP: &str = "udp";

/// An endpoint together with the transport protocol it speaks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    /// Transport protocol.
    pub protocol: String,
    /// Endpoint.
    pub socket: SocketAddr,
}

impl Addr {
    /// Creates a new address.
    #[must_use]
    pub fn new(protocol: impl Into<String>, socket: SocketAddr) -> Self {
        Self {
            protocol: protocol.into(),
            socket,
        }
    }

    /// Creates a TCP address.
    #[must_use]
    pub fn tcp(socket: SocketAddr) -> Self {
        Self::new(PROTOCOL_TCP, socket)
    }

    /// Creates a UDP address.
    #[must_use]
    pub fn udp(socket: SocketAddr) -> Self {
        Self::new(PROTOCOL_UDP, socket)
    }

    /// Returns true if the endpoint is not globally routable.
    #[must_use]
    pub fn is_private(&self) -> bool {
        is_private_ip(self.socket.ip())
    }

    /// Converts into the wire representation.
    #[must_use]
    pub fn to_wire(&self) -> wire::Addr {
        wire::Addr {
            protocol: self.protocol.clone(),
            addr: Some(wire::SocketAddr {
                addr: self.socket.ip().to_string(),
                port: u32::from(self.socket.port()),
            }),
        }
    }

    /// Parses the wire representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is missing or malformed.
    pub fn from_wire(addr: &wire::Addr) -> Result<Self, ProtoError> {
        let endpoint = addr
            .addr
            .as_ref()
            .ok_or_else(|| ProtoError::InvalidAddress("address without endpoint".to_string()))?;
        let ip: IpAddr = endpoint.addr.parse().map_err(|e| {
            ProtoError::InvalidAddress(format!("invalid ip '{}': {e}", endpoint.addr))
        })?;
        let port = u16::try_from(endpoint.port)
            .map_err(|_| ProtoError::InvalidAddress(format!("invalid port {}", endpoint.port)))?;
        Ok(Self::new(addr.protocol.clone(), SocketAddr::new(ip, port)))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.socket)
    }
}

/// Returns true for addresses that are only reachable inside a private
/// network: RFC 1918 ranges, loopback, link-local and IPv6 unique-local.
#[must_use]
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Collects this host's private interface addresses paired with `port`.
///
/// Only addresses of the same IP family as `family_of` are returned, so a
/// peer never receives candidates it cannot dial from its bound socket.
///
/// # Errors
///
/// Returns an error if the interface list cannot be read.
pub fn local_private_addrs(
    protocol: &str,
    family_of: SocketAddr,
) -> Result<Vec<Addr>, ProtoError> {
    let interfaces = get_if_addrs::get_if_addrs()?;
    let mut addrs: Vec<Addr> = Vec::new();
    for ip in interfaces.iter().map(get_if_addrs::Interface::ip) {
        if ip.is_ipv4() != family_of.is_ipv4() || !is_private_ip(ip) {
            continue;
        }
        let addr = Addr::new(protocol, SocketAddr::new(ip, family_of.port()));
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

/// Resolved endpoints of a matched peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    /// Endpoint observed by the Rendezvous server.
    pub public: Option<Addr>,
    /// Endpoints reported by the peer itself.
    pub private: Vec<Addr>,
}

impl Candidates {
    /// Builds candidates from a Rendezvous reply, skipping malformed entries.
    #[must_use]
    pub fn from_reply(reply: &wire::RendezvousReply) -> Self {
        Self {
            public: reply
                .public_addr
                .as_ref()
                .and_then(|addr| Addr::from_wire(addr).ok()),
            private: reply
                .private_addrs
                .iter()
                .filter_map(|addr| Addr::from_wire(addr).ok())
                .collect(),
        }
    }

    /// Returns true if there is nothing to dial.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.public.is_none() && self.private.is_empty()
    }

    /// All distinct endpoints, public first.
    #[must_use]
    pub fn sockets(&self) -> Vec<SocketAddr> {
        let mut sockets = Vec::with_capacity(1 + self.private.len());
        for addr in self.public.iter().chain(self.private.iter()) {
            if !sockets.contains(&addr.socket) {
                sockets.push(addr.socket);
            }
        }
        sockets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // ===== Private classification =====

    #[test_case("10.1.2.3", true ; "rfc1918 10/8")]
    #[test_case("172.16.0.1", true ; "rfc1918 172.16/12")]
    #[test_case("172.31.255.255", true ; "rfc1918 172.16/12 upper")]
    #[test_case("172.32.0.1", false ; "outside 172.16/12")]
    #[test_case("192.168.1.1", true ; "rfc1918 192.168/16")]
    #[test_case("127.0.0.1", true ; "loopback")]
    #[test_case("169.254.10.10", true ; "link local")]
    #[test_case("8.8.8.8", false ; "public v4")]
    #[test_case("::1", true ; "v6 loopback")]
    #[test_case("fd00::1", true ; "v6 unique local")]
    #[test_case("fe80::1", true ; "v6 link local")]
    #[test_case("2001:4860:4860::8888", false ; "public v6")]
    #[test_case("::ffff:192.168.0.1", true ; "v4 mapped private")]
    fn classifies_ip(ip: &str, expected: bool) {
        let ip: IpAddr = ip.parse().expect("ip");
        assert_eq!(is_private_ip(ip), expected);
    }

    // ===== Wire conversion =====

    #[test]
    fn addr_wire_conversion_preserves_fields() {
        let addr = Addr::tcp("192.168.0.10:4242".parse().expect("socket"));
        let wire = addr.to_wire();
        assert_eq!(wire.protocol, "tcp");
        assert_eq!(Addr::from_wire(&wire).expect("parse"), addr);
    }

    #[test]
    fn addr_from_wire_rejects_missing_endpoint() {
        let wire = wire::Addr {
            protocol: "tcp".to_string(),
            addr: None,
        };
        assert!(Addr::from_wire(&wire).is_err());
    }

    #[test]
    fn addr_from_wire_rejects_bad_port() {
        let wire = wire::Addr {
            protocol: "tcp".to_string(),
            addr: Some(wire::SocketAddr {
                addr: "1.2.3.4".to_string(),
                port: 70_000,
            }),
        };
        assert!(Addr::from_wire(&wire).is_err());
    }

    // ===== Candidates =====

    #[test]
    fn candidates_put_public_first_and_dedup() {
        let public = Addr::tcp("1.2.3.4:10".parse().expect("socket"));
        let private = Addr::tcp("10.0.0.1:10".parse().expect("socket"));
        let reply = wire::RendezvousReply {
            public_addr: Some(public.to_wire()),
            private_addrs: vec![private.to_wire(), public.to_wire()],
        };
        let candidates = Candidates::from_reply(&reply);
        assert_eq!(candidates.sockets(), vec![public.socket, private.socket]);
    }

    #[test]
    fn empty_reply_gives_empty_candidates() {
        let candidates = Candidates::from_reply(&wire::RendezvousReply::default());
        assert!(candidates.is_empty());
        assert!(candidates.sockets().is_empty());
    }

    #[test]
    fn local_private_addrs_match_family_and_port() {
        let bound: SocketAddr = "127.0.0.1:5555".parse().expect("socket");
        let addrs = local_private_addrs(PROTOCOL_TCP, bound).expect("interfaces");
        assert!(addrs.iter().all(|a| a.socket.is_ipv4() && a.socket.port() == 5555));
        assert!(addrs.iter().all(Addr::is_private));
    }
}
