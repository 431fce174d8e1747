//! Discovery of the server's own externally visible IP address.
//!
//! When a matched peer is observed on a private address (server and peer
//! share a subnet), the reply carries the server's public IP instead, so a
//! peer on the other side of the NAT receives something it can dial.
//!
//! Discovery uses a STUN binding request (RFC 5389).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{RendezvousError, RendezvousResult};

/// Default STUN servers for public IP discovery.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun3.l.google.com:19302",
];

/// How long a discovered address is reused.
pub const PUBLIC_IP_TTL: Duration = Duration::from_secs(10 * 60);

const STUN_MAGIC_COOKIE: u32 = 0x2112_a442;
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

/// Where the server learns its public IP from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PublicIpSource {
    /// Ask STUN servers, first answer wins.
    Stun {
        /// `host:port` of each STUN server.
        servers: Vec<String>,
    },
    /// Use a fixed address.
    Static {
        /// The address to report.
        ip: IpAddr,
    },
    /// Never substitute; private addresses are passed through unchanged.
    Disabled,
}

impl Default for PublicIpSource {
    fn default() -> Self {
        Self::Stun {
            servers: DEFAULT_STUN_SERVERS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Cached public IP lookup.
#[derive(Debug)]
pub struct PublicIpResolver {
    source: PublicIpSource,
    timeout: Duration,
    ttl: Duration,
    cached: Mutex<Option<(IpAddr, Instant)>>,
}

impl PublicIpResolver {
    /// Creates a resolver for the given source.
    #[must_use]
    pub const fn new(source: PublicIpSource) -> Self {
        Self {
            source,
            timeout: Duration::from_secs(5),
            ttl: PUBLIC_IP_TTL,
            cached: Mutex::new(None),
        }
    }

    /// Sets the timeout of a single STUN query.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long a discovered address is reused.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the configured source.
    #[must_use]
    pub const fn source(&self) -> &PublicIpSource {
        &self.source
    }

    /// Returns the cached address if it is still fresh.
    pub fn cached_ip(&self) -> Option<IpAddr> {
        let cached = *self.cached.lock();
        cached
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(ip, _)| ip)
    }

    /// Returns the public IP, or `None` when substitution is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if no STUN server answered.
    pub async fn public_ip(&self) -> RendezvousResult<Option<IpAddr>> {
        match &self.source {
            PublicIpSource::Disabled => Ok(None),
            PublicIpSource::Static { ip } => Ok(Some(*ip)),
            PublicIpSource::Stun { servers } => {
                if let Some(ip) = self.cached_ip() {
                    return Ok(Some(ip));
                }
                let ip = self.query_any(servers).await?;
                *self.cached.lock() = Some((ip, Instant::now()));
                Ok(Some(ip))
            }
        }
    }

    async fn query_any(&self, servers: &[String]) -> RendezvousResult<IpAddr> {
        let mut last_error = String::from("no STUN servers configured");
        for server in servers {
            match tokio::time::timeout(self.timeout, query_stun_server(server)).await {
                Ok(Ok(addr)) => {
                    debug!(server = %server, addr = %addr, "public address discovered");
                    return Ok(addr.ip());
                }
                Ok(Err(e)) => {
                    warn!(server = %server, error = %e, "STUN query failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(server = %server, "STUN query timed out");
                    last_error = format!("{server}: timed out");
                }
            }
        }
        Err(RendezvousError::Io(std::io::Error::other(last_error)))
    }
}

/// Sends one binding request and returns the mapped address.
async fn query_stun_server(server: &str) -> RendezvousResult<SocketAddr> {
    let target = tokio::net::lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::other(format!("{server} did not resolve")))?;
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;

    let mut transaction = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction);
    socket.send_to(&binding_request(&transaction), target).await?;

    let mut buf = [0u8; 512];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if from != target {
            continue;
        }
        return parse_binding_response(&buf[..len], &transaction);
    }
}

fn binding_request(transaction: &[u8; 12]) -> [u8; HEADER_LEN] {
    let mut request = [0u8; HEADER_LEN];
    request[0..2].copy_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // Zero-length body: no attributes.
    request[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(transaction);
    request
}

fn stun_error(msg: impl Into<String>) -> RendezvousError {
    RendezvousError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        msg.into(),
    ))
}

fn parse_binding_response(response: &[u8], transaction: &[u8; 12]) -> RendezvousResult<SocketAddr> {
    if response.len() < HEADER_LEN {
        return Err(stun_error("STUN response too short"));
    }
    let message_type = u16::from_be_bytes([response[0], response[1]]);
    if message_type != STUN_BINDING_SUCCESS {
        return Err(stun_error(format!("unexpected STUN message type {message_type:#06x}")));
    }
    if response[4..8] != STUN_MAGIC_COOKIE.to_be_bytes() {
        return Err(stun_error("invalid STUN magic cookie"));
    }
    if response[8..20] != transaction[..] {
        return Err(stun_error("STUN transaction id mismatch"));
    }
    let body_len = u16::from_be_bytes([response[2], response[3]]) as usize;
    if response.len() < HEADER_LEN + body_len {
        return Err(stun_error("STUN response truncated"));
    }

    let body = &response[HEADER_LEN..HEADER_LEN + body_len];
    let mut offset = 0;
    let mut mapped = None;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let Some(value) = body.get(offset + 4..offset + 4 + attr_len) else {
            break;
        };
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_xor_mapped_address(value, transaction),
            ATTR_MAPPED_ADDRESS => mapped = Some(parse_mapped_address(value)?),
            _ => {}
        }
        // Attributes are padded to 4 bytes.
        offset += 4 + ((attr_len + 3) & !3);
    }
    mapped.ok_or_else(|| stun_error("no mapped address in STUN response"))
}

fn parse_xor_mapped_address(value: &[u8], transaction: &[u8; 12]) -> RendezvousResult<SocketAddr> {
    if value.len() < 8 {
        return Err(stun_error("XOR-MAPPED-ADDRESS too short"));
    }
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        0x01 => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ cookie[i];
            }
            Ok(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        0x02 if value.len() >= 20 => {
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&cookie);
            mask[4..].copy_from_slice(transaction);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        family => Err(stun_error(format!("unsupported address family {family}"))),
    }
}

fn parse_mapped_address(value: &[u8]) -> RendezvousResult<SocketAddr> {
    if value.len() < 8 {
        return Err(stun_error("MAPPED-ADDRESS too short"));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        0x01 => Ok(SocketAddr::new(
            Ipv4Addr::new(value[4], value[5], value[6], value[7]).into(),
            port,
        )),
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        family => Err(stun_error(format!("unsupported address family {family}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_mapped_response(transaction: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
        let port = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        match addr.ip() {
            IpAddr::V4(v4) => {
                value.extend(v4.octets().iter().zip(cookie.iter()).map(|(a, b)| a ^ b));
            }
            IpAddr::V6(_) => unreachable!("v4 only helper"),
        }

        let mut response = Vec::new();
        response.extend_from_slice(&STUN_BINDING_SUCCESS.to_be_bytes());
        response.extend_from_slice(&(4 + value.len() as u16).to_be_bytes());
        response.extend_from_slice(&cookie);
        response.extend_from_slice(transaction);
        response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        response.extend_from_slice(&(value.len() as u16).to_be_bytes());
        response.extend_from_slice(&value);
        response
    }

    // ===== Parsing =====

    #[test]
    fn parses_xor_mapped_ipv4() {
        let transaction = [7u8; 12];
        let addr: SocketAddr = "203.0.113.9:40000".parse().expect("addr");
        let response = xor_mapped_response(&transaction, addr);
        assert_eq!(
            parse_binding_response(&response, &transaction).expect("parse"),
            addr
        );
    }

    #[test]
    fn parses_legacy_mapped_address() {
        let transaction = [1u8; 12];
        let mut response = Vec::new();
        response.extend_from_slice(&STUN_BINDING_SUCCESS.to_be_bytes());
        response.extend_from_slice(&12u16.to_be_bytes());
        response.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&transaction);
        response.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        response.extend_from_slice(&8u16.to_be_bytes());
        response.extend_from_slice(&[0, 0x01, 0x1f, 0x90, 198, 51, 100, 7]);

        let addr = parse_binding_response(&response, &transaction).expect("parse");
        assert_eq!(addr, "198.51.100.7:8080".parse::<SocketAddr>().expect("addr"));
    }

    #[test]
    fn rejects_foreign_transaction() {
        let addr: SocketAddr = "203.0.113.9:40000".parse().expect("addr");
        let response = xor_mapped_response(&[7u8; 12], addr);
        assert!(parse_binding_response(&response, &[8u8; 12]).is_err());
    }

    #[test]
    fn rejects_short_response() {
        assert!(parse_binding_response(&[0x01, 0x01, 0, 0], &[0u8; 12]).is_err());
    }

    #[test]
    fn request_layout() {
        let transaction = [9u8; 12];
        let request = binding_request(&transaction);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xa4, 0x42]);
        assert_eq!(&request[8..], &transaction);
    }

    // ===== Sources =====

    #[tokio::test]
    async fn disabled_source_never_substitutes() {
        let resolver = PublicIpResolver::new(PublicIpSource::Disabled);
        assert_eq!(resolver.public_ip().await.expect("resolve"), None);
    }

    #[tokio::test]
    async fn static_source_is_returned_verbatim() {
        let ip: IpAddr = "203.0.113.1".parse().expect("ip");
        let resolver = PublicIpResolver::new(PublicIpSource::Static { ip });
        assert_eq!(resolver.public_ip().await.expect("resolve"), Some(ip));
    }

    #[tokio::test]
    async fn stun_answer_is_cached() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let server_addr = server.local_addr().expect("addr");
        let reported: SocketAddr = "203.0.113.77:1234".parse().expect("addr");
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.expect("recv");
            assert_eq!(len, HEADER_LEN);
            let mut transaction = [0u8; 12];
            transaction.copy_from_slice(&buf[8..20]);
            let response = xor_mapped_response(&transaction, reported);
            server.send_to(&response, from).await.expect("send");
        });

        let resolver = PublicIpResolver::new(PublicIpSource::Stun {
            servers: vec![server_addr.to_string()],
        })
        .with_timeout(Duration::from_secs(2));
        assert_eq!(resolver.cached_ip(), None);
        assert_eq!(resolver.public_ip().await.expect("resolve"), Some(reported.ip()));
        responder.await.expect("responder");

        // The responder is gone; a second lookup must come from the cache.
        assert_eq!(resolver.public_ip().await.expect("cached"), Some(reported.ip()));
    }

    #[tokio::test]
    async fn silent_stun_server_fails() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let resolver = PublicIpResolver::new(PublicIpSource::Stun {
            servers: vec![server.local_addr().expect("addr").to_string()],
        })
        .with_timeout(Duration::from_millis(100));
        assert!(resolver.public_ip().await.is_err());
    }

    #[test]
    fn source_config_round_trips_through_json() {
        let source = PublicIpSource::Static {
            ip: "203.0.113.1".parse().expect("ip"),
        };
        let json = serde_json::to_string(&source).expect("serialize");
        assert!(json.contains("\"kind\":\"static\""));
        let back: PublicIpSource = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, source);
    }
}
