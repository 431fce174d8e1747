//! Protobuf messages exchanged between peers, Rendezvous and Relay.
//!
//! Messages are plain `prost` structs; every frame on the wire carries
//! exactly one of them behind a 16-bit big-endian length prefix (see
//! [`crate::codec`]).

use std::collections::HashMap;

use prost::{Message, Oneof};

// ============ Addresses ============

/// Host/port pair.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct SocketAddr {
    /// IP address in textual form.
    #[prost(string, tag = "1")]
    pub addr: String,
    /// Port number.
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

/// Endpoint together with the protocol it speaks.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Addr {
    /// Transport protocol, e.g. `tcp` or `udp`.
    #[prost(string, tag = "1")]
    pub protocol: String,
    /// Endpoint.
    #[prost(message, optional, tag = "2")]
    pub addr: Option<SocketAddr>,
}

/// Message without payload.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Empty {}

/// Generic RPC failure carried inside response envelopes.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct RpcError {
    /// Machine-readable error code.
    #[prost(int32, tag = "1")]
    pub code: i32,
    /// Human-readable description.
    #[prost(string, tag = "2")]
    pub message: String,
}

// ============ Session Authentication ============

/// Random challenge sent by the server right after the transport opens.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct AuthChallenge {
    /// 32 random bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
}

/// Client's answer to an [`AuthChallenge`].
#[derive(Clone, PartialEq, Eq, Message)]
pub struct AuthProof {
    /// Ed25519 public key of the client.
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    /// Signature over the challenge digest.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// Outcome of the authentication exchange.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct AuthResult {
    /// Whether the proof was accepted.
    #[prost(bool, tag = "1")]
    pub ok: bool,
    /// Wallet address the server bound to this session.
    #[prost(bytes = "vec", tag = "2")]
    pub addr: Vec<u8>,
    /// Failure reason when `ok` is false.
    #[prost(string, tag = "3")]
    pub message: String,
}

// ============ Rendezvous ============

/// Resolve call: a client looking for a published server.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ConnectRequest {
    /// Wallet address of the target.
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    /// Application protocol.
    #[prost(string, tag = "2")]
    pub protocol: String,
    /// Caller's own private endpoints.
    #[prost(message, repeated, tag = "3")]
    pub private_addrs: Vec<Addr>,
}

/// Publish call: a server announcing it accepts connections.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct PublishRequest {
    /// Application protocol.
    #[prost(string, tag = "1")]
    pub protocol: String,
    /// Caller's own private endpoints.
    #[prost(message, repeated, tag = "2")]
    pub private_addrs: Vec<Addr>,
}

/// Candidate endpoints of the matched peer.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct RendezvousReply {
    /// Public endpoint as observed by the Rendezvous server.
    #[prost(message, optional, tag = "1")]
    pub public_addr: Option<Addr>,
    /// Private endpoints as reported by the peer itself.
    #[prost(message, repeated, tag = "2")]
    pub private_addrs: Vec<Addr>,
}

/// ResolveAll call argument.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ResolveAllRequest {
    /// Hex wallet address.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// ResolveAll result: handles of every waiting server.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ResolveMetaReply {
    /// Peer handles.
    #[prost(string, repeated, tag = "1")]
    pub ids: Vec<String>,
}

/// Waiting room snapshot for one resource.
#[derive(Clone, PartialEq, Message)]
pub struct RendezvousMeeting {
    /// Waiting clients by peer handle.
    #[prost(map = "string, message", tag = "1")]
    pub clients: HashMap<String, RendezvousReply>,
    /// Waiting servers by peer handle.
    #[prost(map = "string, message", tag = "2")]
    pub servers: HashMap<String, RendezvousReply>,
}

/// Full Rendezvous state dump.
#[derive(Clone, PartialEq, Message)]
pub struct RendezvousState {
    /// Meetings keyed by resource identifier.
    #[prost(map = "string, message", tag = "1")]
    pub state: HashMap<String, RendezvousMeeting>,
}

/// Multiplexed Rendezvous request envelope.
#[derive(Clone, PartialEq, Message)]
pub struct RendezvousRequest {
    /// Caller-chosen call identifier, echoed in the response.
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    /// The call itself.
    #[prost(oneof = "rendezvous_request::Call", tags = "2, 3, 4, 5, 6")]
    pub call: Option<rendezvous_request::Call>,
}

/// Nested types for [`RendezvousRequest`].
pub mod rendezvous_request {
    use super::Oneof;

    /// Rendezvous call variants.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Call {
        /// Resolve a published server.
        #[prost(message, tag = "2")]
        Resolve(super::ConnectRequest),
        /// Publish the caller as a server.
        #[prost(message, tag = "3")]
        Publish(super::PublishRequest),
        /// List waiting servers for an address.
        #[prost(message, tag = "4")]
        ResolveAll(super::ResolveAllRequest),
        /// Dump the waiting-room state.
        #[prost(message, tag = "5")]
        Info(super::Empty),
        /// Abort the call with the same identifier.
        #[prost(message, tag = "6")]
        Cancel(super::Empty),
    }
}

/// Multiplexed Rendezvous response envelope.
#[derive(Clone, PartialEq, Message)]
pub struct RendezvousResponse {
    /// Identifier of the call this answers.
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    /// Result.
    #[prost(oneof = "rendezvous_response::Result", tags = "2, 3, 4, 5")]
    pub result: Option<rendezvous_response::Result>,
}

/// Nested types for [`RendezvousResponse`].
pub mod rendezvous_response {
    use super::Oneof;

    /// Rendezvous result variants.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Result {
        /// Resolve/Publish result.
        #[prost(message, tag = "2")]
        Reply(super::RendezvousReply),
        /// ResolveAll result.
        #[prost(message, tag = "3")]
        ResolveAll(super::ResolveMetaReply),
        /// Info result.
        #[prost(message, tag = "4")]
        Info(super::RendezvousState),
        /// Call failure.
        #[prost(message, tag = "5")]
        Error(super::RpcError),
    }
}

// ============ Relay ============

/// Role announced in a relay handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PeerType {
    /// Publishes itself and waits for a client.
    Server = 0,
    /// Connects to a published server.
    Client = 1,
    /// Asks which cluster node owns an address.
    Discover = 2,
}

/// First frame on every relay connection.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct HandshakeRequest {
    /// Role of the connecting peer.
    #[prost(enumeration = "PeerType", tag = "1")]
    pub peer_type: i32,
    /// Wallet address the meeting is keyed by.
    #[prost(bytes = "vec", tag = "2")]
    pub addr: Vec<u8>,
    /// Self-signature over `addr`, required for servers.
    #[prost(bytes = "vec", tag = "3")]
    pub sign: Vec<u8>,
    /// Optional server instance a client wants to be pinned to.
    #[prost(string, tag = "4")]
    pub uuid: String,
    /// Application protocol, informational.
    #[prost(string, tag = "5")]
    pub protocol: String,
}

/// Relay handshake outcome; `error == 0` means success.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct HandshakeResponse {
    /// Protocol error code.
    #[prost(int32, tag = "1")]
    pub error: i32,
    /// Human-readable description.
    #[prost(string, tag = "2")]
    pub description: String,
}

/// Redirect answer to a discover handshake.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct DiscoverResponse {
    /// Relay endpoint owning the requested address.
    #[prost(string, tag = "1")]
    pub addr: String,
    /// Protocol error code, zero when `addr` is set.
    #[prost(int32, tag = "2")]
    pub error: i32,
    /// Human-readable description of a failure.
    #[prost(string, tag = "3")]
    pub description: String,
}

/// Cluster membership listing.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct RelayClusterReply {
    /// Member descriptions.
    #[prost(string, repeated, tag = "1")]
    pub members: Vec<String>,
}

/// Servers waiting for one address.
#[derive(Clone, PartialEq, Message)]
pub struct RelayMeeting {
    /// Remote endpoints keyed by connection id.
    #[prost(map = "string, message", tag = "1")]
    pub servers: HashMap<String, Addr>,
}

/// Relay waiting-room dump.
#[derive(Clone, PartialEq, Message)]
pub struct RelayInfo {
    /// Meetings keyed by wallet address.
    #[prost(map = "string, message", tag = "1")]
    pub state: HashMap<String, RelayMeeting>,
}

/// Traffic counters for one address.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct NetMetrics {
    /// Bytes forwarded server to client.
    #[prost(uint64, tag = "1")]
    pub tx_bytes: u64,
    /// Bytes forwarded client to server.
    #[prost(uint64, tag = "2")]
    pub rx_bytes: u64,
}

/// Relay node metrics.
#[derive(Clone, PartialEq, Message)]
pub struct RelayMetrics {
    /// Connections currently being served.
    #[prost(uint64, tag = "1")]
    pub conn_current: u64,
    /// Traffic counters keyed by wallet address.
    #[prost(map = "string, message", tag = "2")]
    pub net: HashMap<String, NetMetrics>,
    /// Seconds since the node started.
    #[prost(uint64, tag = "3")]
    pub uptime_secs: u64,
}

/// Monitoring request envelope.
#[derive(Clone, PartialEq, Message)]
pub struct MonitorRequest {
    /// The call.
    #[prost(oneof = "monitor_request::Call", tags = "1, 2, 3")]
    pub call: Option<monitor_request::Call>,
}

/// Nested types for [`MonitorRequest`].
pub mod monitor_request {
    use super::Oneof;

    /// Monitoring calls.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Call {
        /// Cluster membership.
        #[prost(message, tag = "1")]
        Cluster(super::Empty),
        /// Waiting-room dump.
        #[prost(message, tag = "2")]
        Info(super::Empty),
        /// Traffic metrics.
        #[prost(message, tag = "3")]
        Metrics(super::Empty),
    }
}

/// Monitoring response envelope.
#[derive(Clone, PartialEq, Message)]
pub struct MonitorResponse {
    /// The result.
    #[prost(oneof = "monitor_response::Result", tags = "1, 2, 3, 4")]
    pub result: Option<monitor_response::Result>,
}

/// Nested types for [`MonitorResponse`].
pub mod monitor_response {
    use super::Oneof;

    /// Monitoring results.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Result {
        /// Cluster membership.
        #[prost(message, tag = "1")]
        Cluster(super::RelayClusterReply),
        /// Waiting-room dump.
        #[prost(message, tag = "2")]
        Info(super::RelayInfo),
        /// Traffic metrics.
        #[prost(message, tag = "3")]
        Metrics(super::RelayMetrics),
        /// Call failure.
        #[prost(message, tag = "4")]
        Error(super::RpcError),
    }
}
