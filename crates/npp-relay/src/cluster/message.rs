//! Gossip messages exchanged between cluster members.

use prost::{Message, Oneof};

/// One row of a member table.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct MemberState {
    /// Unique member name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Gossip address of the member.
    #[prost(string, tag = "2")]
    pub addr: String,
    /// Opaque application metadata.
    #[prost(string, tag = "3")]
    pub meta: String,
    /// Last heartbeat counter known for the member.
    #[prost(uint64, tag = "4")]
    pub heartbeat: u64,
}

/// A member's view of the cluster, pushed every gossip interval.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Push {
    /// Name of the sender.
    #[prost(string, tag = "1")]
    pub from: String,
    /// Sender's row followed by every live member it knows.
    #[prost(message, repeated, tag = "2")]
    pub members: Vec<MemberState>,
}

/// Sent by a member that shuts down gracefully.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Leave {
    /// Name of the leaving member.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Its final heartbeat counter.
    #[prost(uint64, tag = "2")]
    pub heartbeat: u64,
}

/// Envelope of every gossip datagram.
#[derive(Clone, PartialEq, Message)]
pub struct GossipMessage {
    /// The payload.
    #[prost(oneof = "gossip_message::Kind", tags = "1, 2")]
    pub kind: Option<gossip_message::Kind>,
}

/// Nested types for [`GossipMessage`].
pub mod gossip_message {
    use super::Oneof;

    /// Gossip payloads.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Kind {
        /// Member table push.
        #[prost(message, tag = "1")]
        Push(super::Push),
        /// Graceful departure.
        #[prost(message, tag = "2")]
        Leave(super::Leave),
    }
}
