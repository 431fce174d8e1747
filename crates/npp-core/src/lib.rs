//! # npp-core
//!
//! Shared building blocks of the NAT Punching Protocol.
//!
//! This crate provides:
//!
//! - Identifiers: [`WalletAddress`], [`ResourceId`], [`PeerId`]
//! - Candidate endpoints with public/private classification ([`Addr`], [`Candidates`])
//! - Protobuf wire messages ([`wire`]) and 16-bit length-prefixed framing ([`codec`])
//! - [`TransportCredentials`] binding QUIC and TLS configurations to a wallet address
//! - Channel-bound challenge-response session authentication ([`auth`])
//! - TLS over TCP for authenticated sessions ([`tls`])
//! - Generic publisher/resolver waiting rooms ([`MeetingRoom`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod addr;
pub mod auth;
pub mod codec;
pub mod credentials;
pub mod error;
pub mod id;
pub mod net;
pub mod room;
pub mod tls;
pub mod wire;

pub use addr::{Addr, Candidates, PROTOCOL_TCP, PROTOCOL_UDP, is_private_ip, local_private_addrs};
pub use credentials::{QUIC_SERVER_NAME, TransportCredentials, verify_address_signature};
pub use error::{ProtoError, ProtoResult};
pub use id::{PeerId, ResourceId, WalletAddress};
pub use room::{Meeting, MeetingRoom, Registration, Role, RoomGuard};
