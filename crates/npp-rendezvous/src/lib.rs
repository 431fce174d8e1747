//! # npp-rendezvous
//!
//! Rendezvous service of the NAT Punching Protocol.
//!
//! A peer that accepts connections *publishes* itself; a peer that knows the
//! target's wallet address *resolves* it. The server pairs the two under a
//! [`npp_core::ResourceId`] and hands each side the other's observed public
//! address plus its self-reported private addresses, which the puncher then
//! races connection attempts against.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Publish(tcp)   ┌──────────────────┐  Resolve(tcp, X)  ┌──────────────┐
//! │  server X    │────────────────►│ RendezvousServer │◄──────────────────│   client     │
//! │              │◄────────────────│   MeetingRoom    │──────────────────►│              │
//! └──────────────┘ client's addrs  └──────────────────┘  server's addrs   └──────────────┘
//! ```
//!
//! Sessions are authenticated (see [`npp_core::auth`]) and carry
//! multiplexed calls over TCP or QUIC; dropping a call future on the client
//! cancels the call on the server.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use npp_core::TransportCredentials;
//! use npp_rendezvous::{RendezvousServer, ServerConfig};
//!
//! # async fn run(credentials: TransportCredentials) -> Result<(), npp_rendezvous::RendezvousError> {
//! let config = ServerConfig::new("0.0.0.0:14099".parse().expect("addr")).with_quic();
//! let server = RendezvousServer::bind(config, &credentials).await?;
//! server.serve().await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod resolver;
pub mod server;
pub mod service;
mod session;

pub use client::RendezvousClient;
pub use config::{ClientConfig, DEFAULT_PORT, ServerConfig};
pub use error::{RendezvousError, RendezvousResult};
pub use resolver::{DEFAULT_STUN_SERVERS, PublicIpResolver, PublicIpSource};
pub use server::{RendezvousServer, ShutdownHandle};
pub use service::{CallContext, PeerInfo, RendezvousService};
