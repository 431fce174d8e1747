//! # npp-relay
//!
//! Relay cluster of the NAT Punching Protocol: the last resort for peers
//! that cannot be punched.
//!
//! Relay nodes form a cluster through encrypted gossip. Every node keeps
//! the same consistent-hash [`Continuum`] of live members, so any node can
//! tell which one owns a wallet address. A SERVER peer registers under its
//! own address with the owning node, a CLIENT peer asks for that address,
//! and the node pipes bytes between the two sockets.
//!
//! ## Architecture
//!
//! ```text
//!                   DISCOVER(X)          ┌─────────────────────────────┐
//!  ┌──────────┐ ───────────────────────► │ relay A                     │
//!  │ client   │ ◄─── "B owns X" ──────── │ Continuum ◄── gossip ──┐    │
//!  └──────────┘                          └────────────────────────┼────┘
//!       │ CLIENT(X)                      ┌────────────────────────┼────┐
//!       └──────────────────────────────► │ relay B                ▼    │
//!  ┌──────────┐      SERVER(X, sign)     │ waiting hall ──► byte pipe  │
//!  │ server X │ ───────────────────────► │ monitor (Cluster/Info/...)  │
//!  └──────────┘                          └─────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use npp_core::WalletAddress;
//! use npp_relay::{RelayClientConfig, RelayDialer};
//!
//! # async fn run(target: WalletAddress) -> Result<(), npp_relay::RelayError> {
//! let dialer = RelayDialer::new(
//!     vec!["203.0.113.7:12240".parse().expect("addr")],
//!     RelayClientConfig::default(),
//! );
//! let stream = dialer.dial(target).await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod continuum;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod server;
pub mod state;

pub use client::{RelayDialer, RelayListener};
pub use cluster::{Member, Membership, MembershipEvents};
pub use config::{
    DEFAULT_GOSSIP_PORT, DEFAULT_PORT, GossipConfig, RelayClientConfig, RelayServerConfig,
    default_node_name,
};
pub use continuum::{Continuum, RingNode};
pub use error::{ProtocolErrorKind, RelayError, RelayResult};
pub use metrics::{NetCounters, RelayMetrics};
pub use monitor::{MonitorServer, RelayMonitorClient};
pub use server::{RelayServer, ShutdownHandle};
pub use state::{RelayNode, RelayState};
