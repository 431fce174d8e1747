//! # npp
//!
//! Peer connections through NATs: a TCP/QUIC puncher driven by a
//! Rendezvous server, with direct dialing first and a relay cluster last.
//!
//! A [`Listener`] accepts plain TCP connections and, in the background,
//! publishes its identity on Rendezvous and registers with relays. A
//! [`Dialer`] tries the peer's network address, then a QUIC punch, then a
//! TCP punch, then the relay. [`CachedDialer`] keeps established
//! connections for reuse.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────── Dialer ────────────────┐     ┌────────────── Listener ──────────────┐
//!  │ 1. direct TCP ─────────────────────────┼────►│ plain TcpListener (checked first)    │
//!  │ 2. QUIC PunchClient ──┐                │     │ QUIC PunchServer ◄──┐                │
//!  │ 3. TCP  PunchClient ──┼─► Rendezvous ◄─┼─────┼─ TCP  PunchServer ◄──┤ rebuilt with   │
//!  │ 4. RelayDialer ───────┼─► relay node ◄─┼─────┼─ RelayListener x N ◄─┘ backoff       │
//!  └───────────────────────┘                │     └──────────────────────────────────────┘
//!          CachedDialer: key → NppConn (refcounted, idle GC)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use npp::{DialTarget, Dialer, DialerConfig};
//! use npp_core::TransportCredentials;
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn run(credentials: TransportCredentials) -> Result<(), npp::NppError> {
//! let dialer = Dialer::new(
//!     DialerConfig::new()
//!         .with_rendezvous(vec!["203.0.113.5:14099".parse().expect("addr")])
//!         .with_quic(),
//!     credentials,
//! );
//! let target: DialTarget = "0x00112233445566778899aabbccddeeff00112233@198.51.100.2:9000".parse()?;
//! let mut conn = dialer.dial(&target).await?;
//! conn.write_all(b"ping").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
pub mod cache;
pub mod config;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod puncher;

pub use cache::{CachedConn, CachedDialer, CachedStream};
pub use config::{CacheConfig, DEFAULT_PROTOCOL, DialerConfig, ListenerConfig, PunchConfig};
pub use conn::{ConnSource, NppConn};
pub use dialer::{DialTarget, Dialer};
pub use error::{MultiError, NppError, NppResult};
pub use listener::Listener;
pub use metrics::{DialMetrics, DialStats, ListenerMetrics};
pub use puncher::{
    PunchClient, PunchServer, PunchTransport, QuicPunchClient, QuicPunchServer, QuicTransport,
    TcpPunchClient, TcpPunchServer, TcpTransport,
};
