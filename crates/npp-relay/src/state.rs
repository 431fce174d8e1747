//! State shared by every connection of a relay node.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use npp_core::wire;
use npp_core::{Addr, MeetingRoom, PeerId, Role, WalletAddress};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cluster::{Member, MembershipEvents};
use crate::continuum::{Continuum, RingNode};
use crate::metrics::{ConnectionGuard, RelayMetrics};

/// A relay node as placed on the continuum.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayNode {
    /// Unique cluster member name.
    pub name: String,
    /// Address peers connect to for relaying.
    pub addr: SocketAddr,
}

impl RelayNode {
    /// Derives the relay node announced by a cluster member.
    ///
    /// The member's metadata carries its relay address; an unspecified IP
    /// is replaced with the IP the member gossips from.
    pub fn from_member(member: &Member) -> Option<Self> {
        let mut addr: SocketAddr = member.meta.parse().ok()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(member.addr.ip());
        }
        Some(Self {
            name: member.name.clone(),
            addr,
        })
    }
}

impl RingNode for RelayNode {
    fn label(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RelayNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// One side of a relayed connection.
#[derive(Debug)]
pub(crate) struct Leg {
    pub(crate) stream: TcpStream,
    pub(crate) remote: SocketAddr,
    pub(crate) _guard: ConnectionGuard,
}

/// What a parked peer is woken up with.
#[derive(Debug)]
pub(crate) enum Signal {
    /// The opposite side arrived and handed over its connection.
    Matched(Leg),
    /// The address is owned by another node now.
    Discard,
}

/// A parked peer.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) remote: SocketAddr,
    /// SERVER instance a CLIENT insists on.
    pub(crate) pin: Option<PeerId>,
    pub(crate) tx: oneshot::Sender<Signal>,
}

/// Cluster view, waiting hall and counters of one relay node.
#[derive(Debug)]
pub struct RelayState {
    node: RelayNode,
    continuum: Continuum<WalletAddress, RelayNode>,
    hall: Arc<MeetingRoom<WalletAddress, Waiter>>,
    metrics: Arc<RelayMetrics>,
}

impl RelayState {
    /// Creates the state of `node` with an empty continuum.
    #[must_use]
    pub fn new(node: RelayNode) -> Self {
        Self {
            node,
            continuum: Continuum::new(),
            hall: Arc::new(MeetingRoom::new()),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    /// The local node.
    pub const fn node(&self) -> &RelayNode {
        &self.node
    }

    /// Address-to-node assignment.
    pub const fn continuum(&self) -> &Continuum<WalletAddress, RelayNode> {
        &self.continuum
    }

    /// Node counters.
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub(crate) fn hall(&self) -> &Arc<MeetingRoom<WalletAddress, Waiter>> {
        &self.hall
    }

    /// Returns true if the local node owns `addr`.
    pub fn owns(&self, addr: &WalletAddress) -> bool {
        self.continuum
            .get(addr)
            .is_some_and(|owner| owner.name == self.node.name)
    }

    /// Number of addresses with parked peers.
    pub fn waiting(&self) -> usize {
        self.hall.len()
    }

    /// Parked SERVER peers by address.
    pub fn info(&self) -> wire::RelayInfo {
        let room = self.hall.lock();
        let state = room
            .iter()
            .filter(|(_, meeting)| !meeting.side(Role::Server).is_empty())
            .map(|(addr, meeting)| {
                let servers = meeting
                    .side(Role::Server)
                    .iter()
                    .map(|(id, waiter)| (id.to_string(), Addr::tcp(waiter.remote).to_wire()))
                    .collect();
                (addr.to_string(), wire::RelayMeeting { servers })
            })
            .collect();
        wire::RelayInfo { state }
    }

    /// Tells every peer parked under `addrs` to go elsewhere.
    fn discard(&self, addrs: Vec<WalletAddress>) {
        for addr in addrs {
            if self.owns(&addr) {
                continue;
            }
            let meeting = self.hall.lock().take(&addr);
            let Some(meeting) = meeting else {
                continue;
            };
            let mut count = 0usize;
            for (_, _, waiter) in meeting.into_waiters() {
                count += 1;
                let _ = waiter.tx.send(Signal::Discard);
            }
            debug!(addr = %addr, count, "Discarded waiters of a reassigned address");
        }
    }
}

impl MembershipEvents for RelayState {
    fn on_join(&self, member: &Member) {
        let Some(node) = RelayNode::from_member(member) else {
            warn!(member = %member, meta = %member.meta, "Ignoring member with malformed relay address");
            return;
        };
        info!(node = %node, "Node joined the continuum");
        let moved = self.continuum.add(node, 1);
        self.discard(moved);
    }

    fn on_leave(&self, member: &Member) {
        info!(member = %member, "Node left the continuum");
        let moved = self.continuum.remove(&member.name);
        self.discard(moved);
    }
}
