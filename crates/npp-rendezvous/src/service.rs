//! The Rendezvous matching service.
//!
//! A publisher (server) and a resolver (client) meet under a
//! [`ResourceId`]. Whoever arrives second is matched immediately against a
//! random waiter of the opposite role; whoever arrives first parks in the
//! waiting room until matched or cancelled. Each side receives the other's
//! observed public address and self-reported private addresses.

use std::net::SocketAddr;
use std::sync::Arc;

use npp_core::wire::{
    self, ConnectRequest, PublishRequest, RendezvousMeeting, RendezvousReply, RendezvousState,
    ResolveAllRequest, ResolveMetaReply,
};
use npp_core::{Addr, MeetingRoom, PeerId, Registration, ResourceId, Role, WalletAddress};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{RendezvousError, RendezvousResult};
use crate::resolver::PublicIpResolver;

/// What the transport knows about the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Observed remote address.
    pub remote: SocketAddr,
    /// Transport protocol the caller arrived on (`tcp` or `udp`).
    pub protocol: String,
    /// Identity proven during session authentication.
    pub wallet: Option<WalletAddress>,
}

/// Per-call context handed to every service method.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Transport information, absent if the transport exposes none.
    pub peer: Option<PeerInfo>,
}

impl CallContext {
    /// Context for an authenticated caller.
    #[must_use]
    pub fn authenticated(remote: SocketAddr, protocol: &str, wallet: WalletAddress) -> Self {
        Self {
            peer: Some(PeerInfo {
                remote,
                protocol: protocol.to_string(),
                wallet: Some(wallet),
            }),
        }
    }
}

/// Endpoints of one waiting party.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerHandle {
    public: Addr,
    private: Vec<wire::Addr>,
}

impl PeerHandle {
    fn new(info: &PeerInfo, private: Vec<wire::Addr>) -> Self {
        Self {
            public: Addr::new(info.protocol.clone(), info.remote),
            private,
        }
    }
}

/// A parked call waiting for its counterpart.
#[derive(Debug)]
struct Waiter {
    peer: PeerHandle,
    tx: oneshot::Sender<PeerHandle>,
}

/// Matches publishers with resolvers.
#[derive(Debug)]
pub struct RendezvousService {
    room: Arc<MeetingRoom<ResourceId, Waiter>>,
    resolver: PublicIpResolver,
}

impl RendezvousService {
    /// Creates a service that substitutes private addresses using `resolver`.
    #[must_use]
    pub fn new(resolver: PublicIpResolver) -> Self {
        Self {
            room: Arc::new(MeetingRoom::new()),
            resolver,
        }
    }

    /// Number of resource ids that currently have at least one waiter.
    pub fn waiting(&self) -> usize {
        self.room.len()
    }

    /// Resolves a published server, waiting for one if none is parked.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::NoPeerInfo`] if the transport exposed no
    /// caller address, or an error if the target id is malformed.
    pub async fn resolve(
        &self,
        ctx: &CallContext,
        request: ConnectRequest,
    ) -> RendezvousResult<RendezvousReply> {
        let info = ctx.peer.as_ref().ok_or(RendezvousError::NoPeerInfo)?;
        let id = ResourceId::new(request.protocol, WalletAddress::from_slice(&request.id)?);
        info!(id = %id, remote = %info.remote, "resolving remote peer");

        let server = self
            .meet(id.clone(), Role::Client, PeerHandle::new(info, request.private_addrs))
            .await?;
        info!(
            id = %id,
            public_addr = %server.public,
            private_addrs = server.private.len(),
            "providing remote server endpoint(s)"
        );
        Ok(self.reply_for(&server).await)
    }

    /// Publishes the caller as a server and waits for a resolver.
    ///
    /// The resource address is always the caller's authenticated identity.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Unauthenticated`] if the session carries no
    /// identity.
    pub async fn publish(
        &self,
        ctx: &CallContext,
        request: PublishRequest,
    ) -> RendezvousResult<RendezvousReply> {
        let info = ctx.peer.as_ref().ok_or_else(|| {
            RendezvousError::Unauthenticated("no transport identity".to_string())
        })?;
        let wallet = info.wallet.ok_or_else(|| {
            RendezvousError::Unauthenticated("session is not authenticated".to_string())
        })?;
        let id = ResourceId::new(request.protocol, wallet);
        info!(id = %id, remote = %info.remote, "publishing remote peer");

        let client = self
            .meet(id.clone(), Role::Server, PeerHandle::new(info, request.private_addrs))
            .await?;
        info!(
            id = %id,
            public_addr = %client.public,
            private_addrs = client.private.len(),
            "providing remote client endpoint(s)"
        );
        Ok(self.reply_for(&client).await)
    }

    /// Lists the waiting servers published under an address, for any protocol.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::NotFound`] if nobody is published there.
    pub fn resolve_all(&self, request: &ResolveAllRequest) -> RendezvousResult<ResolveMetaReply> {
        let addr: WalletAddress = request.id.parse()?;
        let room = self.room.lock();
        let ids: Vec<String> = room
            .iter()
            .filter(|(id, _)| id.addr == addr)
            .flat_map(|(_, meeting)| meeting.side(Role::Server).keys())
            .map(ToString::to_string)
            .collect();
        drop(room);

        if ids.is_empty() {
            return Err(RendezvousError::NotFound(format!("peer {addr} not found")));
        }
        Ok(ResolveMetaReply { ids })
    }

    /// Dumps the waiting room: per resource id, the reply each waiter would
    /// produce for its counterpart.
    pub async fn info(&self) -> RendezvousResult<RendezvousState> {
        let snapshot: Vec<(ResourceId, Vec<(PeerId, PeerHandle)>, Vec<(PeerId, PeerHandle)>)> = {
            let room = self.room.lock();
            room.iter()
                .map(|(id, meeting)| {
                    let collect = |role| {
                        meeting
                            .side(role)
                            .iter()
                            .map(|(peer_id, waiter): (&PeerId, &Waiter)| (*peer_id, waiter.peer.clone()))
                            .collect::<Vec<_>>()
                    };
                    (id.clone(), collect(Role::Client), collect(Role::Server))
                })
                .collect()
        };

        let mut state = RendezvousState::default();
        for (id, clients, servers) in snapshot {
            let mut meeting = RendezvousMeeting::default();
            for (peer_id, peer) in clients {
                meeting.clients.insert(peer_id.to_string(), self.reply_for(&peer).await);
            }
            for (peer_id, peer) in servers {
                meeting.servers.insert(peer_id.to_string(), self.reply_for(&peer).await);
            }
            state.state.insert(id.to_string(), meeting);
        }
        Ok(state)
    }

    /// Matches `peer` against a waiter of the opposite role or parks it.
    async fn meet(&self, id: ResourceId, role: Role, peer: PeerHandle) -> RendezvousResult<PeerHandle> {
        let (tx, rx) = oneshot::channel();
        let registration = {
            let mut room = self.room.lock();
            while let Some((peer_id, waiter)) = room.pop_random(&id, role.opposite()) {
                if waiter.tx.send(peer.clone()).is_ok() {
                    return Ok(waiter.peer);
                }
                debug!(id = %id, peer = %peer_id, "skipping abandoned waiter");
            }
            let peer_id = PeerId::new();
            room.insert(id.clone(), role, peer_id, Waiter { peer, tx });
            Registration::new(self.room.clone(), id, role, peer_id)
        };

        let matched = rx.await.map_err(|_| RendezvousError::SessionClosed);
        drop(registration);
        matched
    }

    /// Builds the reply describing `peer`, substituting the server's own
    /// public IP for a private observed address.
    async fn reply_for(&self, peer: &PeerHandle) -> RendezvousReply {
        let mut public = peer.public.clone();
        if public.is_private() {
            match self.resolver.public_ip().await {
                Ok(Some(ip)) => public.socket.set_ip(ip),
                Ok(None) => {}
                Err(e) => {
                    warn!(addr = %public, error = %e, "failed to resolve public IP, passing private address through");
                }
            }
        }
        RendezvousReply {
            public_addr: Some(public.to_wire()),
            private_addrs: peer.private.clone(),
        }
    }
}
