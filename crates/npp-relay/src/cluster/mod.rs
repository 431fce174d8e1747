//! Gossip-based cluster membership.
//!
//! Every member owns a heartbeat counter that it bumps once per gossip
//! interval before pushing its member table to a few random members and to
//! every seed. Tables are merged by keeping the highest counter seen per
//! member; a member whose counter has not advanced within the failure
//! timeout is declared gone. A member shutting down gracefully announces it
//! with a `Leave` datagram. All datagrams are encrypted with a key derived
//! from the shared cluster secret.
//!
//! ```text
//!   member A ──push(table)──► member B
//!      ▲                        │
//!      └───────push(table)──────┘     on_join / on_leave ──► MembershipEvents
//! ```

mod cipher;
pub mod message;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use prost::Message;
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GossipConfig;
use crate::error::{RelayError, RelayResult};

use self::cipher::GossipCipher;
use self::message::gossip_message::Kind;
use self::message::{GossipMessage, Leave, MemberState, Push};

/// Largest datagram a member sends or accepts.
const MAX_DATAGRAM: usize = 65_507;

/// Tombstones outlive a departure by this many failure timeouts.
const TOMBSTONE_FACTOR: u32 = 4;

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    /// Unique member name.
    pub name: String,
    /// Gossip address.
    pub addr: SocketAddr,
    /// Opaque metadata published by the member.
    pub meta: String,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// Receives membership changes.
///
/// Callbacks run on the gossip task and must not block.
pub trait MembershipEvents: Send + Sync + 'static {
    /// A member joined, including the local member at startup.
    fn on_join(&self, member: &Member);

    /// A member left or failed.
    fn on_leave(&self, member: &Member);
}

#[derive(Debug)]
struct Peer {
    member: Member,
    heartbeat: u64,
    advanced_at: Instant,
}

#[derive(Debug)]
struct Table {
    local: Member,
    heartbeat: u64,
    peers: HashMap<String, Peer>,
    departed: HashMap<String, (u64, Instant)>,
}

impl Table {
    fn snapshot(&self) -> Push {
        let mut members = Vec::with_capacity(1 + self.peers.len());
        members.push(state_of(&self.local, self.heartbeat));
        members.extend(self.peers.values().map(|p| state_of(&p.member, p.heartbeat)));
        Push {
            from: self.local.name.clone(),
            members,
        }
    }

    /// Merges a pushed table, returning members seen for the first time.
    fn merge(&mut self, push: Push, from: SocketAddr, now: Instant) -> Vec<Member> {
        let mut joined = Vec::new();
        for state in push.members {
            if state.name == self.local.name {
                continue;
            }
            let Ok(mut addr) = state.addr.parse::<SocketAddr>() else {
                debug!(member = %state.name, addr = %state.addr, "skipping member with malformed address");
                continue;
            };
            if addr.ip().is_unspecified() {
                // Only the sender itself can be located through the datagram.
                if state.name != push.from {
                    continue;
                }
                addr = SocketAddr::new(from.ip(), addr.port());
            }
            if self
                .departed
                .get(&state.name)
                .is_some_and(|(heartbeat, _)| *heartbeat >= state.heartbeat)
            {
                continue;
            }

            match self.peers.get_mut(&state.name) {
                Some(peer) => {
                    if state.heartbeat > peer.heartbeat {
                        peer.heartbeat = state.heartbeat;
                        peer.advanced_at = now;
                        peer.member.addr = addr;
                        peer.member.meta = state.meta;
                    }
                }
                None => {
                    let member = Member {
                        name: state.name.clone(),
                        addr,
                        meta: state.meta,
                    };
                    self.departed.remove(&state.name);
                    joined.push(member.clone());
                    self.peers.insert(
                        state.name,
                        Peer {
                            member,
                            heartbeat: state.heartbeat,
                            advanced_at: now,
                        },
                    );
                }
            }
        }
        joined
    }

    fn depart(&mut self, name: &str, heartbeat: u64, now: Instant) -> Option<Member> {
        let recorded = self.departed.entry(name.to_string()).or_insert((heartbeat, now));
        recorded.0 = recorded.0.max(heartbeat);
        match self.peers.get(name) {
            Some(peer) if peer.heartbeat <= heartbeat => self.peers.remove(name).map(|p| p.member),
            _ => None,
        }
    }

    /// Declares members with stalled heartbeats gone.
    fn expire(&mut self, config: &GossipConfig, now: Instant) -> Vec<Member> {
        let stalled: Vec<(String, u64)> = self
            .peers
            .values()
            .filter(|p| now.duration_since(p.advanced_at) > config.failure_timeout)
            .map(|p| (p.member.name.clone(), p.heartbeat))
            .collect();
        let gone = stalled
            .into_iter()
            .filter_map(|(name, heartbeat)| self.depart(&name, heartbeat, now))
            .collect();

        let keep = config.failure_timeout * TOMBSTONE_FACTOR;
        self.departed
            .retain(|_, (_, since)| now.duration_since(*since) <= keep);
        gone
    }

    fn targets(&self, config: &GossipConfig, local_addr: SocketAddr) -> Vec<SocketAddr> {
        let addrs: Vec<SocketAddr> = self.peers.values().map(|p| p.member.addr).collect();
        let mut targets: Vec<SocketAddr> = addrs
            .choose_multiple(&mut rand::thread_rng(), config.fanout)
            .copied()
            .collect();
        for seed in &config.seeds {
            if *seed != local_addr && *seed != self.local.addr && !targets.contains(seed) {
                targets.push(*seed);
            }
        }
        targets
    }

    fn everyone(&self, config: &GossipConfig, local_addr: SocketAddr) -> Vec<SocketAddr> {
        let mut targets: Vec<SocketAddr> = self.peers.values().map(|p| p.member.addr).collect();
        for seed in &config.seeds {
            if *seed != local_addr && !targets.contains(seed) {
                targets.push(*seed);
            }
        }
        targets
    }
}

fn state_of(member: &Member, heartbeat: u64) -> MemberState {
    MemberState {
        name: member.name.clone(),
        addr: member.addr.to_string(),
        meta: member.meta.clone(),
        heartbeat,
    }
}

/// Counters start at the wall clock so a restarted member outranks its
/// previous incarnation.
fn initial_heartbeat() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug)]
struct Shared {
    config: GossipConfig,
    cipher: GossipCipher,
    table: Mutex<Table>,
    local_addr: SocketAddr,
}

/// Handle to a running gossip member.
///
/// Dropping the handle stops gossiping without announcing the departure;
/// use [`Membership::leave`] to leave gracefully.
#[derive(Debug)]
pub struct Membership {
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Membership {
    /// Binds the gossip socket, reports the local member as joined and
    /// starts gossiping.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the socket
    /// cannot be bound.
    pub async fn start(
        config: GossipConfig,
        meta: String,
        events: Arc<dyn MembershipEvents>,
    ) -> RelayResult<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| RelayError::BindFailed(config.bind_addr, e))?;
        let local_addr = socket.local_addr()?;
        let local = Member {
            name: config.name.clone(),
            addr: config.announce.unwrap_or(local_addr),
            meta,
        };
        info!(name = %local.name, addr = %local_addr, seeds = config.seeds.len(), "Joining relay cluster");
        events.on_join(&local);

        let shared = Arc::new(Shared {
            cipher: GossipCipher::new(&config.secret),
            table: Mutex::new(Table {
                local,
                heartbeat: initial_heartbeat(),
                peers: HashMap::new(),
                departed: HashMap::new(),
            }),
            config,
            local_addr,
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(shared.clone(), socket, events, shutdown_rx));

        Ok(Self {
            shared,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Address of the gossip socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// The local member.
    pub fn local_member(&self) -> Member {
        self.shared.table.lock().local.clone()
    }

    /// Live members, the local one included, sorted by name.
    pub fn members(&self) -> Vec<Member> {
        let table = self.shared.table.lock();
        let mut members: Vec<Member> = std::iter::once(table.local.clone())
            .chain(table.peers.values().map(|p| p.member.clone()))
            .collect();
        drop(table);
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Announces the departure to every known member and stops gossiping.
    pub async fn leave(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    socket: UdpSocket,
    events: Arc<dyn MembershipEvents>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(shared.config.interval);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let (push, targets, gone) = {
                    let mut table = shared.table.lock();
                    table.heartbeat += 1;
                    let gone = table.expire(&shared.config, now);
                    (table.snapshot(), table.targets(&shared.config, shared.local_addr), gone)
                };
                for member in &gone {
                    warn!(member = %member, "Cluster member stopped responding");
                    events.on_leave(member);
                }
                send(&shared, &socket, Kind::Push(push), &targets).await;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => handle_datagram(&shared, &buf[..len], from, events.as_ref()),
                    Err(e) => debug!(error = %e, "gossip receive failed"),
                }
            }
            _ = &mut shutdown_rx => {
                let (leave, targets) = {
                    let table = shared.table.lock();
                    let leave = Leave {
                        name: table.local.name.clone(),
                        heartbeat: table.heartbeat,
                    };
                    (leave, table.everyone(&shared.config, shared.local_addr))
                };
                send(&shared, &socket, Kind::Leave(leave), &targets).await;
                info!("Left relay cluster");
                break;
            }
        }
    }
}

async fn send(shared: &Shared, socket: &UdpSocket, kind: Kind, targets: &[SocketAddr]) {
    if targets.is_empty() {
        return;
    }
    let message = GossipMessage { kind: Some(kind) };
    let packet = match shared.cipher.seal(&message.encode_to_vec()) {
        Ok(packet) if packet.len() <= MAX_DATAGRAM => packet,
        Ok(packet) => {
            warn!(size = packet.len(), "gossip datagram too large, not sent");
            return;
        }
        Err(e) => {
            warn!(error = %e, "failed to seal gossip datagram");
            return;
        }
    };
    for target in targets {
        if let Err(e) = socket.send_to(&packet, target).await {
            debug!(target = %target, error = %e, "gossip send failed");
        }
    }
}

fn handle_datagram(shared: &Shared, packet: &[u8], from: SocketAddr, events: &dyn MembershipEvents) {
    let message = match shared
        .cipher
        .open(packet)
        .and_then(|plain| GossipMessage::decode(plain.as_slice()).map_err(|e| RelayError::Gossip(e.to_string())))
    {
        Ok(message) => message,
        Err(e) => {
            debug!(from = %from, error = %e, "dropping gossip datagram");
            return;
        }
    };

    let now = Instant::now();
    match message.kind {
        Some(Kind::Push(push)) => {
            let joined = shared.table.lock().merge(push, from, now);
            for member in &joined {
                info!(member = %member, "Cluster member joined");
                events.on_join(member);
            }
        }
        Some(Kind::Leave(leave)) => {
            let gone = shared.table.lock().depart(&leave.name, leave.heartbeat, now);
            if let Some(member) = gone {
                info!(member = %member, "Cluster member left");
                events.on_leave(&member);
            }
        }
        None => debug!(from = %from, "empty gossip datagram"),
    }
}
