//! Waiting rooms pairing servers with clients under a shared key.
//!
//! Both the Rendezvous and the Relay server park one side of a meeting until
//! the other side shows up. A [`MeetingRoom`] owns one [`Meeting`] per key,
//! creates it on the first waiter and deletes it as soon as both of its
//! sides are empty. All operations happen under a single mutex whose
//! critical sections are O(1) in the number of keys.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rand::Rng;

use crate::id::PeerId;

/// Which side of a meeting a waiter is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepts connections (publisher).
    Server,
    /// Initiates connections (resolver).
    Client,
}

impl Role {
    /// The role a waiter of this role is matched with.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }
}

/// Waiters of both roles for one key.
#[derive(Debug)]
pub struct Meeting<V> {
    clients: HashMap<PeerId, V>,
    servers: HashMap<PeerId, V>,
}

impl<V> Meeting<V> {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
            servers: HashMap::new(),
        }
    }

    /// Waiters of the given role.
    #[must_use]
    pub fn side(&self, role: Role) -> &HashMap<PeerId, V> {
        match role {
            Role::Server => &self.servers,
            Role::Client => &self.clients,
        }
    }

    fn side_mut(&mut self, role: Role) -> &mut HashMap<PeerId, V> {
        match role {
            Role::Server => &mut self.servers,
            Role::Client => &mut self.clients,
        }
    }

    /// Returns true if nobody waits on either side.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.servers.is_empty()
    }

    /// Consumes the meeting, yielding every waiter.
    pub fn into_waiters(self) -> impl Iterator<Item = (Role, PeerId, V)> {
        self.servers
            .into_iter()
            .map(|(id, v)| (Role::Server, id, v))
            .chain(self.clients.into_iter().map(|(id, v)| (Role::Client, id, v)))
    }
}

/// Registry of meetings keyed by `K`.
#[derive(Debug)]
pub struct MeetingRoom<K, V> {
    meetings: Mutex<HashMap<K, Meeting<V>>>,
}

impl<K: Eq + Hash + Clone, V> MeetingRoom<K, V> {
    /// Creates an empty room.
    #[must_use]
    pub fn new() -> Self {
        Self {
            meetings: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the room for a compound operation.
    pub fn lock(&self) -> RoomGuard<'_, K, V> {
        RoomGuard {
            meetings: self.meetings.lock(),
        }
    }

    /// Number of keys with at least one waiter.
    pub fn len(&self) -> usize {
        self.meetings.lock().len()
    }

    /// Returns true if nobody waits for anything.
    pub fn is_empty(&self) -> bool {
        self.meetings.lock().is_empty()
    }

    /// Returns true if a meeting exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.meetings.lock().contains_key(key)
    }
}

impl<K: Eq + Hash + Clone, V> Default for MeetingRoom<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a [`MeetingRoom`].
pub struct RoomGuard<'a, K, V> {
    meetings: MutexGuard<'a, HashMap<K, Meeting<V>>>,
}

impl<K: Eq + Hash + Clone, V> RoomGuard<'_, K, V> {
    /// Parks a waiter, creating the meeting if needed.
    pub fn insert(&mut self, key: K, role: Role, id: PeerId, value: V) {
        self.meetings
            .entry(key)
            .or_insert_with(Meeting::new)
            .side_mut(role)
            .insert(id, value);
    }

    /// Removes a uniformly random waiter of `role`.
    pub fn pop_random(&mut self, key: &K, role: Role) -> Option<(PeerId, V)> {
        self.pop_random_where(key, role, |_, _| true)
    }

    /// Removes a uniformly random waiter of `role` satisfying `filter`.
    pub fn pop_random_where<F>(&mut self, key: &K, role: Role, filter: F) -> Option<(PeerId, V)>
    where
        F: Fn(&PeerId, &V) -> bool,
    {
        let meeting = self.meetings.get_mut(key)?;
        let eligible: Vec<PeerId> = meeting
            .side(role)
            .iter()
            .filter(|(id, v)| filter(id, v))
            .map(|(id, _)| *id)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let id = eligible[rand::thread_rng().gen_range(0..eligible.len())];
        let value = meeting.side_mut(role).remove(&id)?;
        self.clean(key);
        Some((id, value))
    }

    /// Removes a specific waiter, returning it if it was still parked.
    pub fn remove(&mut self, key: &K, role: Role, id: &PeerId) -> Option<V> {
        let value = self.meetings.get_mut(key)?.side_mut(role).remove(id);
        self.clean(key);
        value
    }

    /// Removes the whole meeting for `key`.
    pub fn take(&mut self, key: &K) -> Option<Meeting<V>> {
        self.meetings.remove(key)
    }

    /// Looks up the meeting for `key`.
    pub fn get(&self, key: &K) -> Option<&Meeting<V>> {
        self.meetings.get(key)
    }

    /// Iterates over all meetings.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Meeting<V>)> {
        self.meetings.iter()
    }

    fn clean(&mut self, key: &K) {
        if self.meetings.get(key).is_some_and(Meeting::is_empty) {
            self.meetings.remove(key);
        }
    }
}

/// Removes a parked waiter when dropped.
///
/// Every exit path of a waiting call (match, cancellation, timeout, error)
/// drops its registration, so half-registered waiters never outlive the
/// call that parked them. Removing an already matched waiter is a no-op.
pub struct Registration<K: Eq + Hash + Clone, V> {
    room: Arc<MeetingRoom<K, V>>,
    key: K,
    role: Role,
    id: PeerId,
}

impl<K: Eq + Hash + Clone, V> Registration<K, V> {
    /// Tracks a waiter that has just been inserted into `room`.
    #[must_use]
    pub fn new(room: Arc<MeetingRoom<K, V>>, key: K, role: Role, id: PeerId) -> Self {
        Self { room, key, role, id }
    }

    /// Identifier of the tracked waiter.
    #[must_use]
    pub const fn id(&self) -> PeerId {
        self.id
    }

    /// Removes the waiter now, returning its value if it was still parked.
    pub fn withdraw(&self) -> Option<V> {
        self.room.lock().remove(&self.key, self.role, &self.id)
    }
}

impl<K: Eq + Hash + Clone, V> Drop for Registration<K, V> {
    fn drop(&mut self) {
        // Dropping the withdrawn value happens outside the lock.
        let _value = self.withdraw();
    }
}
