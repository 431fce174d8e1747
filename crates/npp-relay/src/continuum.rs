//! Consistent hash ring assigning addresses to cluster members.
//!
//! Every member contributes `160 * weight` points to a 32-bit ring; each
//! BLAKE3 digest of `"<label>-<i>"` yields four of them. A key is owned by
//! the first point at or after the hash of the key, wrapping around at the
//! end of the ring. The ring is rebuilt from the sorted member list on every
//! change, so all nodes that agree on membership agree on ownership no
//! matter in which order they learned about it.
//!
//! Keys can be *tracked*: [`Continuum::add`] and [`Continuum::remove`]
//! report which tracked keys changed owner, which is how a relay node
//! learns that some of its waiting peers belong elsewhere now.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use parking_lot::Mutex;

/// Ring points per unit of member weight.
pub const POINTS_PER_WEIGHT: u32 = 160;

const POINTS_PER_DIGEST: u32 = 4;

/// Identity of a ring member.
pub trait RingNode: Clone + PartialEq + Send + Sync {
    /// Label hashed onto the ring. It must be the same on every cluster
    /// member and unique within the ring.
    fn label(&self) -> &str;
}

impl RingNode for String {
    fn label(&self) -> &str {
        self
    }
}

#[derive(Debug)]
struct Tracked<N> {
    owner: Option<N>,
    refs: usize,
}

#[derive(Debug)]
struct Ring<N> {
    members: BTreeMap<String, (N, u32)>,
    points: BTreeMap<u32, String>,
}

impl<N: RingNode> Ring<N> {
    fn rebuild(&mut self) {
        self.points.clear();
        for (label, (_, weight)) in &self.members {
            let digests = (*weight).max(1) * POINTS_PER_WEIGHT / POINTS_PER_DIGEST;
            for i in 0..digests {
                let digest = blake3::hash(format!("{label}-{i}").as_bytes());
                for chunk in digest.as_bytes()[..16].chunks_exact(4) {
                    let point = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    // Members are visited in label order, so collisions
                    // resolve the same way everywhere.
                    self.points.entry(point).or_insert_with(|| label.clone());
                }
            }
        }
    }

    fn lookup(&self, key: &[u8]) -> Option<&N> {
        let hash = key_hash(key);
        let (_, label) = self
            .points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())?;
        self.members.get(label).map(|(node, _)| node)
    }
}

fn key_hash(key: &[u8]) -> u32 {
    let digest = blake3::hash(key);
    let bytes = digest.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Debug)]
struct Inner<K, N> {
    ring: Ring<N>,
    tracked: HashMap<K, Tracked<N>>,
}

impl<K: AsRef<[u8]> + Eq + Hash + Clone, N: RingNode> Inner<K, N> {
    /// Refreshes the owner of every tracked key, returning the keys that
    /// moved to a different existing node.
    fn reassign(&mut self) -> Vec<K> {
        let Self { ring, tracked } = self;
        let mut moved = Vec::new();
        for (key, entry) in tracked.iter_mut() {
            let owner = ring.lookup(key.as_ref()).cloned();
            if owner.is_some() && owner != entry.owner {
                moved.push(key.clone());
            }
            entry.owner = owner;
        }
        moved
    }
}

/// Consistent hash ring mapping keys `K` to members `N`.
#[derive(Debug)]
pub struct Continuum<K, N> {
    inner: Mutex<Inner<K, N>>,
}

impl<K: AsRef<[u8]> + Eq + Hash + Clone, N: RingNode> Continuum<K, N> {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: Ring {
                    members: BTreeMap::new(),
                    points: BTreeMap::new(),
                },
                tracked: HashMap::new(),
            }),
        }
    }

    /// Adds or replaces a member, returning the tracked keys it took over.
    ///
    /// A weight of zero counts as one.
    pub fn add(&self, node: N, weight: u32) -> Vec<K> {
        let mut inner = self.inner.lock();
        inner
            .ring
            .members
            .insert(node.label().to_string(), (node, weight));
        inner.ring.rebuild();
        inner.reassign()
    }

    /// Removes a member by label, returning the tracked keys that moved to
    /// another member.
    pub fn remove(&self, label: &str) -> Vec<K> {
        let mut inner = self.inner.lock();
        if inner.ring.members.remove(label).is_none() {
            return Vec::new();
        }
        inner.ring.rebuild();
        inner.reassign()
    }

    /// Member owning `key`, if the ring is not empty.
    pub fn get(&self, key: &K) -> Option<N> {
        self.inner.lock().ring.lookup(key.as_ref()).cloned()
    }

    /// Opts `key` into reassignment reports.
    ///
    /// Tracking is reference counted; every call must be paired with
    /// [`Self::stop_tracking`].
    pub fn track(&self, key: K) {
        let mut inner = self.inner.lock();
        let owner = inner.ring.lookup(key.as_ref()).cloned();
        inner
            .tracked
            .entry(key)
            .or_insert(Tracked { owner, refs: 0 })
            .refs += 1;
    }

    /// Drops one tracking reference to `key`.
    pub fn stop_tracking(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.tracked.get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                inner.tracked.remove(key);
            }
        }
    }

    /// Returns true if `key` is tracked.
    pub fn is_tracked(&self, key: &K) -> bool {
        self.inner.lock().tracked.contains_key(key)
    }

    /// Current members in label order.
    pub fn nodes(&self) -> Vec<N> {
        self.inner
            .lock()
            .ring
            .members
            .values()
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.inner.lock().ring.members.len()
    }

    /// Returns true if the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.members.is_empty()
    }
}

impl<K: AsRef<[u8]> + Eq + Hash + Clone, N: RingNode> Default for Continuum<K, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    type Ring = Continuum<Vec<u8>, String>;

    fn keys(n: u32) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("key-{i}").into_bytes()).collect()
    }

    fn ring(nodes: &[&str]) -> Ring {
        let ring = Ring::new();
        for node in nodes {
            ring.add((*node).to_string(), 1);
        }
        ring
    }

    // ===== Lookup Tests =====

    #[test]
    fn empty_ring_owns_nothing() {
        let ring = Ring::new();
        assert!(ring.is_empty());
        assert_eq!(ring.get(&b"x".to_vec()), None);
    }

    #[test]
    fn single_node_owns_everything() {
        let ring = ring(&["a"]);
        for key in keys(100) {
            assert_eq!(ring.get(&key).as_deref(), Some("a"));
        }
    }

    #[test]
    fn ownership_ignores_insertion_order() {
        let forward = ring(&["a", "b", "c"]);
        let backward = ring(&["c", "b", "a"]);
        for key in keys(500) {
            assert_eq!(forward.get(&key), backward.get(&key));
        }
    }

    #[test]
    fn keys_spread_over_members() {
        let ring = ring(&["a", "b", "c"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in keys(3000) {
            if let Some(node) = ring.get(&key) {
                *counts.entry(node).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count > 500, "uneven distribution: {counts:?}");
        }
    }

    #[test]
    fn heavier_member_owns_more() {
        let ring = Ring::new();
        ring.add("light".to_string(), 1);
        ring.add("heavy".to_string(), 4);
        let heavy = keys(2000)
            .iter()
            .filter(|key| ring.get(key).as_deref() == Some("heavy"))
            .count();
        assert!(heavy > 1200, "heavy owns only {heavy}");
    }

    #[test]
    fn nodes_are_listed_by_label() {
        let ring = ring(&["c", "a", "b"]);
        assert_eq!(ring.nodes(), vec!["a", "b", "c"]);
        assert_eq!(ring.len(), 3);
    }

    // ===== Tracking Tests =====

    #[test]
    fn add_reports_only_tracked_keys_that_moved() {
        let ring = ring(&["a", "b", "c"]);
        let all = keys(300);
        for key in &all {
            ring.track(key.clone());
        }
        let before: Vec<_> = all.iter().map(|k| ring.get(k)).collect();

        let moved: HashSet<_> = ring.add("d".to_string(), 1).into_iter().collect();

        assert!(!moved.is_empty());
        for (key, old) in all.iter().zip(before) {
            let new = ring.get(key);
            assert_eq!(moved.contains(key), new != old);
            if moved.contains(key) {
                assert_eq!(new.as_deref(), Some("d"));
            }
        }
    }

    #[test]
    fn untracked_keys_are_not_reported() {
        let ring = ring(&["a"]);
        assert!(ring.add("b".to_string(), 1).is_empty());
    }

    #[test]
    fn remove_reports_keys_of_the_removed_member() {
        let ring = ring(&["a", "b"]);
        let all = keys(200);
        for key in &all {
            ring.track(key.clone());
        }
        let owned_by_b: HashSet<_> = all
            .iter()
            .filter(|k| ring.get(k).as_deref() == Some("b"))
            .cloned()
            .collect();

        let moved: HashSet<_> = ring.remove("b").into_iter().collect();
        assert_eq!(moved, owned_by_b);
    }

    #[test]
    fn removing_last_member_reports_nothing() {
        let ring = ring(&["a"]);
        ring.track(b"k".to_vec());
        assert!(ring.remove("a").is_empty());
        assert_eq!(ring.get(&b"k".to_vec()), None);
    }

    #[test]
    fn removing_unknown_member_is_a_noop() {
        let ring = ring(&["a"]);
        ring.track(b"k".to_vec());
        assert!(ring.remove("zzz").is_empty());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn tracking_is_reference_counted() {
        let ring = ring(&["a"]);
        let key = b"k".to_vec();
        ring.track(key.clone());
        ring.track(key.clone());
        ring.stop_tracking(&key);
        assert!(ring.is_tracked(&key));
        ring.stop_tracking(&key);
        assert!(!ring.is_tracked(&key));
        ring.stop_tracking(&key);
        assert!(!ring.is_tracked(&key));
    }

    #[test]
    fn replacing_a_member_keeps_its_points() {
        let ring = ring(&["a", "b"]);
        let key = b"k".to_vec();
        ring.track(key.clone());
        assert!(ring.add("a".to_string(), 1).is_empty());
        assert_eq!(ring.len(), 2);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn add_reports_exactly_the_changed_keys(
                keys in proptest::collection::hash_set(any::<[u8; 20]>(), 1..150),
                weight in 1u32..4,
            ) {
                let ring: Continuum<[u8; 20], String> = Continuum::new();
                for node in ["a", "b", "c"] {
                    ring.add(node.to_string(), 1);
                }
                for key in &keys {
                    ring.track(*key);
                }
                let before: HashMap<_, _> = keys.iter().map(|k| (*k, ring.get(k))).collect();

                let moved: HashSet<_> = ring.add("d".to_string(), weight).into_iter().collect();

                for key in &keys {
                    let after = ring.get(key);
                    let changed = after != before[key];
                    prop_assert_eq!(moved.contains(key), changed);
                    if changed {
                        prop_assert_eq!(after.as_deref(), Some("d"));
                    }
                }
            }

            #[test]
            fn remove_reports_exactly_the_changed_keys(
                keys in proptest::collection::hash_set(any::<[u8; 20]>(), 1..150),
            ) {
                let ring: Continuum<[u8; 20], String> = Continuum::new();
                for node in ["a", "b", "c", "d"] {
                    ring.add(node.to_string(), 1);
                }
                for key in &keys {
                    ring.track(*key);
                }
                let before: HashMap<_, _> = keys.iter().map(|k| (*k, ring.get(k))).collect();

                let moved: HashSet<_> = ring.remove("c").into_iter().collect();

                for key in &keys {
                    let changed = ring.get(key) != before[key];
                    prop_assert_eq!(moved.contains(key), changed);
                    prop_assert_eq!(changed, before[key].as_deref() == Some("c"));
                }
            }
        }
    }
}
