//! Listener and dialer counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::conn::ConnSource;

/// Connections accepted by a [`crate::Listener`], by source.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    direct: AtomicU64,
    nat: AtomicU64,
    relay: AtomicU64,
}

impl ListenerMetrics {
    /// Counts one accepted connection.
    pub fn record(&self, source: ConnSource) {
        let counter = match source {
            ConnSource::Direct => &self.direct,
            ConnSource::Punched | ConnSource::PunchedQuic => &self.nat,
            ConnSource::Relayed => &self.relay,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Plain TCP connections accepted.
    pub fn direct(&self) -> u64 {
        self.direct.load(Ordering::Relaxed)
    }

    /// Punched connections accepted, TCP and QUIC.
    pub fn nat(&self) -> u64 {
        self.nat.load(Ordering::Relaxed)
    }

    /// Relayed connections accepted.
    pub fn relay(&self) -> u64 {
        self.relay.load(Ordering::Relaxed)
    }
}

/// Dial statistics of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialStats {
    /// Dials started.
    pub attempts: u64,
    /// Dials that returned a connection.
    pub successes: u64,
    /// Dials that failed every method.
    pub failures: u64,
    /// Method of the last successful dial.
    pub last_source: Option<ConnSource>,
    /// Duration of the last dial, successful or not.
    pub last_duration: Option<Duration>,
}

/// Per-target dial statistics of a [`crate::Dialer`].
#[derive(Debug, Default)]
pub struct DialMetrics {
    targets: RwLock<HashMap<String, DialStats>>,
}

impl DialMetrics {
    pub(crate) fn record(&self, target: &str, outcome: Option<ConnSource>, elapsed: Duration) {
        let mut targets = self.targets.write();
        let stats = targets.entry(target.to_string()).or_default();
        stats.attempts += 1;
        stats.last_duration = Some(elapsed);
        match outcome {
            Some(source) => {
                stats.successes += 1;
                stats.last_source = Some(source);
            }
            None => stats.failures += 1,
        }
    }

    /// Statistics of `target`, if it was ever dialed.
    pub fn get(&self, target: &str) -> Option<DialStats> {
        self.targets.read().get(target).cloned()
    }

    /// Statistics of every target dialed so far.
    pub fn snapshot(&self) -> HashMap<String, DialStats> {
        self.targets.read().clone()
    }
}
