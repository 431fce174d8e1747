//! Relay node counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use npp_core::WalletAddress;
use npp_core::wire;
use parking_lot::RwLock;

/// Byte counters for one address.
#[derive(Debug, Default)]
pub struct NetCounters {
    /// Bytes forwarded from the SERVER leg to the CLIENT leg.
    tx_bytes: AtomicU64,
    /// Bytes forwarded from the CLIENT leg to the SERVER leg.
    rx_bytes: AtomicU64,
}

impl NetCounters {
    /// Counts bytes sent towards the client.
    pub fn add_tx(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts bytes sent towards the server.
    pub fn add_rx(&self, bytes: u64) {
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes forwarded towards clients so far.
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Bytes forwarded towards servers so far.
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}

/// Metrics of one relay node.
#[derive(Debug)]
pub struct RelayMetrics {
    /// Connections currently open.
    conn_current: AtomicU64,
    /// Traffic by address.
    net: RwLock<HashMap<WalletAddress, Arc<NetCounters>>>,
    /// Start of the node.
    started: Instant,
}

impl RelayMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conn_current: AtomicU64::new(0),
            net: RwLock::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// Counts a connection as open until the returned guard is dropped.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.conn_current.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            metrics: self.clone(),
        }
    }

    /// Connections currently open.
    pub fn conn_current(&self) -> u64 {
        self.conn_current.load(Ordering::Relaxed)
    }

    /// Counters for `addr`, created on first use.
    pub fn net(&self, addr: WalletAddress) -> Arc<NetCounters> {
        if let Some(counters) = self.net.read().get(&addr) {
            return counters.clone();
        }
        self.net.write().entry(addr).or_default().clone()
    }

    /// Wire snapshot of every counter.
    pub fn snapshot(&self) -> wire::RelayMetrics {
        let net = self
            .net
            .read()
            .iter()
            .map(|(addr, counters)| {
                (
                    addr.to_string(),
                    wire::NetMetrics {
                        tx_bytes: counters.tx_bytes(),
                        rx_bytes: counters.rx_bytes(),
                    },
                )
            })
            .collect();
        wire::RelayMetrics {
            conn_current: self.conn_current(),
            net,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection counted in [`RelayMetrics::conn_current`].
///
/// The guard travels with the socket, so a connection handed from one task
/// to another stays counted until it is closed.
#[derive(Debug)]
pub struct ConnectionGuard {
    metrics: Arc<RelayMetrics>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.conn_current.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_open_connections() {
        let metrics = Arc::new(RelayMetrics::new());
        let first = metrics.open_connection();
        let second = metrics.open_connection();
        assert_eq!(metrics.conn_current(), 2);
        drop(first);
        assert_eq!(metrics.conn_current(), 1);
        drop(second);
        assert_eq!(metrics.snapshot().conn_current, 0);
    }

    #[test]
    fn net_counters_are_shared_per_address() {
        let metrics = RelayMetrics::new();
        let addr = WalletAddress::from_bytes([3; 20]);
        metrics.net(addr).add_tx(10);
        metrics.net(addr).add_rx(4);
        metrics.net(addr).add_tx(5);

        let snapshot = metrics.snapshot();
        let net = &snapshot.net[&addr.to_string()];
        assert_eq!(net.tx_bytes, 15);
        assert_eq!(net.rx_bytes, 4);
    }
}
