//! Dialer caching established connections by target.
//!
//! Every cached entry carries a reference count that starts at one for
//! the cache itself; each [`CachedConn`] handle adds one. The collector
//! evicts an idle entry only by moving the count from one to zero, so an
//! entry with live handles is never closed. A lookup that increments the
//! count from zero raced with an eviction and treats the entry as gone.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::conn::{ConnSource, NppConn};
use crate::dialer::{DialTarget, Dialer};
use crate::error::{NppError, NppResult};
use crate::metrics::DialMetrics;

#[derive(Debug)]
struct Entry {
    id: u64,
    key: String,
    source: ConnSource,
    stream: tokio::sync::Mutex<Option<NppConn>>,
    refs: AtomicU32,
    last_active: Mutex<Instant>,
    closed: AtomicBool,
}

impl Entry {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Cache {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

impl Cache {
    fn lookup(self: &Arc<Self>, key: &str) -> Option<CachedConn> {
        let entry = self.entries.lock().get(key).cloned()?;
        if entry.is_closed() {
            return None;
        }
        if entry.refs.fetch_add(1, Ordering::AcqRel) == 0 {
            entry.refs.fetch_sub(1, Ordering::AcqRel);
            debug!(key, id = entry.id, "cached connection is being evicted");
            return None;
        }
        entry.touch();
        Some(CachedConn {
            entry,
            cache: self.clone(),
        })
    }

    fn insert(self: &Arc<Self>, key: String, conn: NppConn) -> CachedConn {
        let entry = Arc::new(Entry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            source: conn.source(),
            stream: tokio::sync::Mutex::new(Some(conn)),
            refs: AtomicU32::new(2),
            last_active: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });
        self.entries.lock().insert(key, entry.clone());
        CachedConn {
            entry,
            cache: self.clone(),
        }
    }

    fn invalidate(&self, entry: &Entry) {
        if entry.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.get(&entry.key).is_some_and(|cached| cached.id == entry.id) {
            entries.remove(&entry.key);
        }
        debug!(key = %entry.key, id = entry.id, "cached connection invalidated");
    }

    fn collect_expired(&self, now: Instant) -> usize {
        let mut evicted = Vec::new();
        self.entries.lock().retain(|_, entry| {
            if entry.is_closed() {
                return false;
            }
            let idle = now.saturating_duration_since(*entry.last_active.lock());
            if idle > self.idle_timeout
                && entry
                    .refs
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                entry.closed.store(true, Ordering::Release);
                evicted.push(entry.clone());
                return false;
            }
            true
        });
        for entry in &evicted {
            // No handle is left, so nothing holds the stream lock.
            if let Ok(mut stream) = entry.stream.try_lock() {
                stream.take();
            }
            debug!(key = %entry.key, id = entry.id, "evicted idle connection");
        }
        evicted.len()
    }
}

/// Shared handle to a cached connection.
///
/// Dropping the handle keeps the connection cached; it is closed once it
/// has been idle for the configured timeout with no handle alive, or as
/// soon as an I/O error shows it is broken.
#[derive(Debug)]
pub struct CachedConn {
    entry: Arc<Entry>,
    cache: Arc<Cache>,
}

impl CachedConn {
    /// Identifier of the underlying connection, equal across handles that
    /// share it.
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// How the underlying connection was established.
    pub fn source(&self) -> ConnSource {
        self.entry.source
    }

    /// Returns true once the connection was invalidated or evicted.
    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }

    /// Waits for exclusive use of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`NppError::Closed`] if the connection is gone.
    pub async fn lock(&self) -> NppResult<CachedStream<'_>> {
        let guard = self.entry.stream.lock().await;
        if guard.is_none() || self.entry.is_closed() {
            return Err(NppError::Closed);
        }
        self.entry.touch();
        Ok(CachedStream {
            guard,
            entry: &self.entry,
            cache: &self.cache,
        })
    }
}

impl Drop for CachedConn {
    fn drop(&mut self) {
        self.entry.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive access to a cached connection.
///
/// Successful reads and writes mark the connection active; an error or an
/// end of stream invalidates it.
#[derive(Debug)]
pub struct CachedStream<'a> {
    guard: tokio::sync::MutexGuard<'a, Option<NppConn>>,
    entry: &'a Entry,
    cache: &'a Cache,
}

impl CachedStream<'_> {
    fn conn(&mut self) -> io::Result<&mut NppConn> {
        self.guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "cached connection closed"))
    }

    fn observe<T>(&self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        match &poll {
            Poll::Ready(Ok(_)) => self.entry.touch(),
            Poll::Ready(Err(_)) => self.cache.invalidate(self.entry),
            Poll::Pending => {}
        }
        poll
    }
}

impl AsyncRead for CachedStream<'_> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = match this.conn() {
            Ok(conn) => Pin::new(conn).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() == before && buf.remaining() > 0 {
            this.cache.invalidate(this.entry);
            return poll;
        }
        this.observe(poll)
    }
}

impl AsyncWrite for CachedStream<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match this.conn() {
            Ok(conn) => Pin::new(conn).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.observe(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.conn() {
            Ok(conn) => Pin::new(conn).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.observe(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A half-closed connection cannot be handed to the next caller.
        this.cache.invalidate(this.entry);
        match this.conn() {
            Ok(conn) => Pin::new(conn).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// [`Dialer`] that reuses established connections.
#[derive(Debug)]
pub struct CachedDialer {
    dialer: Dialer,
    cache: Arc<Cache>,
    gc: JoinHandle<()>,
}

impl CachedDialer {
    /// Wraps `dialer` and starts the idle collector.
    pub fn new(dialer: Dialer, config: CacheConfig) -> Self {
        let cache = Arc::new(Cache {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            idle_timeout: config.idle_timeout,
        });
        let gc = tokio::spawn(collect_idle(cache.clone(), config.gc_interval));
        Self { dialer, cache, gc }
    }

    /// Returns a cached connection to `target`, dialing a new one if none
    /// is usable.
    ///
    /// # Errors
    ///
    /// Returns the dialer's error if a new connection is needed and cannot
    /// be established.
    pub async fn dial(&self, target: &DialTarget) -> NppResult<CachedConn> {
        let key = target.to_string();
        if let Some(conn) = self.cache.lookup(&key) {
            debug!(target = %target, id = conn.id(), "reusing cached connection");
            return Ok(conn);
        }
        let conn = self.dialer.dial(target).await?;
        let cached = self.cache.insert(key, conn);
        info!(target = %target, id = cached.id(), source = %cached.source(), "cached new connection");
        Ok(cached)
    }

    /// Number of cached connections.
    pub fn len(&self) -> usize {
        self.cache.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-target dial statistics of the wrapped dialer.
    pub fn metrics(&self) -> Arc<DialMetrics> {
        self.dialer.metrics()
    }

    /// Evicts entries idle at `now` and returns how many were closed.
    pub fn collect_expired(&self, now: Instant) -> usize {
        self.cache.collect_expired(now)
    }
}

impl Drop for CachedDialer {
    fn drop(&mut self) {
        self.gc.abort();
    }
}

async fn collect_idle(cache: Arc<Cache>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = cache.collect_expired(Instant::now());
        if evicted > 0 {
            debug!(evicted, remaining = cache.entries.lock().len(), "collected idle connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DialerConfig;
    use ed25519_dalek::SigningKey;
    use npp_core::TransportCredentials;
    use rand::rngs::OsRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const IDENTITY: &str = "0x00112233445566778899aabbccddeeff00112233";

    fn cached_dialer() -> CachedDialer {
        let credentials = TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials");
        CachedDialer::new(Dialer::new(DialerConfig::new(), credentials), CacheConfig::new())
    }

    async fn echo_server() -> (String, JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let accepts = tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok((mut stream, _)) = listener.accept().await {
                accepted += 1;
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
            accepted
        });
        (addr, accepts)
    }

    fn target(network: &str) -> DialTarget {
        DialTarget::with_network(IDENTITY.parse().expect("identity"), network)
    }

    // ===== Reuse =====

    #[tokio::test]
    async fn same_target_reuses_the_connection() {
        let (addr, _server) = echo_server().await;
        let dialer = cached_dialer();

        let first = dialer.dial(&target(&addr)).await.expect("first dial");
        let second = dialer.dial(&target(&addr)).await.expect("second dial");
        assert_eq!(first.id(), second.id());
        assert_eq!(dialer.len(), 1);
        assert_eq!(dialer.metrics().get(&target(&addr).to_string()).expect("stats").attempts, 1);

        let mut stream = second.lock().await.expect("lock");
        stream.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dropped_handles_keep_the_connection_cached() {
        let (addr, _server) = echo_server().await;
        let dialer = cached_dialer();

        let id = dialer.dial(&target(&addr)).await.expect("dial").id();
        let again = dialer.dial(&target(&addr)).await.expect("dial again");
        assert_eq!(again.id(), id);
    }

    // ===== Eviction =====

    #[tokio::test]
    async fn idle_connections_are_collected() {
        let (addr, _server) = echo_server().await;
        let dialer = cached_dialer();

        let conn = dialer.dial(&target(&addr)).await.expect("dial");
        let id = conn.id();
        let later = Instant::now() + Duration::from_secs(16 * 60);
        assert_eq!(dialer.collect_expired(later), 0, "live handle must pin the entry");

        drop(conn);
        assert_eq!(dialer.collect_expired(Instant::now()), 0, "not idle yet");
        assert_eq!(dialer.collect_expired(later), 1);
        assert!(dialer.is_empty());

        let fresh = dialer.dial(&target(&addr)).await.expect("redial");
        assert_ne!(fresh.id(), id);
    }

    #[tokio::test]
    async fn lookup_after_eviction_started_is_too_late() {
        let (addr, _server) = echo_server().await;
        let dialer = cached_dialer();
        let key = target(&addr).to_string();

        drop(dialer.dial(&target(&addr)).await.expect("dial"));
        let entry = dialer.cache.entries.lock().get(&key).cloned().expect("entry");
        // Simulate the collector's 1 -> 0 transition landing first.
        entry.refs.store(0, Ordering::Release);
        assert!(dialer.cache.lookup(&key).is_none());
        assert_eq!(entry.refs.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn broken_connection_is_invalidated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let dialer = cached_dialer();

        let conn = dialer.dial(&target(&addr)).await.expect("dial");
        let (server, _) = listener.accept().await.expect("accept");
        drop(server);

        let mut stream = conn.lock().await.expect("lock");
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.expect("eof"), 0);
        drop(stream);
        assert!(conn.is_closed());
        assert!(dialer.is_empty());

        let redial = target(&addr);
        let (_server, accepted) = tokio::join!(listener.accept(), dialer.dial(&redial));
        assert_ne!(accepted.expect("redial").id(), conn.id());
    }
}
