//! Connection pool keyed by endpoint identity.
//!
//! Each identity owns a bucket guarded by its own mutex; each connection
//! guards its own bookkeeping. Lock order is always bucket, then connection.
//! Nothing here holds a lock across an await point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::endpoint::EndpointIdentity;
use crate::error::{Error, Result};
use crate::pool::connection::{Claim, Connection, SweepCheck, DEFAULT_MAX_STREAMS};

type Bucket = Mutex<Vec<Arc<Connection>>>;

/// Pool tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections older than this are evicted by the sweeper.
    ///
    /// Default: 5 min
    pub idle_timeout: Duration,

    /// Interval between background sweeps.
    ///
    /// Default: 30s
    pub sweep_interval: Duration,

    /// Idle connections kept across all endpoints; the longest idle go first.
    ///
    /// Default: 5
    pub max_idle_connections: usize,

    /// Stream limit applied to multiplexed connections on admission.
    ///
    /// Default: 100
    pub max_streams_per_connection: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_idle_connections: 5,
            max_streams_per_connection: DEFAULT_MAX_STREAMS,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn max_idle_connections(mut self, max: usize) -> Self {
        self.max_idle_connections = max;
        self
    }

    pub fn max_streams_per_connection(mut self, max: u32) -> Self {
        self.max_streams_per_connection = max;
        self
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Endpoints with at least one tracked connection.
    pub endpoints: usize,
    pub total_connections: usize,
    pub idle_connections: usize,
    pub multiplexed_connections: usize,
    /// Streams held across all connections.
    pub active_streams: u64,
}

struct PoolInner {
    buckets: DashMap<EndpointIdentity, Bucket>,
    config: PoolConfig,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Shared pool of established connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool. Call [`ConnectionPool::spawn_sweeper`] to evict in the background.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buckets: DashMap::new(),
                config,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Claim a stream on a healthy connection with spare capacity.
    ///
    /// `Ok(None)` means nothing qualifies and a new connection is needed.
    /// Dead connections met along the way are removed and closed.
    pub fn acquire(&self, identity: &EndpointIdentity) -> Result<Option<Lease>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let Some(bucket) = self.inner.buckets.get(identity) else {
            tracing::debug!("Pool: miss for {} (no bucket)", identity.authority());
            return Ok(None);
        };

        let mut conns = lock(&bucket);
        let mut found = None;
        let mut dead = Vec::new();
        for (i, conn) in conns.iter().enumerate() {
            match conn.try_claim() {
                Claim::Acquired => {
                    found = Some(Arc::clone(conn));
                    break;
                }
                Claim::Busy => {}
                Claim::Dead => dead.push(i),
            }
        }
        for i in dead.into_iter().rev() {
            let conn = conns.swap_remove(i);
            tracing::debug!(
                "Pool: evicting connection {} for {} (unhealthy)",
                conn.id(),
                identity.authority()
            );
            conn.close();
        }
        let size = conns.len();
        drop(conns);
        drop(bucket);

        // Shutdown may have drained the bucket while we scanned it.
        if self.is_closed() {
            if let Some(conn) = found {
                conn.release_stream();
                conn.close();
            }
            return Err(Error::PoolClosed);
        }

        match found {
            Some(conn) => {
                tracing::debug!(
                    "Pool: reusing connection {} for {} ({} in use, bucket size {})",
                    conn.id(),
                    identity.authority(),
                    conn.in_use(),
                    size
                );
                Ok(Some(self.lease(conn)))
            }
            None => {
                tracing::debug!(
                    "Pool: miss for {} (bucket size {})",
                    identity.authority(),
                    size
                );
                Ok(None)
            }
        }
    }

    /// Register a freshly established connection and claim its first stream.
    ///
    /// The connection is filed under its own identity, so any equivalent
    /// identity finds it later.
    pub fn admit(&self, conn: Connection) -> Result<Lease> {
        if self.is_closed() {
            conn.close();
            return Err(Error::PoolClosed);
        }
        conn.set_max_streams(self.inner.config.max_streams_per_connection);
        conn.acquire_stream()?;

        let conn = Arc::new(conn);
        let identity = conn.identity().clone();
        {
            let bucket = self.inner.buckets.entry(identity.clone()).or_default();
            let mut conns = lock(&bucket);
            conns.push(Arc::clone(&conn));
            tracing::debug!(
                "Pool: admitted connection {} for {} ({}, bucket size {})",
                conn.id(),
                identity.authority(),
                conn.protocol(),
                conns.len()
            );
        }

        if self.is_closed() {
            self.remove(&conn);
            conn.close();
            return Err(Error::PoolClosed);
        }
        Ok(self.lease(conn))
    }

    /// Give a stream back. Same as dropping the lease.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Run one eviction pass now.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Evict connections idle past the threshold at `now`, unhealthy ones, and
    /// the longest idle beyond `max_idle_connections`. Returns how many closed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut evicted = Vec::new();
        let mut idle = Vec::new();

        for bucket in self.inner.buckets.iter() {
            let mut conns = lock(bucket.value());
            conns.retain(|conn| match conn.sweep_check(now, idle_timeout) {
                SweepCheck::InUse => true,
                SweepCheck::Idle(for_how_long) => {
                    idle.push((for_how_long, Arc::clone(conn)));
                    true
                }
                SweepCheck::Evict(reason) => {
                    tracing::debug!(
                        "Pool: evicting connection {} for {} ({})",
                        conn.id(),
                        bucket.key().authority(),
                        reason
                    );
                    evicted.push(Arc::clone(conn));
                    false
                }
            });
        }

        let max_idle = self.inner.config.max_idle_connections;
        if idle.len() > max_idle {
            idle.sort_by(|a, b| b.0.cmp(&a.0));
            let excess = idle.len() - max_idle;
            for (_, conn) in idle.into_iter().take(excess) {
                if conn.retire_if_idle() {
                    tracing::debug!(
                        "Pool: evicting connection {} for {} (idle limit {})",
                        conn.id(),
                        conn.identity().authority(),
                        max_idle
                    );
                    self.remove(&conn);
                    evicted.push(conn);
                }
            }
        }

        self.inner
            .buckets
            .retain(|_, bucket| !lock(bucket).is_empty());

        for conn in &evicted {
            conn.close();
        }
        evicted.len()
    }

    /// Close every connection that holds no stream right now.
    pub fn evict_all_idle(&self) -> usize {
        let mut evicted = Vec::new();
        for bucket in self.inner.buckets.iter() {
            let mut conns = lock(bucket.value());
            conns.retain(|conn| {
                if conn.retire_if_idle() {
                    evicted.push(Arc::clone(conn));
                    false
                } else {
                    true
                }
            });
        }
        self.inner
            .buckets
            .retain(|_, bucket| !lock(bucket).is_empty());
        for conn in &evicted {
            conn.close();
        }
        tracing::debug!("Pool: evicted {} idle connection(s)", evicted.len());
        evicted.len()
    }

    /// Spawn the periodic sweeper. It stops on shutdown or when the last pool
    /// handle is dropped.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let pool = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let evicted = ConnectionPool { inner }.sweep();
                if evicted > 0 {
                    tracing::debug!("Pool: sweeper evicted {} connection(s)", evicted);
                }
            }
            tracing::trace!("Pool: sweeper stopped");
        })
    }

    /// Close every tracked connection and refuse further use. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let mut drained = Vec::new();
        for bucket in self.inner.buckets.iter() {
            drained.append(&mut lock(bucket.value()));
        }
        self.inner.buckets.clear();
        tracing::debug!("Pool: shut down, closing {} connection(s)", drained.len());
        for conn in drained {
            conn.close();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for bucket in self.inner.buckets.iter() {
            let conns = lock(bucket.value());
            if conns.is_empty() {
                continue;
            }
            stats.endpoints += 1;
            for conn in conns.iter() {
                let in_use = conn.in_use();
                stats.total_connections += 1;
                stats.active_streams += u64::from(in_use);
                if in_use == 0 {
                    stats.idle_connections += 1;
                }
                if conn.is_multiplexed() {
                    stats.multiplexed_connections += 1;
                }
            }
        }
        stats
    }

    /// Connections tracked for `identity` (or any equivalent identity).
    pub fn connections_for(&self, identity: &EndpointIdentity) -> Vec<Arc<Connection>> {
        self.inner
            .buckets
            .get(identity)
            .map(|bucket| lock(&bucket).clone())
            .unwrap_or_default()
    }

    fn lease(&self, conn: Arc<Connection>) -> Lease {
        Lease {
            conn,
            pool: Arc::downgrade(&self.inner),
        }
    }

    fn remove(&self, conn: &Arc<Connection>) {
        self.inner.remove(conn);
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .field("endpoints", &self.inner.buckets.len())
            .finish()
    }
}

impl PoolInner {
    fn remove(&self, conn: &Arc<Connection>) {
        if let Some(bucket) = self.buckets.get(conn.identity()) {
            lock(&bucket).retain(|c| !Arc::ptr_eq(c, conn));
        }
    }

    fn release(&self, conn: &Arc<Connection>) {
        let remaining = conn.release_stream();
        if conn.is_reusable() && !self.closed.load(Ordering::Acquire) {
            tracing::trace!(
                "Pool: released stream on connection {} ({} in use)",
                conn.id(),
                remaining
            );
            return;
        }
        self.remove(conn);
        if remaining == 0 {
            tracing::debug!(
                "Pool: closing connection {} for {} on release (unhealthy)",
                conn.id(),
                conn.identity().authority()
            );
            conn.close();
        }
    }
}

/// One claimed stream on a pooled connection. Dropping it releases the stream.
pub struct Lease {
    conn: Arc<Connection>,
    pool: Weak<PoolInner>,
}

impl Lease {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Release explicitly. Same as dropping.
    pub fn release(self) {}
}

impl std::ops::Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match self.pool.upgrade() {
            Some(pool) => pool.release(&self.conn),
            None => {
                if self.conn.release_stream() == 0 {
                    self.conn.close();
                }
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lease").field(&self.conn).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::connection::tests::{identity, test_connection};
    use crate::protocol::Protocol;

    #[tokio::test]
    async fn test_admit_then_acquire_reuses() {
        let pool = ConnectionPool::default();
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::Http11);

        let lease = pool.admit(conn).unwrap();
        let first_id = lease.id();
        assert!(pool.acquire(&id).unwrap().is_none());
        drop(lease);

        let again = pool.acquire(&id).unwrap().unwrap();
        assert_eq!(again.id(), first_id);
    }

    #[tokio::test]
    async fn test_equivalent_identity_finds_connection() {
        let pool = ConnectionPool::default();
        let a = identity("https://example.test/a?x=1");
        let b = identity("https://EXAMPLE.test:443/b");
        let (conn, _peer) = test_connection(&a, Protocol::H2);
        let first = pool.admit(conn).unwrap();

        let second = pool.acquire(&b).unwrap().unwrap();
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(second.in_use(), 2);
    }

    #[tokio::test]
    async fn test_admit_applies_stream_limit() {
        let pool = ConnectionPool::new(PoolConfig::new().max_streams_per_connection(1));
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        let _lease = pool.admit(conn).unwrap();
        assert!(pool.acquire(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_release_closes() {
        let pool = ConnectionPool::default();
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        let a = pool.admit(conn).unwrap();
        let b = pool.acquire(&id).unwrap().unwrap();
        let conn = Arc::clone(a.connection());

        conn.mark_unhealthy();
        drop(a);
        assert!(!conn.is_closed());
        assert!(pool.connections_for(&id).is_empty());
        drop(b);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_dead_connection_evicted_on_acquire() {
        let pool = ConnectionPool::default();
        let id = identity("https://example.test/");
        let (conn, peer) = test_connection(&id, Protocol::Http11);
        pool.admit(conn).unwrap().release();

        drop(peer);
        assert!(pool.acquire(&id).unwrap().is_none());
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_idle_evicts_longest_idle_first() {
        let pool = ConnectionPool::new(PoolConfig::new().max_idle_connections(1));
        let a = identity("https://a.test/");
        let b = identity("https://b.test/");
        let (old, _pa) = test_connection(&a, Protocol::H2);
        let old = pool.admit(old).unwrap();
        let old_conn = Arc::clone(old.connection());
        drop(old);

        tokio::time::advance(Duration::from_secs(10)).await;
        let (new, _pb) = test_connection(&b, Protocol::H2);
        pool.admit(new).unwrap().release();

        assert_eq!(pool.sweep(), 1);
        assert!(old_conn.is_closed());
        assert_eq!(pool.stats().idle_connections, 1);
        assert!(pool.acquire(&b).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_evict_all_idle_keeps_in_use() {
        let pool = ConnectionPool::default();
        let id = identity("https://example.test/");
        let (busy, _p1) = test_connection(&id, Protocol::Http11);
        let (idle, _p2) = test_connection(&id, Protocol::Http11);
        let _held = pool.admit(busy).unwrap();
        pool.admit(idle).unwrap().release();

        assert_eq!(pool.evict_all_idle(), 1);
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_streams, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let pool = ConnectionPool::default();
        let id = identity("https://example.test/");
        let (held, _p1) = test_connection(&id, Protocol::Http11);
        let (late, _p2) = test_connection(&id, Protocol::Http11);
        let held = pool.admit(held).unwrap();

        pool.shutdown();
        assert!(held.is_closed());
        assert!(matches!(pool.acquire(&id), Err(Error::PoolClosed)));
        assert!(matches!(pool.admit(late), Err(Error::PoolClosed)));
        drop(held);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_and_stops() {
        let pool = ConnectionPool::new(
            PoolConfig::new()
                .idle_timeout(Duration::from_secs(5))
                .sweep_interval(Duration::from_secs(1)),
        );
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        pool.admit(conn).unwrap().release();

        let handle = pool.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(7500)).await;
        assert_eq!(pool.stats().total_connections, 0);

        pool.shutdown();
        handle.await.unwrap();
    }
}
