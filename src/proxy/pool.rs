//! Per-backend connection pooling with RAII checkout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::watch;

use crate::config::{BackendConfig, ProxySettings};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub pool_size_per_backend: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub cleanup_interval: Duration,
    pub enable_keep_alive: bool,
}

impl From<&ProxySettings> for PoolConfig {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            pool_size_per_backend: settings.pool_size_per_backend,
            idle_timeout: settings.idle_timeout(),
            connect_timeout: settings.connect_timeout(),
            cleanup_interval: settings.cleanup_interval(),
            enable_keep_alive: settings.enable_keep_alive,
        }
    }
}

/// A reusable upstream connection. At any instant it lives in exactly one
/// place: its pool's idle deque, a [`ConnectionGuard`], or nowhere (dropped).
pub struct PooledConnection {
    stream: TcpStream,
    backend: BackendConfig,
    last_returned_at: Instant,
    uses: u64,
}

/// Scoped owner of a pooled connection.
///
/// Dropping the guard returns the connection to its pool unless
/// [`mark_failed`](Self::mark_failed) was called, in which case the
/// connection is destroyed instead of recycled.
pub struct ConnectionGuard {
    conn: Option<PooledConnection>,
    pool: Arc<BackendPool>,
    failed: bool,
}

impl ConnectionGuard {
    fn new(mut conn: PooledConnection, pool: Arc<BackendPool>) -> Self {
        conn.uses += 1;
        Self {
            conn: Some(conn),
            pool,
            failed: false,
        }
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self
            .conn
            .as_mut()
            .expect("guard holds its connection until drop")
            .stream
    }

    pub fn backend(&self) -> &BackendConfig {
        &self
            .conn
            .as_ref()
            .expect("guard holds its connection until drop")
            .backend
    }

    pub fn uses(&self) -> u64 {
        self.conn
            .as_ref()
            .expect("guard holds its connection until drop")
            .uses
    }

    /// Prevent this connection from returning to the pool.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, !self.failed);
        }
    }
}

/// Pool of reusable connections to one backend.
pub struct BackendPool {
    backend: BackendConfig,
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledConnection>>,
    in_use: AtomicUsize,
    total_created: AtomicUsize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
}

impl BackendPool {
    fn new(backend: BackendConfig, config: PoolConfig) -> Self {
        Self {
            backend,
            config,
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
            total_created: AtomicUsize::new(0),
        }
    }

    /// Check out a connection: reuse the most recently returned one that is
    /// still open, dial a new one under the size cap, or report exhaustion.
    pub async fn checkout(self: &Arc<Self>) -> Option<ConnectionGuard> {
        loop {
            let candidate = self.lock_idle().pop_front();
            let Some(mut conn) = candidate else {
                break;
            };
            if connection_is_open(&mut conn.stream) {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Some(ConnectionGuard::new(conn, self.clone()));
            }
            tracing::debug!(backend = %self.backend.addr(), "discarding stale pooled connection");
        }

        let total = self.available_count() + self.in_use.load(Ordering::Relaxed);
        if total >= self.config.pool_size_per_backend {
            tracing::warn!(
                backend = %self.backend.addr(),
                max = self.config.pool_size_per_backend,
                "connection pool exhausted"
            );
            return None;
        }

        match self.connect().await {
            Ok(stream) => {
                let created = self.total_created.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    backend = %self.backend.addr(),
                    total_created = created,
                    "created new backend connection"
                );
                self.in_use.fetch_add(1, Ordering::Relaxed);
                Some(ConnectionGuard::new(
                    PooledConnection {
                        stream,
                        backend: self.backend.clone(),
                        last_returned_at: Instant::now(),
                        uses: 0,
                    },
                    self.clone(),
                ))
            }
            Err(e) => {
                tracing::warn!(backend = %self.backend.addr(), error = %e, "failed to connect to backend");
                None
            }
        }
    }

    fn release(&self, mut conn: PooledConnection, reusable: bool) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        conn.last_returned_at = Instant::now();

        if reusable {
            // LIFO: the most recently used connection is the least likely to
            // have been idled out by the backend.
            let mut idle = self.lock_idle();
            idle.push_front(conn);
            tracing::debug!(
                backend = %self.backend.addr(),
                available = idle.len(),
                in_use = self.in_use.load(Ordering::Relaxed),
                "returned connection to pool"
            );
        } else {
            tracing::debug!(backend = %self.backend.addr(), "discarding non-reusable connection");
        }
    }

    /// Drop idle connections past the idle timeout or whose peer hung up.
    pub async fn reap_idle(&self) {
        let drained: Vec<PooledConnection> = {
            let mut idle = self.lock_idle();
            idle.drain(..).collect()
        };

        let now = Instant::now();
        let mut kept = Vec::new();
        let mut removed = 0usize;
        for mut conn in drained {
            let aged_out = now.duration_since(conn.last_returned_at) > self.config.idle_timeout;
            if aged_out || !connection_is_open(&mut conn.stream) {
                removed += 1;
                continue;
            }
            kept.push(conn);
        }

        {
            let mut idle = self.lock_idle();
            for conn in kept {
                idle.push_back(conn);
            }
        }

        if removed > 0 {
            tracing::debug!(
                backend = %self.backend.addr(),
                removed,
                "reaped idle connections"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.available_count();
        let in_use = self.in_use.load(Ordering::Relaxed);
        PoolStats {
            available,
            in_use,
            total: available + in_use,
        }
    }

    fn available_count(&self) -> usize {
        self.lock_idle().len()
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        let addrs = lookup_host((self.backend.host.as_str(), self.backend.port)).await?;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }?;
            if self.config.enable_keep_alive {
                socket.set_keepalive(true)?;
            }
            match tokio::time::timeout(self.config.connect_timeout, socket.connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<PooledConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Zero-timeout openness poll: a closed peer reports ready-with-EOF, a live
/// idle connection reports pending. Unsolicited bytes on an idle connection
/// mean the framing is out of sync, which also disqualifies it.
fn connection_is_open(stream: &mut TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).now_or_never() {
        None => true,
        Some(Ok(0)) => false,
        Some(Ok(_)) => false,
        Some(Err(_)) => false,
    }
}

/// Owns one [`BackendPool`] per configured backend.
pub struct ConnectionPoolManager {
    config: PoolConfig,
    pools: RwLock<HashMap<String, Arc<BackendPool>>>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Align the pool set with a new backend list: pools for vanished
    /// backends are destroyed (their checked-out connections die with their
    /// guards), surviving pools are preserved, new backends get empty pools.
    pub fn set_backends(&self, backends: &[BackendConfig]) {
        let keys: HashSet<String> = backends.iter().map(|b| b.key()).collect();
        let mut pools = self.write_pools();

        pools.retain(|key, _| {
            let keep = keys.contains(key);
            if !keep {
                tracing::info!(backend = %key, "removing connection pool");
            }
            keep
        });

        for backend in backends {
            pools.entry(backend.key()).or_insert_with(|| {
                tracing::info!(backend = %backend.addr(), "creating connection pool");
                Arc::new(BackendPool::new(backend.clone(), self.config.clone()))
            });
        }
    }

    pub async fn checkout(&self, backend: &BackendConfig) -> Option<ConnectionGuard> {
        let pool = self.read_pools().get(&backend.key()).cloned();
        match pool {
            Some(pool) => pool.checkout().await,
            None => {
                tracing::warn!(backend = %backend.addr(), "no connection pool for backend");
                None
            }
        }
    }

    pub fn stats(&self, backend: &BackendConfig) -> Option<PoolStats> {
        self.read_pools()
            .get(&backend.key())
            .map(|pool| pool.stats())
    }

    pub async fn reap_idle(&self) {
        let pools: Vec<Arc<BackendPool>> = self.read_pools().values().cloned().collect();
        for pool in pools {
            pool.reap_idle().await;
        }
    }

    /// Periodic reaper task.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.cleanup_interval.as_secs(),
            "connection pool reaper started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("connection pool reaper stopped");
                    return;
                }
            }
            self.reap_idle().await;
        }
    }

    fn read_pools(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<BackendPool>>> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pools(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<BackendPool>>> {
        self.pools.write().unwrap_or_else(PoisonError::into_inner)
    }
}
