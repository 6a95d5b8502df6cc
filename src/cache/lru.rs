//! Bounded, TTL-aware LRU store for completed upstream responses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

use super::key::CacheKey;

/// Snapshot of a cached response handed to callers on a hit.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub body: Bytes,
    pub content_type: String,
    pub size_bytes: usize,
    pub hit_count: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub max_size_bytes: usize,
}

struct StoredEntry {
    body: Bytes,
    content_type: String,
    size_bytes: usize,
    created_at: Instant,
    last_access: Instant,
    hit_count: u64,
}

struct Inner {
    map: HashMap<u64, StoredEntry>,
    /// Recency list of keys. Front is most recently used; eviction pops the back.
    order: VecDeque<u64>,
    size_bytes: usize,
    max_size_bytes: usize,
    ttl: Duration,
}

/// Thread-safe LRU + TTL cache.
///
/// One reader-writer lock guards the index, the recency list, and the size
/// accumulator. The statistics counters are separate atomics so monitoring
/// endpoints can read them without contending on the lock. Expiry is lazy:
/// an entry past its TTL is removed by the `get` that observes it.
pub struct LruCache {
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl LruCache {
    pub fn new(max_size_bytes: usize, ttl: Duration) -> Self {
        tracing::debug!(
            max_size_mb = max_size_bytes / (1024 * 1024),
            ttl_secs = ttl.as_secs(),
            "LRU cache initialized"
        );
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
                size_bytes: 0,
                max_size_bytes,
                ttl,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Look up an entry. Valid hits refresh the entry's recency and hit count.
    pub fn get(&self, key: CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();

        // Fast path under the shared lock: copy the entry out, or learn that
        // it is absent or expired.
        let hit = {
            let inner = self.read();
            match inner.map.get(&key.0) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if now.duration_since(entry.created_at) > inner.ttl => None,
                Some(entry) => Some(CacheEntry {
                    body: entry.body.clone(),
                    content_type: entry.content_type.clone(),
                    size_bytes: entry.size_bytes,
                    hit_count: entry.hit_count + 1,
                }),
            }
        };

        if let Some(result) = hit {
            // Upgrade to touch recency. The entry may have been removed or
            // replaced in the window; the copy already made stands either
            // way, since the read above observed it live.
            let mut guard = self.write();
            let inner = &mut *guard;
            if let Some(entry) = inner.map.get_mut(&key.0) {
                entry.last_access = now;
                entry.hit_count += 1;
                touch_front(&mut inner.order, key.0);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(result);
        }

        // Expired entry: upgrade and recheck, another writer may have acted.
        let mut guard = self.write();
        let inner = &mut *guard;
        let stale = inner
            .map
            .get(&key.0)
            .map(|entry| (now.duration_since(entry.created_at) > inner.ttl, entry.size_bytes));
        if let Some((true, size)) = stale {
            inner.map.remove(&key.0);
            inner.order.retain(|k| *k != key.0);
            inner.size_bytes = inner.size_bytes.saturating_sub(size);
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry and restore the size invariant by evicting
    /// from the least-recently-used end. Entries larger than the whole cache
    /// are refused.
    pub fn put(&self, key: CacheKey, body: Bytes, content_type: impl Into<String>) {
        let size = body.len();
        let now = Instant::now();

        let mut guard = self.write();
        let inner = &mut *guard;

        if size > inner.max_size_bytes {
            tracing::debug!(
                key = %key,
                size,
                max = inner.max_size_bytes,
                "cache entry larger than the cache, skipping"
            );
            return;
        }

        let entry = StoredEntry {
            body,
            content_type: content_type.into(),
            size_bytes: size,
            created_at: now,
            last_access: now,
            hit_count: 0,
        };

        match inner.map.get_mut(&key.0) {
            Some(existing) => {
                let old_size = existing.size_bytes;
                *existing = entry;
                inner.size_bytes = inner.size_bytes - old_size + size;
            }
            None => {
                inner.map.insert(key.0, entry);
                inner.size_bytes += size;
            }
        }
        touch_front(&mut inner.order, key.0);

        self.evict_locked(inner);
    }

    pub fn remove(&self, key: CacheKey) -> bool {
        let mut guard = self.write();
        let inner = &mut *guard;
        match inner.map.remove(&key.0) {
            Some(entry) => {
                inner.size_bytes = inner.size_bytes.saturating_sub(entry.size_bytes);
                inner.order.retain(|k| *k != key.0);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut guard = self.write();
        let count = guard.map.len();
        guard.map.clear();
        guard.order.clear();
        guard.size_bytes = 0;
        tracing::info!(entries = count, "cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.read();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            entries: inner.map.len(),
            size_bytes: inner.size_bytes,
            max_size_bytes: inner.max_size_bytes,
        }
    }

    /// Apply a new size cap and TTL; shrinking the cap evicts immediately.
    pub fn reconfigure(&self, max_size_bytes: usize, ttl: Duration) {
        let mut guard = self.write();
        let inner = &mut *guard;
        inner.max_size_bytes = max_size_bytes;
        inner.ttl = ttl;
        tracing::info!(
            max_size_mb = max_size_bytes / (1024 * 1024),
            ttl_secs = ttl.as_secs(),
            "cache reconfigured"
        );
        self.evict_locked(inner);
    }

    fn evict_locked(&self, inner: &mut Inner) {
        while inner.size_bytes > inner.max_size_bytes {
            let Some(victim) = inner.order.pop_back() else {
                break;
            };
            if let Some(entry) = inner.map.remove(&victim) {
                inner.size_bytes = inner.size_bytes.saturating_sub(entry.size_bytes);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    key = %CacheKey(victim),
                    size = entry.size_bytes,
                    idle_ms = entry.last_access.elapsed().as_millis() as u64,
                    "evicted cache entry"
                );
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn touch_front(order: &mut VecDeque<u64>, key: u64) {
    if order.front() != Some(&key) {
        order.retain(|k| *k != key);
        order.push_front(key);
    }
}
