//! Gateway counters and access metrics.
//!
//! The collector is an explicit [`Metrics`] handle shared by `Arc`; there is
//! no process-wide singleton. The `/metrics` endpoint serializes
//! [`MetricsSnapshot`]; access records themselves are `tracing` events emitted
//! where the request completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BackendConfig;

#[derive(Debug, Default)]
struct BackendCounters {
    host: String,
    port: u16,
    requests_total: AtomicU64,
    requests_error: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
}

impl BackendCounters {
    fn latency_avg_ms(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.latency_sum_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn error_rate(&self) -> f64 {
        let total = self.requests_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.requests_error.load(Ordering::Relaxed) as f64 / total as f64
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestMetrics {
    pub total: u64,
    pub active: u64,
    pub success: u64,
    pub error: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemMetrics {
    pub uptime_seconds: u64,
    pub connections_active: u64,
    pub connections_total: u64,
    pub memory_cache_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BackendSnapshot {
    pub host: String,
    pub port: u16,
    pub requests: u64,
    pub errors: u64,
    pub latency_avg_ms: f64,
    pub error_rate: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub cache: CacheMetrics,
    pub system: SystemMetrics,
    pub backends: Vec<BackendSnapshot>,
}

pub struct Metrics {
    start: Instant,
    requests_total: AtomicU64,
    requests_active: AtomicU64,
    requests_success: AtomicU64,
    requests_error: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    cache_memory_bytes: AtomicU64,
    backends: Mutex<HashMap<String, Arc<BackendCounters>>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_active: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            cache_memory_bytes: AtomicU64::new(0),
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the per-backend counter set for a new configuration generation.
    pub fn set_backends(&self, backends: &[BackendConfig]) {
        let mut map = self.lock_backends();
        map.clear();
        for backend in backends {
            map.insert(
                backend.key(),
                Arc::new(BackendCounters {
                    host: backend.host.clone(),
                    port: backend.port,
                    ..BackendCounters::default()
                }),
            );
        }
    }

    pub fn request_started(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self, success: bool) {
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_cache_memory(&self, bytes: u64) {
        self.cache_memory_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Record one proxied request against a backend's counters.
    pub fn backend_request(&self, host: &str, port: u16, success: bool, latency: Duration) {
        let key = format!("{host}:{port}");
        let counters = self.lock_backends().get(&key).cloned();
        if let Some(counters) = counters {
            counters.requests_total.fetch_add(1, Ordering::Relaxed);
            if !success {
                counters.requests_error.fetch_add(1, Ordering::Relaxed);
            }
            counters
                .latency_sum_ms
                .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
            counters.latency_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let backends = {
            let map = self.lock_backends();
            let mut list: Vec<BackendSnapshot> = map
                .values()
                .map(|b| BackendSnapshot {
                    host: b.host.clone(),
                    port: b.port,
                    requests: b.requests_total.load(Ordering::Relaxed),
                    errors: b.requests_error.load(Ordering::Relaxed),
                    latency_avg_ms: b.latency_avg_ms(),
                    error_rate: b.error_rate(),
                })
                .collect();
            list.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
            list
        };

        MetricsSnapshot {
            requests: RequestMetrics {
                total: self.requests_total.load(Ordering::Relaxed),
                active: self.requests_active.load(Ordering::Relaxed),
                success: self.requests_success.load(Ordering::Relaxed),
                error: self.requests_error.load(Ordering::Relaxed),
            },
            cache: CacheMetrics {
                hits,
                misses,
                hit_rate: if lookups > 0 {
                    hits as f64 / lookups as f64
                } else {
                    0.0
                },
            },
            system: SystemMetrics {
                uptime_seconds: self.start.elapsed().as_secs(),
                connections_active: self.connections_active.load(Ordering::Relaxed),
                connections_total: self.connections_total.load(Ordering::Relaxed),
                memory_cache_bytes: self.cache_memory_bytes.load(Ordering::Relaxed),
            },
            backends,
        }
    }

    fn lock_backends(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<BackendCounters>>> {
        self.backends.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(host: &str, port: u16) -> BackendConfig {
        BackendConfig {
            host: host.to_string(),
            port,
            weight: 1,
        }
    }

    #[test]
    fn request_counters_track_lifecycle() {
        let metrics = Metrics::new();
        metrics.request_started();
        metrics.request_started();
        metrics.request_completed(true);
        metrics.request_completed(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests.total, 2);
        assert_eq!(snap.requests.active, 0);
        assert_eq!(snap.requests.success, 1);
        assert_eq!(snap.requests.error, 1);
    }

    #[test]
    fn cache_hit_rate_is_computed() {
        let metrics = Metrics::new();
        metrics.cache_hit();
        metrics.cache_hit();
        metrics.cache_hit();
        metrics.cache_miss();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache.hits, 3);
        assert_eq!(snap.cache.misses, 1);
        assert!((snap.cache.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn backend_latency_averages() {
        let metrics = Metrics::new();
        metrics.set_backends(&[backend("b1", 9001)]);
        metrics.backend_request("b1", 9001, true, Duration::from_millis(10));
        metrics.backend_request("b1", 9001, false, Duration::from_millis(30));
        // Unknown backends are ignored rather than invented.
        metrics.backend_request("nope", 1, true, Duration::from_millis(5));

        let snap = metrics.snapshot();
        assert_eq!(snap.backends.len(), 1);
        let b = &snap.backends[0];
        assert_eq!(b.requests, 2);
        assert_eq!(b.errors, 1);
        assert!((b.latency_avg_ms - 20.0).abs() < f64::EPSILON);
        assert!((b.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_serializes_with_expected_keys() {
        let metrics = Metrics::new();
        metrics.set_backends(&[backend("b1", 9001)]);
        let json = serde_json::to_value(metrics.snapshot()).expect("serializable");
        assert!(json.get("requests").is_some());
        assert!(json.get("cache").is_some());
        assert!(json["system"].get("uptime_seconds").is_some());
        assert_eq!(json["backends"][0]["host"], "b1");
    }

    #[test]
    fn set_backends_replaces_counter_set() {
        let metrics = Metrics::new();
        metrics.set_backends(&[backend("b1", 9001)]);
        metrics.backend_request("b1", 9001, true, Duration::from_millis(1));
        metrics.set_backends(&[backend("b2", 9002)]);

        let snap = metrics.snapshot();
        assert_eq!(snap.backends.len(), 1);
        assert_eq!(snap.backends[0].host, "b2");
        assert_eq!(snap.backends[0].requests, 0);
    }
}
