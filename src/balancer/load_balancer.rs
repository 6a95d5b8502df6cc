//! Smooth weighted round-robin dispatch over healthy backends.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::balancer::health::HealthChecker;
use crate::config::BackendConfig;

/// Result of a dispatch decision.
#[derive(Clone, Debug)]
pub struct BackendSelection {
    pub backend: BackendConfig,
    pub index: usize,
}

struct DispatcherEntry {
    config: BackendConfig,
    /// SWRR accumulator. Every selection adds the entry's weight to all
    /// healthy accumulators and subtracts the healthy total from the winner,
    /// so over any window of `total` selections each backend wins exactly
    /// `weight` times.
    current_weight: AtomicI64,
}

/// SWRR load balancer.
///
/// `select` works on an `Arc` snapshot of the entry vector, so reconfiguration
/// never blocks in-flight selections; the accumulators themselves are atomics.
/// Concurrent selections may interleave on the accumulators, which can perturb
/// strict smoothness but never the totals: every add is paired with exactly
/// one subtract of the healthy weight sum.
pub struct LoadBalancer {
    health: Arc<HealthChecker>,
    entries: Mutex<Arc<Vec<Arc<DispatcherEntry>>>>,
}

impl LoadBalancer {
    pub fn new(health: Arc<HealthChecker>) -> Self {
        Self {
            health,
            entries: Mutex::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the backend set. Accumulators reset to zero.
    pub fn set_backends(&self, backends: &[BackendConfig]) {
        let entries: Vec<Arc<DispatcherEntry>> = backends
            .iter()
            .map(|config| {
                Arc::new(DispatcherEntry {
                    config: config.clone(),
                    current_weight: AtomicI64::new(0),
                })
            })
            .collect();

        let total: u64 = backends.iter().map(|b| u64::from(b.weight)).sum();
        tracing::info!(
            backends = entries.len(),
            total_weight = total,
            "load balancer configured"
        );

        *self.lock_entries() = Arc::new(entries);
    }

    /// Pick the next backend, or `None` when nothing healthy remains.
    pub fn select(&self) -> Option<BackendSelection> {
        let snapshot = self.lock_entries().clone();
        if snapshot.is_empty() {
            tracing::warn!("no backends configured");
            return None;
        }

        // One lock acquisition for a consistent healthy view across both the
        // weight sum and the selection scan.
        let healthy = self.health.healthy_set();
        let flags: Vec<bool> = snapshot
            .iter()
            .map(|e| healthy.contains(&e.config.key()))
            .collect();

        let healthy_total: i64 = snapshot
            .iter()
            .zip(&flags)
            .filter(|(_, healthy)| **healthy)
            .map(|(e, _)| i64::from(e.config.weight))
            .sum();
        if healthy_total == 0 {
            tracing::warn!("no healthy backends available");
            return None;
        }

        let mut best: Option<(usize, i64)> = None;
        for (index, entry) in snapshot.iter().enumerate() {
            if !flags[index] {
                continue;
            }
            let weight = i64::from(entry.config.weight);
            let new_weight = entry.current_weight.fetch_add(weight, Ordering::AcqRel) + weight;
            // Strict comparison keeps the earliest index on ties.
            if best.map_or(true, |(_, max)| new_weight > max) {
                best = Some((index, new_weight));
            }
        }

        let (index, _) = best?;
        let selected = &snapshot[index];
        selected
            .current_weight
            .fetch_sub(healthy_total, Ordering::Release);

        tracing::debug!(
            backend = %selected.config.addr(),
            index,
            weight = selected.config.weight,
            "selected backend"
        );

        Some(BackendSelection {
            backend: selected.config.clone(),
            index,
        })
    }

    pub fn backend_count(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn healthy_backend_count(&self) -> usize {
        let snapshot = self.lock_entries().clone();
        let healthy = self.health.healthy_set();
        snapshot
            .iter()
            .filter(|e| healthy.contains(&e.config.key()))
            .count()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Arc<Vec<Arc<DispatcherEntry>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
