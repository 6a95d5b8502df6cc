//! Backend health monitoring with hysteresis.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::{BackendConfig, HealthCheckSettings};
use crate::http1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendState {
    Healthy,
    Unhealthy,
    /// Operator-requested removal from rotation. Probes never enter or leave
    /// this state; it counts as unhealthy for dispatch.
    Draining,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Healthy => "healthy",
            BackendState::Unhealthy => "unhealthy",
            BackendState::Draining => "draining",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendHealth {
    pub config: BackendConfig,
    pub state: BackendState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe_at: Instant,
    pub last_latency: Duration,
}

pub type StateChangeCallback =
    Box<dyn Fn(&BackendConfig, BackendState, BackendState) + Send + Sync>;

/// Tracks per-backend health driven by periodic probes.
///
/// Probes use a fresh short-lived connection each time; pooled connections
/// are never consumed for health checking. State flips only after the
/// configured number of consecutive confirmations, so a single blip cannot
/// toggle a backend in and out of rotation.
pub struct HealthChecker {
    settings: HealthCheckSettings,
    backends: RwLock<HashMap<String, BackendHealth>>,
    callbacks: Mutex<Vec<StateChangeCallback>>,
}

impl HealthChecker {
    pub fn new(settings: HealthCheckSettings) -> Self {
        tracing::debug!(
            interval_ms = settings.interval_ms,
            timeout_ms = settings.timeout_ms,
            unhealthy_threshold = settings.unhealthy_threshold,
            healthy_threshold = settings.healthy_threshold,
            "health checker created"
        );
        Self {
            settings,
            backends: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Install a new backend set. Backends present in both generations keep
    /// their health state (with the possibly-changed weight); new backends
    /// are admitted optimistically as `Healthy`; removed ones are forgotten.
    pub fn set_backends(&self, backends: &[BackendConfig]) {
        let now = Instant::now();
        let mut map = self.write();
        let mut next: HashMap<String, BackendHealth> = HashMap::new();

        for backend in backends {
            let key = backend.key();
            match map.remove(&key) {
                Some(mut existing) => {
                    existing.config = backend.clone();
                    next.insert(key, existing);
                }
                None => {
                    tracing::info!(backend = %backend.addr(), weight = backend.weight, "added backend");
                    next.insert(
                        key,
                        BackendHealth {
                            config: backend.clone(),
                            state: BackendState::Healthy,
                            consecutive_failures: 0,
                            consecutive_successes: 0,
                            last_probe_at: now,
                            last_latency: Duration::ZERO,
                        },
                    );
                }
            }
        }

        for (_, health) in map.iter() {
            tracing::info!(backend = %health.config.addr(), "removed backend");
        }

        *map = next;
    }

    pub fn is_healthy(&self, backend: &BackendConfig) -> bool {
        self.read()
            .get(&backend.key())
            .map(|h| h.state == BackendState::Healthy)
            .unwrap_or(false)
    }

    /// Keys of backends currently in rotation, in one lock acquisition.
    pub fn healthy_set(&self) -> HashSet<String> {
        self.read()
            .values()
            .filter(|h| h.state == BackendState::Healthy)
            .map(|h| h.config.key())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<BackendHealth> {
        self.read().values().cloned().collect()
    }

    pub fn on_state_change(
        &self,
        callback: impl Fn(&BackendConfig, BackendState, BackendState) + Send + Sync + 'static,
    ) {
        self.lock_callbacks().push(Box::new(callback));
    }

    /// Operator hook: put a backend into or out of `Draining`.
    pub fn set_draining(&self, backend: &BackendConfig, draining: bool) {
        let target = if draining {
            BackendState::Draining
        } else {
            BackendState::Healthy
        };

        let old_state = {
            let mut map = self.write();
            let Some(health) = map.get_mut(&backend.key()) else {
                return;
            };
            if health.state == target {
                return;
            }
            let old = health.state;
            health.state = target;
            old
        };

        tracing::info!(
            backend = %backend.addr(),
            from = old_state.as_str(),
            to = target.as_str(),
            "backend state changed"
        );
        self.fire_callbacks(backend, old_state, target);
    }

    /// Feed one probe outcome through the state machine. Public so the probe
    /// loop and passive observers share a single transition path.
    pub fn record_result(&self, backend: &BackendConfig, success: bool, latency: Duration) {
        let transition = {
            let mut map = self.write();
            let Some(health) = map.get_mut(&backend.key()) else {
                return; // backend was removed while the probe was in flight
            };

            health.last_probe_at = Instant::now();
            health.last_latency = latency;

            let old_state = health.state;
            let mut new_state = old_state;

            if success {
                health.consecutive_failures = 0;
                health.consecutive_successes += 1;
                if health.state == BackendState::Unhealthy
                    && health.consecutive_successes >= self.settings.healthy_threshold
                {
                    new_state = BackendState::Healthy;
                }
            } else {
                health.consecutive_successes = 0;
                health.consecutive_failures += 1;
                if health.state == BackendState::Healthy
                    && health.consecutive_failures >= self.settings.unhealthy_threshold
                {
                    new_state = BackendState::Unhealthy;
                }
            }

            if new_state != old_state {
                health.state = new_state;
                Some((old_state, new_state))
            } else {
                None
            }
        };

        if let Some((old_state, new_state)) = transition {
            tracing::info!(
                backend = %backend.addr(),
                from = old_state.as_str(),
                to = new_state.as_str(),
                "backend state changed"
            );
            self.fire_callbacks(backend, old_state, new_state);
        }
    }

    /// Probe loop. Fires one round immediately, then every configured
    /// interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("health checker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("health checker stopped");
                    return;
                }
            }

            let targets: Vec<BackendConfig> =
                self.read().values().map(|h| h.config.clone()).collect();
            for backend in targets {
                let checker = self.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let success = probe_backend(&checker.settings, &backend).await;
                    let latency = started.elapsed();
                    tracing::debug!(
                        backend = %backend.addr(),
                        success,
                        latency_ms = latency.as_millis() as u64,
                        "health probe completed"
                    );
                    checker.record_result(&backend, success, latency);
                });
            }
        }
    }

    fn fire_callbacks(&self, backend: &BackendConfig, old: BackendState, new: BackendState) {
        for callback in self.lock_callbacks().iter() {
            callback(backend, old, new);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, BackendHealth>> {
        self.backends.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, BackendHealth>> {
        self.backends.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Vec<StateChangeCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One probe on a fresh connection: `GET <path>` with `Connection: close`,
/// success iff the status is in `[200, 300)`. DNS, connect, write, and read
/// failures and the overall deadline all count as probe failures.
async fn probe_backend(settings: &HealthCheckSettings, backend: &BackendConfig) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((backend.host.as_str(), backend.port)).await?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: NTONIX-HealthChecker/1.0\r\nConnection: close\r\n\r\n",
            settings.path, backend.host, backend.port
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = bytes::BytesMut::new();
        let head = http1::read_response_head(&mut stream, &mut buf)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok::<u16, std::io::Error>(head.status)
    };

    match tokio::time::timeout(settings.timeout(), attempt).await {
        Ok(Ok(status)) => (200..300).contains(&status),
        Ok(Err(e)) => {
            tracing::debug!(backend = %backend.addr(), error = %e, "health probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(backend = %backend.addr(), "health probe timed out");
            false
        }
    }
}
