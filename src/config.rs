//! Layered gateway configuration.
//!
//! Precedence, highest to lowest: command-line arguments, `NTONIX_*`
//! environment variables, JSON configuration file, built-in defaults.
//! `SIGHUP` drives [`ConfigManager::reload`], which re-reads the file,
//! re-applies the remembered overrides, and fans out to subscribers only if
//! validation passed; a failed reload leaves the running configuration alone.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    /// Worker threads for the runtime; 0 means one per available core.
    pub threads: usize,
    pub bind_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            threads: 0,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

/// A single upstream model server. Identity is `(host, port)`; the weight can
/// change between configuration generations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl BackendConfig {
    /// Map key shared by the health tracker, pool manager, and metrics.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_size_mb: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 512,
            ttl_seconds: 3600,
        }
    }
}

impl CacheSettings {
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub pool_size_per_backend: usize,
    pub idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_buffer_size: usize,
    pub stream_read_timeout_secs: u64,
    pub enable_keep_alive: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            pool_size_per_backend: 10,
            idle_timeout_secs: 60,
            cleanup_interval_secs: 30,
            connect_timeout_secs: 5,
            request_timeout_secs: 60,
            stream_buffer_size: 8192,
            stream_read_timeout_secs: 120,
            enable_keep_alive: true,
        }
    }
}

impl ProxySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_read_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub path: String,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            timeout_ms: 2000,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            path: "/health".to_string(),
        }
    }
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub backends: Vec<BackendConfig>,
    pub cache: CacheSettings,
    pub proxy: ProxySettings,
    pub health_check: HealthCheckSettings,
    pub logging: LogSettings,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(GatewayError::Config(
                "server.port must be non-zero".to_string(),
            ));
        }
        if self.server.bind_address.is_empty() {
            return Err(GatewayError::Config(
                "server.bind_address cannot be empty".to_string(),
            ));
        }

        for (i, backend) in self.backends.iter().enumerate() {
            if backend.host.is_empty() {
                return Err(GatewayError::Config(format!(
                    "backends[{i}].host cannot be empty"
                )));
            }
            if backend.port == 0 {
                return Err(GatewayError::Config(format!(
                    "backends[{i}].port must be non-zero"
                )));
            }
            if backend.weight == 0 {
                return Err(GatewayError::Config(format!(
                    "backends[{i}].weight must be non-zero"
                )));
            }
        }

        if self.cache.enabled && self.cache.max_size_mb == 0 {
            return Err(GatewayError::Config(
                "cache.max_size_mb must be non-zero when cache is enabled".to_string(),
            ));
        }

        if self.proxy.pool_size_per_backend == 0 {
            return Err(GatewayError::Config(
                "proxy.pool_size_per_backend must be non-zero".to_string(),
            ));
        }
        if self.proxy.stream_buffer_size == 0 {
            return Err(GatewayError::Config(
                "proxy.stream_buffer_size must be non-zero".to_string(),
            ));
        }

        if self.proxy.cleanup_interval_secs == 0 {
            return Err(GatewayError::Config(
                "proxy.cleanup_interval_secs must be non-zero".to_string(),
            ));
        }

        if self.health_check.unhealthy_threshold == 0 || self.health_check.healthy_threshold == 0 {
            return Err(GatewayError::Config(
                "health_check thresholds must be non-zero".to_string(),
            ));
        }
        if self.health_check.interval_ms == 0 {
            return Err(GatewayError::Config(
                "health_check.interval_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse a `host:port` backend spec (weight defaults to 1).
pub fn parse_backend_spec(spec: &str) -> Result<BackendConfig> {
    let spec = spec.trim();
    let Some(colon) = spec.rfind(':') else {
        return Err(GatewayError::Config(format!(
            "invalid backend (expected host:port): {spec}"
        )));
    };
    let host = spec[..colon].to_string();
    let port: u16 = spec[colon + 1..]
        .parse()
        .map_err(|_| GatewayError::Config(format!("invalid port in backend: {spec}")))?;
    if host.is_empty() {
        return Err(GatewayError::Config(format!(
            "invalid backend (empty host): {spec}"
        )));
    }
    Ok(BackendConfig {
        host,
        port,
        weight: 1,
    })
}

fn parse_config_json(raw: &str) -> Result<Config> {
    serde_json::from_str(raw)
        .map_err(|e| GatewayError::Config(format!("invalid JSON in configuration file: {e}")))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("cannot read configuration file {}: {e}", path.display()))
    })?;
    parse_config_json(&raw)
}

/// Apply `NTONIX_*` environment overrides. The lookup is injected so tests
/// can drive this without touching the process environment.
fn apply_environment_overrides(
    config: &mut Config,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = lookup("NTONIX_PORT") {
        config.server.port = value
            .parse()
            .map_err(|_| GatewayError::Config(format!("invalid NTONIX_PORT value: {value}")))?;
    }
    if let Some(value) = lookup("NTONIX_THREADS") {
        config.server.threads = value
            .parse()
            .map_err(|_| GatewayError::Config(format!("invalid NTONIX_THREADS value: {value}")))?;
    }
    if let Some(value) = lookup("NTONIX_BIND") {
        config.server.bind_address = value;
    }

    if let Some(value) = lookup("NTONIX_BACKENDS") {
        config.backends.clear();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            config.backends.push(parse_backend_spec(part)?);
        }
    }

    if let Some(value) = lookup("NTONIX_CACHE_ENABLED") {
        config.cache.enabled = matches!(value.as_str(), "true" | "1" | "yes");
    }
    if let Some(value) = lookup("NTONIX_CACHE_SIZE_MB") {
        config.cache.max_size_mb = value.parse().map_err(|_| {
            GatewayError::Config(format!("invalid NTONIX_CACHE_SIZE_MB value: {value}"))
        })?;
    }
    if let Some(value) = lookup("NTONIX_CACHE_TTL") {
        config.cache.ttl_seconds = value
            .parse()
            .map_err(|_| GatewayError::Config(format!("invalid NTONIX_CACHE_TTL value: {value}")))?;
    }

    if let Some(value) = lookup("NTONIX_LOG_LEVEL") {
        config.logging.level = value;
    }

    Ok(())
}

/// CLI overrides remembered so reload can re-apply them on top of the file.
#[derive(Clone, Debug, Default)]
struct CliOverrides {
    port: Option<u16>,
    threads: Option<usize>,
    bind_address: Option<String>,
}

fn apply_cli_overrides(
    config: &mut Config,
    args: &[String],
) -> Result<CliOverrides> {
    let mut overrides = CliOverrides::default();

    fn value_of(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("missing value for {flag}")))
    }

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" | "-h" => {}
            "--config" | "-c" => {
                i += 1; // value consumed by the first pass
            }
            "--port" | "-p" => {
                let value = value_of(args, &mut i, "--port")?;
                let port = value
                    .parse()
                    .map_err(|_| GatewayError::Config(format!("invalid --port value: {value}")))?;
                overrides.port = Some(port);
                config.server.port = port;
            }
            "--threads" | "-t" => {
                let value = value_of(args, &mut i, "--threads")?;
                let threads = value.parse().map_err(|_| {
                    GatewayError::Config(format!("invalid --threads value: {value}"))
                })?;
                overrides.threads = Some(threads);
                config.server.threads = threads;
            }
            "--bind" | "-b" => {
                let value = value_of(args, &mut i, "--bind")?;
                overrides.bind_address = Some(value.clone());
                config.server.bind_address = value;
            }
            "--backends" => {
                let value = value_of(args, &mut i, "--backends")?;
                config.backends.push(parse_backend_spec(&value)?);
            }
            other => {
                if let Some(value) = other.strip_prefix("--port=") {
                    let port = value.parse().map_err(|_| {
                        GatewayError::Config(format!("invalid --port value: {value}"))
                    })?;
                    overrides.port = Some(port);
                    config.server.port = port;
                } else if let Some(value) = other.strip_prefix("--threads=") {
                    let threads = value.parse().map_err(|_| {
                        GatewayError::Config(format!("invalid --threads value: {value}"))
                    })?;
                    overrides.threads = Some(threads);
                    config.server.threads = threads;
                } else if let Some(value) = other.strip_prefix("--bind=") {
                    overrides.bind_address = Some(value.to_string());
                    config.server.bind_address = value.to_string();
                } else if let Some(value) = other.strip_prefix("--backends=") {
                    config.backends.push(parse_backend_spec(value)?);
                } else if other.starts_with("--config=") || other.starts_with("-c=") {
                    // consumed by the first pass
                } else {
                    return Err(GatewayError::Config(format!("unknown argument: {other}")));
                }
            }
        }
        i += 1;
    }

    Ok(overrides)
}

fn config_path_from_args(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if arg == "--config" || arg == "-c" {
            if let Some(value) = args.get(i + 1) {
                return Some(PathBuf::from(value));
            }
        } else if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("-c=") {
            return Some(PathBuf::from(value));
        }
        i += 1;
    }
    None
}

pub fn print_help(program: &str) {
    println!(
        "NTONIX - High-Performance AI Inference Gateway\n\
         \n\
         Usage: {program} [OPTIONS]\n\
         \n\
         Options:\n\
         \x20 -h, --help              Show this help message and exit\n\
         \x20 -c, --config FILE       Path to JSON configuration file\n\
         \x20 -p, --port PORT         Server HTTP port (default: 8080)\n\
         \x20 -t, --threads NUM       Number of I/O threads (default: CPU cores)\n\
         \x20 -b, --bind ADDRESS      Bind address (default: 0.0.0.0)\n\
         \x20 --backends HOST:PORT    Backend server (can be repeated)\n\
         \n\
         Environment Variables:\n\
         \x20 NTONIX_PORT, NTONIX_THREADS, NTONIX_BIND, NTONIX_BACKENDS,\n\
         \x20 NTONIX_CONFIG, NTONIX_CACHE_ENABLED, NTONIX_CACHE_SIZE_MB,\n\
         \x20 NTONIX_CACHE_TTL, NTONIX_LOG_LEVEL\n\
         \n\
         Configuration precedence: CLI > environment > file > defaults.\n\
         Send SIGHUP to reload backend configuration without restart."
    );
}

type ReloadCallback = Box<dyn Fn(&Config) + Send + Sync>;

struct ManagerInner {
    config: Config,
    config_path: Option<PathBuf>,
    cli: CliOverrides,
    callbacks: Vec<ReloadCallback>,
}

/// Owns the current configuration generation and the reload machinery.
pub struct ConfigManager {
    inner: Mutex<ManagerInner>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                config: Config::default(),
                config_path: None,
                cli: CliOverrides::default(),
                callbacks: Vec::new(),
            }),
        }
    }

    /// Construct with a fixed configuration, bypassing the layered loader.
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                config,
                config_path: None,
                cli: CliOverrides::default(),
                callbacks: Vec::new(),
            }),
        }
    }

    /// Run the layered loader. Returns `Ok(false)` when `--help` was
    /// requested and nothing should start.
    pub fn load(&self, args: &[String]) -> Result<bool> {
        if args.iter().any(|a| a == "--help" || a == "-h") {
            return Ok(false);
        }

        let mut config = Config::default();
        let mut config_path = config_path_from_args(args);
        if config_path.is_none() {
            config_path = std::env::var("NTONIX_CONFIG").ok().map(PathBuf::from);
        }

        if let Some(path) = &config_path {
            config = load_config_file(path)?;
        }

        apply_environment_overrides(&mut config, &|name| std::env::var(name).ok())?;
        let cli = apply_cli_overrides(&mut config, args)?;
        config.validate()?;

        let mut inner = self.lock();
        inner.config = config;
        inner.config_path = config_path;
        inner.cli = cli;
        tracing::info!("configuration loaded");
        Ok(true)
    }

    pub fn get(&self) -> Config {
        self.lock().config.clone()
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.lock().config_path.clone()
    }

    /// Subscribe to configuration changes delivered by [`reload`].
    pub fn on_reload(&self, callback: impl Fn(&Config) + Send + Sync + 'static) {
        self.lock().callbacks.push(Box::new(callback));
    }

    /// Re-read the configuration file and fan out the new generation.
    /// Any failure leaves the running configuration untouched.
    pub fn reload(&self) {
        let mut inner = self.lock();

        let Some(path) = inner.config_path.clone() else {
            tracing::warn!("no configuration file specified, reload skipped");
            return;
        };

        tracing::info!(path = %path.display(), "reloading configuration");

        let candidate = (|| -> Result<Config> {
            let mut config = load_config_file(&path)?;
            apply_environment_overrides(&mut config, &|name| std::env::var(name).ok())?;
            if let Some(port) = inner.cli.port {
                config.server.port = port;
            }
            if let Some(threads) = inner.cli.threads {
                config.server.threads = threads;
            }
            if let Some(bind) = &inner.cli.bind_address {
                config.server.bind_address = bind.clone();
            }
            config.validate()?;
            Ok(config)
        })();

        match candidate {
            Ok(config) => {
                if config == inner.config {
                    tracing::info!("configuration reloaded, no changes");
                    return;
                }
                inner.config = config.clone();
                tracing::info!(
                    backends = config.backends.len(),
                    "configuration changed, notifying subscribers"
                );
                for callback in &inner.callbacks {
                    callback(&config);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "configuration reload failed, keeping current configuration");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
