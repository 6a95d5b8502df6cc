use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ntonix::config::print_help;
use ntonix::server::{self, GatewayState};
use ntonix::{Config, ConfigManager};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let manager = Arc::new(ConfigManager::new());
    match manager.load(&args) {
        Ok(true) => {}
        Ok(false) => {
            print_help("ntonix");
            return;
        }
        Err(e) => {
            eprintln!("ntonix: {e}");
            std::process::exit(1);
        }
    }

    let config = manager.get();
    init_tracing(&config.logging.level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "NTONIX AI Inference Gateway");

    let worker_threads = if config.server.threads > 0 {
        config.server.threads
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    };
    tracing::info!(
        port = config.server.port,
        threads = worker_threads,
        bind = %config.server.bind_address,
        "configuration"
    );
    if config.backends.is_empty() {
        tracing::warn!("no backends configured, proxied requests will return 503");
    }
    for backend in &config.backends {
        tracing::info!(backend = %backend.addr(), weight = backend.weight, "backend configured");
    }
    if config.cache.enabled {
        tracing::info!(
            max_size_mb = config.cache.max_size_mb,
            ttl_secs = config.cache.ttl_seconds,
            "cache enabled"
        );
    } else {
        tracing::info!("cache disabled");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            std::process::exit(1);
        }
    };

    std::process::exit(runtime.block_on(run(manager, config)));
}

async fn run(manager: Arc<ConfigManager>, config: Config) -> i32 {
    let state = GatewayState::new(config.clone());

    {
        let state = state.clone();
        manager.on_reload(move |new_config| state.apply_config(new_config));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.health_check.enabled {
        tokio::spawn(state.health.clone().run(shutdown_rx.clone()));
    }
    tokio::spawn(state.pools.clone().run_reaper(shutdown_rx.clone()));

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                return;
            };
            while hangup.recv().await.is_some() {
                tracing::info!("SIGHUP received, reloading configuration");
                manager.reload();
            }
        });
    }

    let listener = match TcpListener::bind((config.server.bind_address.as_str(), config.server.port))
        .await
    {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(
                bind = %config.server.bind_address,
                port = config.server.port,
                error = %e,
                "failed to bind listener"
            );
            return 1;
        }
    };

    let serve_task = tokio::spawn(server::serve(listener, state.clone(), shutdown_rx));

    let mut term = signal(SignalKind::terminate()).ok();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = async {
            match term.as_mut() {
                Some(term) => { term.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => tracing::info!("SIGTERM received"),
    }

    let _ = shutdown_tx.send(true);
    let _ = serve_task.await;

    // Let in-flight connections drain against their own deadlines.
    let deadline = Instant::now() + Duration::from_secs(10);
    while state.metrics.snapshot().system.connections_active > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("server stopped gracefully");
    0
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
