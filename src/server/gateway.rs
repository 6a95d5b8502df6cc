//! Gateway request handling: endpoint dispatch and the proxied completion flow.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::net::TcpStream;

use crate::balancer::{HealthChecker, LoadBalancer};
use crate::cache::{generate_cache_key, should_bypass_cache, LruCache};
use crate::config::Config;
use crate::http1::{Request, Response};
use crate::observability::Metrics;
use crate::proxy::{
    is_streaming_request, ConnectionPoolManager, ForwardOutcome, Forwarder, ForwarderConfig,
    PoolConfig,
};

/// Everything a request handler needs, shared across connections.
pub struct GatewayState {
    config: RwLock<Arc<Config>>,
    pub cache: Arc<LruCache>,
    pub health: Arc<HealthChecker>,
    pub balancer: Arc<LoadBalancer>,
    pub pools: Arc<ConnectionPoolManager>,
    pub forwarder: Forwarder,
    pub metrics: Arc<Metrics>,
}

impl GatewayState {
    pub fn new(config: Config) -> Arc<Self> {
        let cache = Arc::new(LruCache::new(
            config.cache.max_size_bytes(),
            config.cache.ttl(),
        ));
        let health = Arc::new(HealthChecker::new(config.health_check.clone()));
        let balancer = Arc::new(LoadBalancer::new(health.clone()));
        let pools = Arc::new(ConnectionPoolManager::new(PoolConfig::from(&config.proxy)));
        let forwarder = Forwarder::new(pools.clone(), ForwarderConfig::from(&config.proxy));
        let metrics = Arc::new(Metrics::new());

        health.set_backends(&config.backends);
        balancer.set_backends(&config.backends);
        pools.set_backends(&config.backends);
        metrics.set_backends(&config.backends);

        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            cache,
            health,
            balancer,
            pools,
            forwarder,
            metrics,
        })
    }

    pub fn current_config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver a new configuration generation to every subsystem. In-flight
    /// requests keep the views they already hold.
    pub fn apply_config(&self, config: &Config) {
        self.health.set_backends(&config.backends);
        self.balancer.set_backends(&config.backends);
        self.pools.set_backends(&config.backends);
        self.metrics.set_backends(&config.backends);
        self.cache
            .reconfigure(config.cache.max_size_bytes(), config.cache.ttl());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config.clone());
    }
}

/// How the connection driver should proceed after a handled request.
pub enum HandlerOutcome {
    /// Serialize and send this response.
    Respond(Response),
    /// The response was already written to the client by the stream relay.
    Streamed { keep_alive: bool, success: bool },
}

pub async fn handle_request(
    state: &GatewayState,
    req: &Request,
    client: &mut TcpStream,
    client_ip: &str,
) -> HandlerOutcome {
    match (req.method.as_str(), req.target.as_str()) {
        ("GET", "/health") => HandlerOutcome::Respond(Response::json(
            200,
            r#"{"status": "healthy"}"#,
        )),
        ("GET", "/") => HandlerOutcome::Respond(identity_response()),
        ("GET", "/cache/stats") => {
            let body = serde_json::to_string(&state.cache.stats())
                .unwrap_or_else(|_| "{}".to_string());
            HandlerOutcome::Respond(Response::json(200, body))
        }
        ("GET", "/metrics") => {
            state
                .metrics
                .set_cache_memory(state.cache.stats().size_bytes as u64);
            let body = serde_json::to_string(&state.metrics.snapshot())
                .unwrap_or_else(|_| "{}".to_string());
            HandlerOutcome::Respond(Response::json(200, body))
        }
        ("POST", "/v1/chat/completions") => {
            handle_completions(state, req, client, client_ip).await
        }
        _ => HandlerOutcome::Respond(Response::error_json(404, "Not found")),
    }
}

async fn handle_completions(
    state: &GatewayState,
    req: &Request,
    client: &mut TcpStream,
    client_ip: &str,
) -> HandlerOutcome {
    let streaming = is_streaming_request(req);
    let request_id = match req.header("X-Request-ID") {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => generate_request_id(streaming),
    };

    let content_type = req.header("Content-Type").unwrap_or("");
    if !content_type.contains("application/json") {
        return HandlerOutcome::Respond(
            Response::error_json(415, "Content-Type must be application/json")
                .with_header("X-Request-ID", request_id),
        );
    }

    let config = state.current_config();
    // Streamed responses are never cached; the cache holds complete bodies.
    let cache_enabled = config.cache.enabled && !streaming;
    let bypass = req
        .header("Cache-Control")
        .map(should_bypass_cache)
        .unwrap_or(false);
    let key = generate_cache_key(&req.method, &req.target, &req.body);

    if cache_enabled && !bypass {
        if let Some(entry) = state.cache.get(key) {
            state.metrics.cache_hit();
            tracing::debug!(key = %key, request_id = %request_id, "cache hit");
            let response = Response {
                status: 200,
                content_type: entry.content_type,
                headers: Vec::new(),
                body: entry.body,
            }
            .with_header("X-Cache", "HIT")
            .with_header("X-Request-ID", request_id);
            return HandlerOutcome::Respond(response);
        }
        state.metrics.cache_miss();
    }

    let Some(selection) = state.balancer.select() else {
        let error = crate::GatewayError::NoHealthyBackends;
        return HandlerOutcome::Respond(
            Response::error_json(error.status(), &error.to_string())
                .with_header("X-Request-ID", request_id),
        );
    };
    let backend = selection.backend;

    tracing::debug!(
        request_id = %request_id,
        backend = %backend.addr(),
        streaming,
        "forwarding request"
    );

    if streaming {
        let result = state
            .forwarder
            .forward_streaming(req, &backend, client, client_ip, &request_id)
            .await;
        state
            .metrics
            .backend_request(&backend.host, backend.port, result.success, result.latency);

        match result.outcome {
            ForwardOutcome::Streamed(stream) => {
                tracing::info!(
                    request_id = %request_id,
                    backend = %backend.addr(),
                    bytes = stream.bytes_forwarded,
                    client_disconnected = stream.client_disconnected,
                    "streamed response"
                );
                HandlerOutcome::Streamed {
                    keep_alive: !stream.client_disconnected && req.keep_alive(),
                    success: stream.success,
                }
            }
            ForwardOutcome::Buffered(response) => HandlerOutcome::Respond(
                response
                    .with_header("X-Cache", "MISS")
                    .with_header("X-Request-ID", request_id),
            ),
        }
    } else {
        let result = state
            .forwarder
            .forward(req, &backend, client_ip, &request_id)
            .await;
        state
            .metrics
            .backend_request(&backend.host, backend.port, result.success, result.latency);

        let response = match result.outcome {
            ForwardOutcome::Buffered(response) => response,
            ForwardOutcome::Streamed(_) => Response::error_json(500, "Internal proxy error"),
        };

        if result.success
            && (200..300).contains(&response.status)
            && cache_enabled
            && !bypass
        {
            state
                .cache
                .put(key, response.body.clone(), response.content_type.clone());
        }

        HandlerOutcome::Respond(
            response
                .with_header("X-Cache", "MISS")
                .with_header("X-Request-ID", request_id),
        )
    }
}

fn identity_response() -> Response {
    let body = serde_json::json!({
        "name": "NTONIX",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "High-Performance AI Inference Gateway",
        "endpoints": {
            "health": "/health",
            "chat_completions": "/v1/chat/completions",
            "cache_stats": "/cache/stats",
            "metrics": "/metrics"
        }
    });
    Response::json(200, body.to_string())
}

/// Streaming requests get a UUID-shaped id, buffered ones a 16-hex-digit id.
/// Either way the id is unique per request and echoed back to the client.
fn generate_request_id(streaming: bool) -> String {
    let id = uuid::Uuid::new_v4();
    if streaming {
        id.to_string()
    } else {
        id.simple().to_string()[..16].to_string()
    }
}
