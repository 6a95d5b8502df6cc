//! End-to-end gateway tests over loopback sockets with in-process backends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use ntonix::config::BackendConfig;
use ntonix::http1;
use ntonix::server::{self, GatewayState};
use ntonix::{Config, ConfigManager};

struct MockBackend {
    backend: BackendConfig,
    posts: Arc<AtomicUsize>,
}

/// A JSON completions backend: answers `POST` with the given body and
/// `GET /health` with a small ok payload, honoring keep-alive.
async fn spawn_json_backend(response_body: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let port = listener.local_addr().expect("addr").port();
    let posts = Arc::new(AtomicUsize::new(0));
    let posts_for_server = posts.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let posts = posts_for_server.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                loop {
                    let req = match http1::read_request(&mut stream, &mut buf).await {
                        Ok(req) => req,
                        Err(_) => return,
                    };
                    let body = if req.method == "POST" {
                        posts.fetch_add(1, Ordering::SeqCst);
                        response_body
                    } else {
                        r#"{"status":"ok"}"#
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    MockBackend {
        backend: BackendConfig {
            host: "127.0.0.1".to_string(),
            port,
            weight: 1,
        },
        posts,
    }
}

/// An SSE backend: answers every request with a streamed completion.
async fn spawn_sse_backend(payload: &'static str) -> BackendConfig {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                if http1::read_request(&mut stream, &mut buf).await.is_err() {
                    return;
                }
                let header =
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n".to_string();
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(payload.as_bytes()).await;
                // Hold the stream open; the relay stops on the [DONE] marker.
                tokio::time::sleep(Duration::from_millis(500)).await;
            });
        }
    });

    BackendConfig {
        host: "127.0.0.1".to_string(),
        port,
        weight: 1,
    }
}

/// A port that refuses connections.
async fn dead_backend() -> BackendConfig {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    BackendConfig {
        host: "127.0.0.1".to_string(),
        port,
        weight: 1,
    }
}

fn gateway_config(backends: Vec<BackendConfig>) -> Config {
    let mut config = Config::default();
    config.backends = backends;
    config.cache.enabled = true;
    config.cache.max_size_mb = 10;
    config.cache.ttl_seconds = 60;
    config.health_check.enabled = false;
    config.proxy.connect_timeout_secs = 1;
    config.proxy.request_timeout_secs = 5;
    config
}

async fn start_gateway(config: Config) -> (SocketAddr, Arc<GatewayState>, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let addr = listener.local_addr().expect("addr");
    let state = GatewayState::new(config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if config.health_check.enabled {
        tokio::spawn(state.health.clone().run(shutdown_rx.clone()));
    }
    tokio::spawn(server::serve(listener, state.clone(), shutdown_rx));
    (addr, state, shutdown_tx)
}

fn completions_request(body: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut req = format!(
        "POST /v1/chat/completions HTTP/1.1\r\nHost: gateway\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("Connection: close\r\n\r\n");
    req.push_str(body);
    req
}

fn get_request(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: gateway\r\nConnection: close\r\n\r\n")
}

async fn send_request(addr: SocketAddr, raw: String) -> (u16, Vec<(String, String)>, Bytes) {
    let mut stream = TcpStream::connect(addr).await.expect("connect gateway");
    stream.write_all(raw.as_bytes()).await.expect("send");
    let mut buf = BytesMut::new();
    let head = http1::read_response_head(&mut stream, &mut buf)
        .await
        .expect("response head");
    let body = http1::read_response_body(&mut stream, &mut buf, &head, http1::MAX_BODY_BYTES)
        .await
        .expect("response body");
    (head.status, head.headers, body)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

const COMPLETION: &str = r#"{"id":"chatcmpl-1","choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;

#[tokio::test]
async fn cache_miss_then_hit_serves_from_cache() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let b2 = spawn_json_backend(COMPLETION).await;
    let (addr, _state, _shutdown) =
        start_gateway(gateway_config(vec![b1.backend.clone(), b2.backend.clone()])).await;

    let body = r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stream":false}"#;

    let (status, headers, resp_body) =
        send_request(addr, completions_request(body, &[])).await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "X-Cache"), Some("MISS"));
    assert!(header(&headers, "X-Request-ID").is_some());
    assert_eq!(resp_body.as_ref(), COMPLETION.as_bytes());
    assert_eq!(b1.posts.load(Ordering::SeqCst), 1, "first backend took the request");
    assert_eq!(b2.posts.load(Ordering::SeqCst), 0);

    let (status, headers, resp_body) =
        send_request(addr, completions_request(body, &[])).await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "X-Cache"), Some("HIT"));
    assert_eq!(resp_body.as_ref(), COMPLETION.as_bytes());
    assert_eq!(
        b1.posts.load(Ordering::SeqCst) + b2.posts.load(Ordering::SeqCst),
        1,
        "no new backend request on a cache hit"
    );
}

#[tokio::test]
async fn cache_control_no_cache_bypasses_the_cache() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let (addr, _state, _shutdown) =
        start_gateway(gateway_config(vec![b1.backend.clone()])).await;

    let body = r#"{"model":"m","messages":[{"role":"user","content":"bypass"}]}"#;
    let (status, _, _) = send_request(addr, completions_request(body, &[])).await;
    assert_eq!(status, 200);
    assert_eq!(b1.posts.load(Ordering::SeqCst), 1);

    let (status, headers, _) = send_request(
        addr,
        completions_request(body, &[("Cache-Control", "no-cache")]),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "X-Cache"), Some("MISS"));
    assert_eq!(
        b1.posts.load(Ordering::SeqCst),
        2,
        "bypass reached the backend despite the cached entry"
    );
}

#[tokio::test]
async fn unhealthy_fleet_yields_503_with_json_error() {
    let b1 = dead_backend().await;
    let b2 = dead_backend().await;
    let mut config = gateway_config(vec![b1, b2]);
    config.health_check.enabled = true;
    config.health_check.interval_ms = 20;
    config.health_check.timeout_ms = 100;
    let (addr, _state, _shutdown) = start_gateway(config).await;

    // Enough probe cycles for three consecutive failures per backend.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let body = r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#;
    let (status, _, resp_body) = send_request(addr, completions_request(body, &[])).await;
    assert_eq!(status, 503);
    assert_eq!(
        resp_body.as_ref(),
        br#"{"error":"No healthy backends available"}"#
    );
}

#[tokio::test]
async fn weighted_distribution_across_backends() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let b2 = spawn_json_backend(COMPLETION).await;
    let b3 = spawn_json_backend(COMPLETION).await;
    let mut heavy = b1.backend.clone();
    heavy.weight = 5;
    let (addr, _state, _shutdown) =
        start_gateway(gateway_config(vec![heavy, b2.backend.clone(), b3.backend.clone()])).await;

    for i in 0..7 {
        let body = format!(r#"{{"model":"m","messages":[{{"role":"user","content":"q{i}"}}]}}"#);
        let (status, _, _) = send_request(
            addr,
            completions_request(&body, &[("Cache-Control", "no-store")]),
        )
        .await;
        assert_eq!(status, 200);
    }

    assert_eq!(b1.posts.load(Ordering::SeqCst), 5);
    assert_eq!(b2.posts.load(Ordering::SeqCst), 1);
    assert_eq!(b3.posts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn streaming_completion_is_relayed_chunked() {
    let payload = "data: a\n\ndata: b\n\ndata: [DONE]\n\n";
    let sse = spawn_sse_backend(payload).await;
    let (addr, _state, _shutdown) = start_gateway(gateway_config(vec![sse])).await;

    let body = r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
    let request = format!(
        "POST /v1/chat/completions HTTP/1.1\r\nHost: gateway\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request.as_bytes()).await.expect("send");

    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut chunk))
            .await
            .expect("stream makes progress")
            .expect("read");
        assert!(n > 0, "gateway closed before the terminal chunk");
        received.extend_from_slice(&chunk[..n]);
        if received.ends_with(b"0\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.contains("Connection: keep-alive\r\n"));
    assert!(!text.to_ascii_lowercase().contains("content-length"));
    assert!(text.contains(payload), "payload relayed verbatim");
    assert!(text.ends_with("0\r\n\r\n"));
}

#[tokio::test]
async fn reload_swaps_backends_and_preserves_surviving_health() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let b2 = spawn_json_backend(COMPLETION).await;
    let b3 = spawn_json_backend(COMPLETION).await;

    let initial = gateway_config(vec![b1.backend.clone(), b2.backend.clone()]);
    let path = std::env::temp_dir().join(format!(
        "ntonix-e2e-reload-{}.json",
        std::process::id()
    ));
    std::fs::write(&path, serde_json::to_string(&initial).expect("serialize")).expect("write");

    let manager = ConfigManager::new();
    let loaded = manager
        .load(&["--config".to_string(), path.to_string_lossy().to_string()])
        .expect("load");
    assert!(loaded);

    let state = GatewayState::new(manager.get());
    {
        let state = state.clone();
        manager.on_reload(move |config| state.apply_config(config));
    }

    // Give b2 a failure streak that must survive the reload.
    state
        .health
        .record_result(&b2.backend, false, Duration::from_millis(1));
    state
        .health
        .record_result(&b2.backend, false, Duration::from_millis(1));

    let updated = gateway_config(vec![b2.backend.clone(), b3.backend.clone()]);
    std::fs::write(&path, serde_json::to_string(&updated).expect("serialize")).expect("write");
    manager.reload();

    let snapshot = state.health.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(
        !snapshot.iter().any(|h| h.config.key() == b1.backend.key()),
        "b1 forgotten"
    );
    let b2_health = snapshot
        .iter()
        .find(|h| h.config.key() == b2.backend.key())
        .expect("b2 retained");
    assert_eq!(b2_health.consecutive_failures, 2, "health counters preserved");
    let b3_health = snapshot
        .iter()
        .find(|h| h.config.key() == b3.backend.key())
        .expect("b3 added");
    assert_eq!(b3_health.consecutive_failures, 0);

    assert!(state.pools.stats(&b1.backend).is_none(), "b1 pool destroyed");
    assert!(state.pools.stats(&b2.backend).is_some(), "b2 pool kept");
    assert!(state.pools.stats(&b3.backend).is_some(), "b3 pool created");

    for _ in 0..8 {
        let selection = state.balancer.select().expect("healthy backends");
        assert_ne!(selection.backend.key(), b1.backend.key(), "b1 out of rotation");
    }

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn wrong_content_type_is_rejected_with_415() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let (addr, _state, _shutdown) = start_gateway(gateway_config(vec![b1.backend])).await;

    let raw = "POST /v1/chat/completions HTTP/1.1\r\nHost: gateway\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi".to_string();
    let (status, headers, body) = send_request(addr, raw).await;
    assert_eq!(status, 415);
    assert!(header(&headers, "X-Request-ID").is_some());
    assert_eq!(
        body.as_ref(),
        br#"{"error":"Content-Type must be application/json"}"#
    );
}

#[tokio::test]
async fn unknown_paths_return_404() {
    let (addr, _state, _shutdown) = start_gateway(gateway_config(vec![])).await;
    let (status, _, body) = send_request(addr, get_request("/nope")).await;
    assert_eq!(status, 404);
    assert_eq!(body.as_ref(), br#"{"error":"Not found"}"#);
}

#[tokio::test]
async fn operational_endpoints_respond() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let (addr, _state, _shutdown) = start_gateway(gateway_config(vec![b1.backend])).await;

    let (status, _, body) = send_request(addr, get_request("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body.as_ref(), br#"{"status": "healthy"}"#);

    let (status, _, body) = send_request(addr, get_request("/")).await;
    assert_eq!(status, 200);
    let identity: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(identity["name"], "NTONIX");

    let (status, _, body) = send_request(addr, get_request("/cache/stats")).await;
    assert_eq!(status, 200);
    let stats: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(stats["max_size_bytes"], 10 * 1024 * 1024);

    // Drive one miss and one hit, then check the counters.
    let req_body = r#"{"model":"m","messages":[{"role":"user","content":"metrics"}]}"#;
    send_request(addr, completions_request(req_body, &[])).await;
    send_request(addr, completions_request(req_body, &[])).await;

    let (status, _, body) = send_request(addr, get_request("/metrics")).await;
    assert_eq!(status, 200);
    let metrics: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(metrics["cache"]["hits"], 1);
    assert_eq!(metrics["cache"]["misses"], 1);
    assert!(metrics["requests"]["total"].as_u64().expect("count") >= 2);
    assert_eq!(metrics["backends"][0]["requests"], 1);
}

#[tokio::test]
async fn request_ids_are_unique_per_request() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let (addr, _state, _shutdown) = start_gateway(gateway_config(vec![b1.backend])).await;

    let body = r#"{"model":"m","messages":[{"role":"user","content":"ids"}]}"#;
    let (_, h1, _) = send_request(addr, completions_request(body, &[])).await;
    let (_, h2, _) = send_request(addr, completions_request(body, &[])).await;

    let id1 = header(&h1, "X-Request-ID").expect("first id").to_string();
    let id2 = header(&h2, "X-Request-ID").expect("second id").to_string();
    assert!(!id1.is_empty());
    assert_ne!(id1, id2);
}

#[tokio::test]
async fn inbound_request_id_is_echoed_to_backend_and_client() {
    let b1 = spawn_json_backend(COMPLETION).await;
    let (addr, _state, _shutdown) = start_gateway(gateway_config(vec![b1.backend])).await;

    let body = r#"{"model":"m","messages":[{"role":"user","content":"echo"}]}"#;
    let (_, headers, _) = send_request(
        addr,
        completions_request(body, &[("X-Request-ID", "client-chosen-id")]),
    )
    .await;
    assert_eq!(header(&headers, "X-Request-ID"), Some("client-chosen-id"));
}
