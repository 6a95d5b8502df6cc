//! Forwards one request to a selected backend over a pooled connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::{BackendConfig, ProxySettings};
use crate::error::GatewayError;
use crate::http1::{self, ParseError, Request, Response, ResponseHead};
use crate::proxy::pool::ConnectionPoolManager;
use crate::proxy::relay::{self, RelayConfig, StreamResult};

/// Hop-by-hop headers a proxy must not forward, plus `Server`, which the
/// gateway replaces with its own.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// End-to-end request headers copied through to the backend.
const PASSTHROUGH: &[&str] = &[
    "Content-Type",
    "Authorization",
    "Accept",
    "Accept-Encoding",
    "User-Agent",
];

#[derive(Clone, Debug)]
pub struct ForwarderConfig {
    pub request_timeout: Duration,
    pub relay: RelayConfig,
}

impl From<&ProxySettings> for ForwarderConfig {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            relay: RelayConfig::from(settings),
        }
    }
}

/// What came back from the backend: a buffered response (including error
/// responses the forwarder synthesized) or a completed stream relay.
#[derive(Debug)]
pub enum ForwardOutcome {
    Buffered(Response),
    Streamed(StreamResult),
}

#[derive(Debug)]
pub struct ForwardResult {
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
    pub outcome: ForwardOutcome,
}

impl ForwardResult {
    fn failure(error: GatewayError, latency: Duration) -> Self {
        let message = error.to_string();
        Self {
            success: false,
            latency,
            outcome: ForwardOutcome::Buffered(Response::error_json(error.status(), &message)),
            error: Some(message),
        }
    }
}

/// True when the client asked for a streamed completion: the JSON body sets
/// `"stream": true`, or the `Accept` header requests SSE.
pub fn is_streaming_request(req: &Request) -> bool {
    if let Ok(body) = std::str::from_utf8(&req.body) {
        if body.contains("\"stream\": true") || body.contains("\"stream\":true") {
            return true;
        }
    }
    req.header("Accept")
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

pub struct Forwarder {
    pools: Arc<ConnectionPoolManager>,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(pools: Arc<ConnectionPoolManager>, config: ForwarderConfig) -> Self {
        Self { pools, config }
    }

    /// Forward and buffer the full response.
    pub async fn forward(
        &self,
        req: &Request,
        backend: &BackendConfig,
        client_ip: &str,
        request_id: &str,
    ) -> ForwardResult {
        let started = Instant::now();

        let Some(mut guard) = self.pools.checkout(backend).await else {
            tracing::warn!(backend = %backend.addr(), "failed to get connection to backend");
            return ForwardResult::failure(
                GatewayError::PoolExhausted {
                    backend: backend.addr(),
                },
                started.elapsed(),
            );
        };

        let request_bytes = build_backend_request(req, backend, client_ip, request_id);

        let exchange = tokio::time::timeout(self.config.request_timeout, async {
            let stream = guard.stream();
            stream.write_all(&request_bytes).await?;
            let mut buf = BytesMut::new();
            let head = http1::read_response_head(stream, &mut buf).await?;
            let body =
                http1::read_response_body(stream, &mut buf, &head, http1::MAX_BODY_BYTES).await?;
            Ok::<(ResponseHead, Bytes), ParseError>((head, body))
        })
        .await;

        match exchange {
            Ok(Ok((head, body))) => {
                let latency = started.elapsed();
                tracing::debug!(
                    backend = %backend.addr(),
                    status = head.status,
                    latency_ms = latency.as_millis() as u64,
                    "received backend response"
                );
                ForwardResult {
                    success: true,
                    latency,
                    error: None,
                    outcome: ForwardOutcome::Buffered(sanitize_response(&head, body)),
                }
            }
            Ok(Err(e)) => {
                guard.mark_failed();
                let error = classify_error(&e);
                tracing::warn!(backend = %backend.addr(), error = %error, "backend exchange failed");
                ForwardResult::failure(error, started.elapsed())
            }
            Err(_) => {
                guard.mark_failed();
                tracing::warn!(backend = %backend.addr(), "backend request timed out");
                ForwardResult::failure(GatewayError::BackendTimeout, started.elapsed())
            }
        }
    }

    /// Forward with streaming support: read only the response head, and relay
    /// it chunk by chunk if the backend is actually streaming. A response that
    /// turns out not to be a stream falls back to buffering.
    pub async fn forward_streaming(
        &self,
        req: &Request,
        backend: &BackendConfig,
        client: &mut TcpStream,
        client_ip: &str,
        request_id: &str,
    ) -> ForwardResult {
        let started = Instant::now();

        let Some(mut guard) = self.pools.checkout(backend).await else {
            tracing::warn!(backend = %backend.addr(), "failed to get connection to backend");
            return ForwardResult::failure(
                GatewayError::PoolExhausted {
                    backend: backend.addr(),
                },
                started.elapsed(),
            );
        };

        let request_bytes = build_backend_request(req, backend, client_ip, request_id);

        let head_exchange = tokio::time::timeout(self.config.request_timeout, async {
            let stream = guard.stream();
            stream.write_all(&request_bytes).await?;
            let mut buf = BytesMut::new();
            let head = http1::read_response_head(stream, &mut buf).await?;
            Ok::<(ResponseHead, BytesMut), ParseError>((head, buf))
        })
        .await;

        let (head, mut leftover) = match head_exchange {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                guard.mark_failed();
                let error = classify_error(&e);
                tracing::warn!(backend = %backend.addr(), error = %error, "backend exchange failed");
                return ForwardResult::failure(error, started.elapsed());
            }
            Err(_) => {
                guard.mark_failed();
                tracing::warn!(backend = %backend.addr(), "backend request timed out");
                return ForwardResult::failure(GatewayError::BackendTimeout, started.elapsed());
            }
        };

        if relay::is_streaming_response(&head) {
            tracing::debug!(backend = %backend.addr(), "streaming response detected");
            let stream_result = relay::forward_stream(
                &self.config.relay,
                guard.stream(),
                client,
                &head,
                &leftover,
                None,
            )
            .await;
            // The connection was driven to EOF or abandoned mid-stream; it
            // must not return to the pool either way.
            guard.mark_failed();

            ForwardResult {
                success: stream_result.success,
                latency: started.elapsed(),
                error: stream_result.error.clone(),
                outcome: ForwardOutcome::Streamed(stream_result),
            }
        } else {
            // The client asked to stream but the backend replied with a plain
            // response; buffer it instead of relaying.
            let body_read = tokio::time::timeout(
                self.config.request_timeout,
                http1::read_response_body(
                    guard.stream(),
                    &mut leftover,
                    &head,
                    http1::MAX_BODY_BYTES,
                ),
            )
            .await;

            match body_read {
                Ok(Ok(body)) => {
                    let latency = started.elapsed();
                    tracing::debug!(
                        backend = %backend.addr(),
                        status = head.status,
                        latency_ms = latency.as_millis() as u64,
                        "buffered non-streaming response"
                    );
                    ForwardResult {
                        success: true,
                        latency,
                        error: None,
                        outcome: ForwardOutcome::Buffered(sanitize_response(&head, body)),
                    }
                }
                Ok(Err(e)) => {
                    guard.mark_failed();
                    ForwardResult::failure(classify_error(&e), started.elapsed())
                }
                Err(_) => {
                    guard.mark_failed();
                    ForwardResult::failure(GatewayError::BackendTimeout, started.elapsed())
                }
            }
        }
    }
}

/// The outbound request: original method, target, and body, with the proxy
/// header rewrites applied.
fn build_backend_request(
    req: &Request,
    backend: &BackendConfig,
    client_ip: &str,
    request_id: &str,
) -> Vec<u8> {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(req.headers.len() + 6);
    headers.push(("Host".to_string(), backend.addr()));

    for name in PASSTHROUGH {
        if let Some(value) = req.header(name) {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    headers.push(("Connection".to_string(), "keep-alive".to_string()));

    if !client_ip.is_empty() {
        let forwarded_for = match req.header("X-Forwarded-For") {
            Some(chain) => format!("{chain}, {client_ip}"),
            None => client_ip.to_string(),
        };
        headers.push(("X-Forwarded-For".to_string(), forwarded_for));

        let real_ip = req.header("X-Real-IP").unwrap_or(client_ip);
        headers.push(("X-Real-IP".to_string(), real_ip.to_string()));
    }

    if !request_id.is_empty() {
        headers.push(("X-Request-ID".to_string(), request_id.to_string()));
    }

    headers.push(("Content-Length".to_string(), req.body.len().to_string()));

    http1::serialize_request(&req.method, &req.target, &headers, &req.body)
}

/// Strip hop-by-hop headers and `Server` from an upstream response.
fn sanitize_response(head: &ResponseHead, body: Bytes) -> Response {
    let content_type = head.header("Content-Type").unwrap_or("").to_string();
    let headers = head
        .headers
        .iter()
        .filter(|(name, _)| {
            !HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
                && !name.eq_ignore_ascii_case("Content-Type")
                && !name.eq_ignore_ascii_case("Content-Length")
                && !name.eq_ignore_ascii_case("Server")
        })
        .cloned()
        .collect();

    Response {
        status: head.status,
        content_type,
        headers,
        body,
    }
}

fn classify_error(e: &ParseError) -> GatewayError {
    match e {
        ParseError::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut => GatewayError::BackendTimeout,
            _ => GatewayError::BackendUnreachable(io.to_string()),
        },
        other => GatewayError::BackendProtocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http1::Version;
    use crate::proxy::pool::PoolConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn request(body: &str, headers: Vec<(&str, &str)>) -> Request {
        Request {
            method: "POST".to_string(),
            target: "/v1/chat/completions".to_string(),
            version: Version::Http11,
            headers: headers
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: Bytes::from(body.to_string()),
        }
    }

    fn backend_at(port: u16) -> BackendConfig {
        BackendConfig {
            host: "127.0.0.1".to_string(),
            port,
            weight: 1,
        }
    }

    fn forwarder_for(backend: &BackendConfig, request_timeout: Duration) -> Forwarder {
        let pools = Arc::new(ConnectionPoolManager::new(PoolConfig {
            pool_size_per_backend: 4,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(30),
            enable_keep_alive: true,
        }));
        pools.set_backends(std::slice::from_ref(backend));
        Forwarder::new(
            pools,
            ForwarderConfig {
                request_timeout,
                relay: RelayConfig::default(),
            },
        )
    }

    #[test]
    fn outbound_request_rewrites_headers() {
        let req = request(
            "{}",
            vec![
                ("Host", "gateway"),
                ("Content-Type", "application/json"),
                ("Authorization", "Bearer tok"),
                ("X-Forwarded-For", "10.0.0.1"),
                ("X-Custom", "dropped"),
            ],
        );
        let bytes = build_backend_request(&req, &backend_at(9001), "192.168.1.5", "req-1");
        let text = String::from_utf8(bytes).expect("utf8");

        assert!(text.starts_with("POST /v1/chat/completions HTTP/1.1\r\n"));
        assert!(text.contains("Host: 127.0.0.1:9001\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Authorization: Bearer tok\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(
            text.contains("X-Forwarded-For: 10.0.0.1, 192.168.1.5\r\n"),
            "client ip appended to the inherited chain"
        );
        assert!(text.contains("X-Real-IP: 192.168.1.5\r\n"));
        assert!(text.contains("X-Request-ID: req-1\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("X-Custom"), "unlisted headers are not forwarded");
    }

    #[test]
    fn forwarded_for_without_inherited_chain_is_just_the_client() {
        let req = request("{}", vec![]);
        let bytes = build_backend_request(&req, &backend_at(9001), "192.168.1.5", "");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("X-Forwarded-For: 192.168.1.5\r\n"));
        assert!(!text.contains("X-Request-ID"));
    }

    #[test]
    fn existing_real_ip_passes_through() {
        let req = request("{}", vec![("X-Real-IP", "10.9.9.9")]);
        let bytes = build_backend_request(&req, &backend_at(9001), "192.168.1.5", "id");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("X-Real-IP: 10.9.9.9\r\n"));
    }

    #[test]
    fn streaming_detection_reads_body_and_accept() {
        assert!(is_streaming_request(&request(
            r#"{"model":"m","stream": true}"#,
            vec![]
        )));
        assert!(is_streaming_request(&request(
            r#"{"model":"m","stream":true}"#,
            vec![]
        )));
        assert!(!is_streaming_request(&request(
            r#"{"model":"m","stream": false}"#,
            vec![]
        )));
        assert!(is_streaming_request(&request(
            "{}",
            vec![("Accept", "text/event-stream")]
        )));
        assert!(!is_streaming_request(&request("{}", vec![])));
    }

    #[test]
    fn sanitize_strips_hop_by_hop_and_server() {
        let head = ResponseHead {
            status: 200,
            reason: "OK".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Server".to_string(), "upstream/9".to_string()),
                ("X-Model".to_string(), "m".to_string()),
            ],
        };
        let resp = sanitize_response(&head, Bytes::from_static(b"{}"));

        assert_eq!(resp.content_type, "application/json");
        assert_eq!(resp.headers, vec![("X-Model".to_string(), "m".to_string())]);
    }

    #[tokio::test]
    async fn connect_refused_maps_to_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let backend = backend_at(listener.local_addr().expect("addr").port());
        drop(listener);

        let forwarder = forwarder_for(&backend, Duration::from_secs(1));
        let req = request("{}", vec![]);
        let result = forwarder.forward(&req, &backend, "127.0.0.1", "id").await;

        assert!(!result.success);
        match result.outcome {
            ForwardOutcome::Buffered(resp) => assert_eq!(resp.status, 502),
            ForwardOutcome::Streamed(_) => panic!("expected buffered error"),
        }
    }

    #[tokio::test]
    async fn silent_backend_maps_to_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let backend = backend_at(listener.local_addr().expect("addr").port());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            // hold the connection open without answering
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let forwarder = forwarder_for(&backend, Duration::from_millis(100));
        let req = request("{}", vec![]);
        let result = forwarder.forward(&req, &backend, "127.0.0.1", "id").await;

        assert!(!result.success);
        match result.outcome {
            ForwardOutcome::Buffered(resp) => {
                assert_eq!(resp.status, 504);
                assert_eq!(
                    resp.body.as_ref(),
                    br#"{"error":"Backend request timed out"}"#
                );
            }
            ForwardOutcome::Streamed(_) => panic!("expected buffered error"),
        }
        server.abort();
    }

    #[tokio::test]
    async fn happy_path_buffers_and_sanitizes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let backend = backend_at(listener.local_addr().expect("addr").port());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = BytesMut::new();
            let _req = http1::read_request(&mut stream, &mut buf).await.expect("parse");
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: application/json\r\n\
                      Server: upstream/1\r\n\
                      Content-Length: 11\r\n\
                      \r\n\
                      {\"ok\":true}",
                )
                .await
                .expect("respond");
            // keep open so the pool can recycle the connection
            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink).await;
        });

        let forwarder = forwarder_for(&backend, Duration::from_secs(1));
        let req = request(r#"{"model":"m"}"#, vec![("Content-Type", "application/json")]);
        let result = forwarder.forward(&req, &backend, "127.0.0.1", "id").await;

        assert!(result.success);
        match result.outcome {
            ForwardOutcome::Buffered(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.body.as_ref(), b"{\"ok\":true}");
                assert!(resp.headers.iter().all(|(n, _)| n != "Server"));
            }
            ForwardOutcome::Streamed(_) => panic!("expected buffered response"),
        }
        server.abort();
    }

    #[tokio::test]
    async fn streaming_request_with_plain_response_falls_back_to_buffering() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let backend = backend_at(listener.local_addr().expect("addr").port());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = BytesMut::new();
            let _req = http1::read_request(&mut stream, &mut buf).await.expect("parse");
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: application/json\r\n\
                      Content-Length: 11\r\n\
                      \r\n\
                      {\"ok\":true}",
                )
                .await
                .expect("respond");
            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink).await;
        });

        // A client socket pair stands in for the downstream connection.
        let client_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let client_addr = client_listener.local_addr().expect("addr");
        let connect =
            tokio::spawn(async move { TcpStream::connect(client_addr).await.expect("connect") });
        let (mut client_side, _) = client_listener.accept().await.expect("accept");
        let _client_remote = connect.await.expect("join");

        let forwarder = forwarder_for(&backend, Duration::from_secs(1));
        let req = request(r#"{"stream":true}"#, vec![]);
        let result = forwarder
            .forward_streaming(&req, &backend, &mut client_side, "127.0.0.1", "id")
            .await;

        assert!(result.success);
        match result.outcome {
            ForwardOutcome::Buffered(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.body.as_ref(), b"{\"ok\":true}");
            }
            ForwardOutcome::Streamed(_) => panic!("plain response must not be relayed"),
        }
        server.abort();
    }
}
