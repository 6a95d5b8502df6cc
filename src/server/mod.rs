//! TCP serving: the accept loop and per-connection request driver.

mod gateway;

pub use gateway::{handle_request, GatewayState, HandlerOutcome};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::http1::{self, ParseError, Response, Version};

const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept connections until shutdown is signalled. Each connection runs in
/// its own task; in-flight handlers drain after the acceptor stops.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, state).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("acceptor stopped");
                return Ok(());
            }
        }
    }
}

/// Drive one client connection: parse, handle, respond, repeat while
/// keep-alive holds.
async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, state: Arc<GatewayState>) {
    state.metrics.connection_opened();
    let client_ip = peer.ip().to_string();
    let mut buf = BytesMut::new();

    loop {
        let parsed = tokio::time::timeout(
            CONNECTION_READ_TIMEOUT,
            http1::read_request(&mut stream, &mut buf),
        )
        .await;

        let req = match parsed {
            Err(_) => {
                tracing::debug!(client = %client_ip, "client read timed out");
                break;
            }
            Ok(Err(ParseError::ConnectionClosed)) => break,
            Ok(Err(ParseError::UnsupportedVersion(v))) => {
                tracing::warn!(client = %client_ip, version = %v, "unsupported HTTP version");
                let resp =
                    Response::error_json(505, "Only HTTP/1.0 and HTTP/1.1 are supported");
                let _ = stream
                    .write_all(&http1::serialize_response(&resp, Version::Http11, false))
                    .await;
                break;
            }
            Ok(Err(ParseError::TooLarge)) => {
                tracing::warn!(client = %client_ip, "request too large");
                let resp = Response::error_json(413, "Request too large");
                let _ = stream
                    .write_all(&http1::serialize_response(&resp, Version::Http11, false))
                    .await;
                break;
            }
            Ok(Err(ParseError::Malformed(reason))) => {
                tracing::warn!(client = %client_ip, reason = %reason, "malformed request");
                let resp =
                    Response::error_json(400, &format!("Malformed HTTP request: {reason}"));
                let _ = stream
                    .write_all(&http1::serialize_response(&resp, Version::Http11, false))
                    .await;
                break;
            }
            Ok(Err(ParseError::Truncated)) | Ok(Err(ParseError::Io(_))) => break,
            Ok(Ok(req)) => req,
        };

        let started = Instant::now();
        state.metrics.request_started();
        let keep_alive = req.keep_alive();

        match gateway::handle_request(&state, &req, &mut stream, &client_ip).await {
            HandlerOutcome::Respond(resp) => {
                let status = resp.status;
                let success = status < 500;
                let bytes = http1::serialize_response(&resp, req.version, keep_alive);
                let written = stream.write_all(&bytes).await;
                state.metrics.request_completed(success);
                tracing::info!(
                    client = %client_ip,
                    method = %req.method,
                    target = %req.target,
                    status,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "request"
                );
                if written.is_err() || !keep_alive {
                    break;
                }
            }
            HandlerOutcome::Streamed {
                keep_alive: still_alive,
                success,
            } => {
                state.metrics.request_completed(success);
                tracing::info!(
                    client = %client_ip,
                    method = %req.method,
                    target = %req.target,
                    streamed = true,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "request"
                );
                if !still_alive {
                    break;
                }
            }
        }
    }

    state.metrics.connection_closed();
    tracing::debug!(client = %client_ip, "connection closed");
}
