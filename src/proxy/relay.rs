//! Zero-copy relay of streaming (SSE) responses from backend to client.

use std::io::{self, IoSlice};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ProxySettings;
use crate::http1::{reason_phrase, ResponseHead, SERVER_NAME};

const DONE_MARKER: &[u8] = b"[DONE]";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub buffer_size: usize,
    pub read_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            read_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&ProxySettings> for RelayConfig {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            buffer_size: settings.stream_buffer_size,
            read_timeout: settings.stream_read_timeout(),
        }
    }
}

/// Outcome of one relayed stream.
#[derive(Debug, Default)]
pub struct StreamResult {
    pub success: bool,
    pub bytes_forwarded: u64,
    pub duration: Duration,
    pub client_disconnected: bool,
    pub backend_closed: bool,
    pub done_marker_received: bool,
    pub error: Option<String>,
}

/// Upstream responses worth relaying: successful SSE, or chunked bodies that
/// are not plain JSON.
pub fn is_streaming_response(head: &ResponseHead) -> bool {
    if !(200..300).contains(&head.status) {
        return false;
    }
    if head.header_contains("Content-Type", "text/event-stream") {
        return true;
    }
    if head.header_contains("Transfer-Encoding", "chunked")
        && !head.header_contains("Content-Type", "application/json")
    {
        return true;
    }
    false
}

/// Watches the byte stream for the SSE terminal marker. `data: [DONE]` and a
/// bare `[DONE]` both contain the same token, so one scan covers both forms;
/// a small carry of the previous chunk's tail catches markers that straddle a
/// read boundary.
struct DoneMarkerScanner {
    carry: Vec<u8>,
}

impl DoneMarkerScanner {
    fn new() -> Self {
        Self { carry: Vec::new() }
    }

    fn scan(&mut self, chunk: &[u8]) -> bool {
        let mut found = contains(chunk, DONE_MARKER);
        if !found && !self.carry.is_empty() {
            let mut straddle = self.carry.clone();
            straddle.extend_from_slice(&chunk[..chunk.len().min(DONE_MARKER.len() - 1)]);
            found = contains(&straddle, DONE_MARKER);
        }

        let keep = DONE_MARKER.len() - 1;
        if chunk.len() >= keep {
            self.carry.clear();
            self.carry.extend_from_slice(&chunk[chunk.len() - keep..]);
        } else {
            self.carry.extend_from_slice(chunk);
            if self.carry.len() > keep {
                let cut = self.carry.len() - keep;
                self.carry.drain(..cut);
            }
        }
        found
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|window| window == needle)
}

/// Zero-timeout liveness poll on the client socket. Ready-with-EOF or a hard
/// error means the client hung up; pending (or buffered request bytes) means
/// it is still there.
fn client_is_connected(client: &mut TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match client.peek(&mut probe).now_or_never() {
        None => true,
        Some(Ok(0)) => false,
        Some(Ok(_)) => true,
        Some(Err(_)) => false,
    }
}

/// Write `parts` as one vectored write, retrying on short writes. The data
/// slices are referenced in place, never copied.
async fn write_all_vectored(stream: &mut TcpStream, parts: &[&[u8]]) -> io::Result<()> {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut written = 0usize;
    while written < total {
        let mut bufs = Vec::with_capacity(parts.len());
        let mut skip = written;
        for part in parts {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            bufs.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }
        let n = stream.write_vectored(&bufs).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    Ok(())
}

/// One chunk of the chunked response body: hex length, CRLF, data, CRLF,
/// submitted as a scatter-write over the caller's buffer.
async fn write_chunk(client: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let size_line = format!("{:x}\r\n", data.len());
    write_all_vectored(client, &[size_line.as_bytes(), data, b"\r\n"]).await
}

/// Response header sent to the client: the upstream status line and headers,
/// rewritten to chunked framing on a kept-alive connection.
fn build_stream_header(head: &ResponseHead) -> Vec<u8> {
    let reason = if head.reason.is_empty() {
        reason_phrase(head.status)
    } else {
        head.reason.as_str()
    };
    let mut out = format!("HTTP/1.1 {} {}\r\n", head.status, reason).into_bytes();
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
            || name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Server")
        {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "Transfer-Encoding: chunked\r\nConnection: keep-alive\r\nServer: {SERVER_NAME}\r\n\r\n"
        )
        .as_bytes(),
    );
    out
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Relay an upstream stream to the client.
///
/// `upstream` must be positioned just past the response header;
/// `initial_body` carries any body bytes the header read already consumed.
/// The relay stops on upstream EOF, the SSE `[DONE]` marker, client
/// disconnect (detected within one buffer iteration), a read timeout, or a
/// progress callback returning false. The terminating `0\r\n\r\n` chunk is
/// emitted unless the client is already gone.
pub async fn forward_stream(
    config: &RelayConfig,
    upstream: &mut TcpStream,
    client: &mut TcpStream,
    head: &ResponseHead,
    initial_body: &[u8],
    mut progress: Option<&mut (dyn FnMut(u64) -> bool + Send)>,
) -> StreamResult {
    let started = Instant::now();
    let mut result = StreamResult::default();
    let mut scanner = DoneMarkerScanner::new();

    let header = build_stream_header(head);
    if let Err(e) = client.write_all(&header).await {
        result.error = Some(format!("failed to write response header: {e}"));
        result.duration = started.elapsed();
        return result;
    }

    let mut stopped_by_progress = false;

    if !initial_body.is_empty() {
        if scanner.scan(initial_body) {
            result.done_marker_received = true;
        }
        if let Err(e) = write_chunk(client, initial_body).await {
            if is_disconnect(&e) {
                result.client_disconnected = true;
            } else {
                result.error = Some(format!("failed to write initial body: {e}"));
            }
            result.duration = started.elapsed();
            result.success = result.client_disconnected;
            return result;
        }
        result.bytes_forwarded += initial_body.len() as u64;
        if let Some(callback) = progress.as_deref_mut() {
            if !callback(result.bytes_forwarded) {
                stopped_by_progress = true;
            }
        }
    }

    let mut buf = vec![0u8; config.buffer_size.max(1)];
    while !result.done_marker_received && !stopped_by_progress {
        if !client_is_connected(client) {
            result.client_disconnected = true;
            tracing::debug!("client disconnected mid-stream");
            break;
        }

        let read = tokio::time::timeout(config.read_timeout, upstream.read(&mut buf)).await;
        let n = match read {
            Err(_) => {
                result.error = Some("backend read timed out".to_string());
                break;
            }
            Ok(Err(e)) => {
                result.error = Some(format!("backend read error: {e}"));
                break;
            }
            Ok(Ok(0)) => {
                result.backend_closed = true;
                tracing::debug!("backend closed the stream");
                break;
            }
            Ok(Ok(n)) => n,
        };

        let chunk = &buf[..n];
        if scanner.scan(chunk) {
            result.done_marker_received = true;
            tracing::debug!("stream end marker detected");
        }

        if let Err(e) = write_chunk(client, chunk).await {
            if is_disconnect(&e) {
                result.client_disconnected = true;
                tracing::debug!("client disconnected during write");
            } else {
                result.error = Some(format!("client write error: {e}"));
            }
            break;
        }
        result.bytes_forwarded += n as u64;

        if let Some(callback) = progress.as_deref_mut() {
            if !callback(result.bytes_forwarded) {
                stopped_by_progress = true;
            }
        }
    }

    if !result.client_disconnected {
        let _ = client.write_all(b"0\r\n\r\n").await;
    }

    result.duration = started.elapsed();
    result.success = result.error.is_none()
        || result.client_disconnected
        || result.backend_closed
        || result.done_marker_received;

    tracing::info!(
        bytes = result.bytes_forwarded,
        duration_ms = result.duration.as_millis() as u64,
        client_disconnected = result.client_disconnected,
        backend_closed = result.backend_closed,
        done = result.done_marker_received,
        "stream relay complete"
    );

    result
}
