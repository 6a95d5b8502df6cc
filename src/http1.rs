//! Minimal HTTP/1.1 framing over asynchronous byte streams.
//!
//! Requests and response heads are parsed out of a caller-owned buffer so any
//! bytes read past a message boundary (pipelined requests, the start of a
//! streaming body) stay available to the caller. Bodies are delimited by
//! `Content-Length`, chunked encoding, or connection close.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const SERVER_NAME: &str = "NTONIX/0.1.0";

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_LINE_BYTES: usize = 8 * 1024;
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    /// Clean EOF before any bytes of the next message.
    #[error("connection closed")]
    ConnectionClosed,
    /// EOF in the middle of a message.
    #[error("truncated message")]
    Truncated,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),
    #[error("message too large")]
    TooLarge,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// A fully parsed inbound request.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").unwrap_or("");
        match self.version {
            Version::Http11 => !connection.eq_ignore_ascii_case("close"),
            Version::Http10 => connection.eq_ignore_ascii_case("keep-alive"),
        }
    }
}

/// Status line and headers of an upstream response.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    pub fn header_contains(&self, name: &str, needle: &str) -> bool {
        self.header(name)
            .map(|v| v.to_ascii_lowercase().contains(needle))
            .unwrap_or(false)
    }
}

/// A response the gateway sends to a client.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn json(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn error_json(status: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string();
        Self::json(status, body)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read until the buffer holds a complete head; returns the offset just past
/// the terminating CRLFCRLF.
async fn fill_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<usize, ParseError> {
    loop {
        if let Some(pos) = find_subsequence(buf, b"\r\n\r\n") {
            return Ok(pos + 4);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ParseError::TooLarge);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(ParseError::ConnectionClosed);
            }
            return Err(ParseError::Truncated);
        }
    }
}

async fn fill_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    len: usize,
) -> Result<(), ParseError> {
    while buf.len() < len {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(ParseError::Truncated);
        }
    }
    Ok(())
}

/// Consume one CRLF-terminated line from the buffer, reading as needed.
async fn fill_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<String, ParseError> {
    loop {
        if let Some(pos) = find_subsequence(buf, b"\r\n") {
            let line = buf.split_to(pos + 2);
            let text = std::str::from_utf8(&line[..pos])
                .map_err(|_| ParseError::Malformed("non-UTF-8 line".to_string()))?;
            return Ok(text.to_string());
        }
        if buf.len() > MAX_LINE_BYTES {
            return Err(ParseError::TooLarge);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(ParseError::Truncated);
        }
    }
}

fn parse_headers(lines: std::str::Lines<'_>) -> Result<Vec<(String, String)>, ParseError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::Malformed(format!("bad header line: {line}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Parse one request from the stream. Bytes past the request stay in `buf`.
pub async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Request, ParseError> {
    let head_end = fill_head(stream, buf).await?;
    let head = buf.split_to(head_end);
    let text = std::str::from_utf8(&head[..head_end - 4])
        .map_err(|_| ParseError::Malformed("non-UTF-8 head".to_string()))?;

    let mut lines = text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| ParseError::Malformed("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m.to_string(), t.to_string(), v),
        _ => {
            return Err(ParseError::Malformed(format!(
                "bad request line: {request_line}"
            )))
        }
    };
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other => return Err(ParseError::UnsupportedVersion(other.to_string())),
    };

    let headers = parse_headers(lines)?;

    let content_length = match header_lookup(&headers, "Content-Length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ParseError::Malformed(format!("bad Content-Length: {value}")))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(ParseError::TooLarge);
    }

    fill_exact(stream, buf, content_length).await?;
    let body = buf.split_to(content_length).freeze();

    Ok(Request {
        method,
        target,
        version,
        headers,
        body,
    })
}

/// Parse a response status line and headers. Any body bytes already read stay
/// in `buf` for the caller (the streaming relay forwards them verbatim).
pub async fn read_response_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<ResponseHead, ParseError> {
    let head_end = fill_head(stream, buf).await?;
    let head = buf.split_to(head_end);
    let text = std::str::from_utf8(&head[..head_end - 4])
        .map_err(|_| ParseError::Malformed("non-UTF-8 head".to_string()))?;

    let mut lines = text.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| ParseError::Malformed("empty response".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ParseError::Malformed("missing version".to_string()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::UnsupportedVersion(version.to_string()));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ParseError::Malformed(format!("bad status line: {status_line}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_headers(lines)?;

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Read a complete response body according to the head's framing.
pub async fn read_response_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    head: &ResponseHead,
    max_bytes: usize,
) -> Result<Bytes, ParseError> {
    if head.header_contains("Transfer-Encoding", "chunked") {
        return read_chunked_body(stream, buf, max_bytes).await;
    }

    if let Some(value) = head.header("Content-Length") {
        let len = value
            .parse::<usize>()
            .map_err(|_| ParseError::Malformed(format!("bad Content-Length: {value}")))?;
        if len > max_bytes {
            return Err(ParseError::TooLarge);
        }
        fill_exact(stream, buf, len).await?;
        return Ok(buf.split_to(len).freeze());
    }

    // No framing headers: the body runs until the peer closes.
    loop {
        if buf.len() > max_bytes {
            return Err(ParseError::TooLarge);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Ok(buf.split_to(buf.len()).freeze());
        }
    }
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_bytes: usize,
) -> Result<Bytes, ParseError> {
    let mut body = BytesMut::new();
    loop {
        let size_line = fill_line(stream, buf).await?;
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ParseError::Malformed(format!("bad chunk size: {size_line}")))?;

        if size == 0 {
            // Trailers, if any, run until an empty line.
            loop {
                let trailer = fill_line(stream, buf).await?;
                if trailer.is_empty() {
                    return Ok(body.freeze());
                }
            }
        }

        if body.len() + size > max_bytes {
            return Err(ParseError::TooLarge);
        }
        fill_exact(stream, buf, size + 2).await?;
        body.extend_from_slice(&buf[..size]);
        buf.advance(size);
        if &buf[..2] != b"\r\n" {
            return Err(ParseError::Malformed("missing chunk terminator".to_string()));
        }
        buf.advance(2);
    }
}

/// Serialize an outbound request for the wire.
pub fn serialize_request(
    method: &str,
    target: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
    for (name, value) in headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Serialize a gateway response. `Server`, `Content-Type`, `Content-Length`,
/// and `Connection` are owned by the serializer; `resp.headers` carries the
/// rest.
pub fn serialize_response(resp: &Response, version: Version, keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(resp.body.len() + 256);
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version.as_str(),
            resp.status,
            reason_phrase(resp.status)
        )
        .as_bytes(),
    );
    out.extend_from_slice(format!("Server: {SERVER_NAME}\r\n").as_bytes());
    if !resp.content_type.is_empty() {
        out.extend_from_slice(format!("Content-Type: {}\r\n", resp.content_type).as_bytes());
    }
    for (name, value) in &resp.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", resp.body.len()).as_bytes());
    out.extend_from_slice(
        format!(
            "Connection: {}\r\n\r\n",
            if keep_alive { "keep-alive" } else { "close" }
        )
        .as_bytes(),
    );
    out.extend_from_slice(&resp.body);
    out
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_with_body() {
        let mut data: &[u8] = b"POST /v1/chat/completions HTTP/1.1\r\n\
            Host: gw\r\n\
            Content-Type: application/json\r\n\
            Content-Length: 7\r\n\
            \r\n\
            {\"a\":1}";
        let mut buf = BytesMut::new();
        let req = read_request(&mut data, &mut buf).await.expect("parses");

        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/v1/chat/completions");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.body.as_ref(), b"{\"a\":1}");
        assert!(req.keep_alive());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn pipelined_bytes_stay_in_the_buffer() {
        let mut data: &[u8] =
            b"GET /health HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        let mut buf = BytesMut::new();
        let first = read_request(&mut data, &mut buf).await.expect("first");
        assert_eq!(first.target, "/health");
        let second = read_request(&mut data, &mut buf).await.expect("second");
        assert_eq!(second.target, "/");
    }

    #[tokio::test]
    async fn clean_eof_is_connection_closed() {
        let mut data: &[u8] = b"";
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request(&mut data, &mut buf).await,
            Err(ParseError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn eof_mid_message_is_truncated() {
        let mut data: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request(&mut data, &mut buf).await,
            Err(ParseError::Truncated)
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let mut data: &[u8] = b"GET / HTTP/2.0\r\n\r\n";
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request(&mut data, &mut buf).await,
            Err(ParseError::UnsupportedVersion(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_request_line() {
        let mut data: &[u8] = b"GARBAGE\r\n\r\n";
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_request(&mut data, &mut buf).await,
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn http10_defaults_to_close() {
        let req = Request {
            method: "GET".to_string(),
            target: "/".to_string(),
            version: Version::Http10,
            headers: vec![],
            body: Bytes::new(),
        };
        assert!(!req.keep_alive());
    }

    #[tokio::test]
    async fn response_head_leaves_body_bytes_in_buffer() {
        let mut data: &[u8] = b"HTTP/1.1 200 OK\r\n\
            Content-Type: text/event-stream\r\n\
            \r\n\
            data: early\n\n";
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut data, &mut buf)
            .await
            .expect("parses");

        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert!(head.header_contains("content-type", "text/event-stream"));
        assert_eq!(buf.as_ref(), b"data: early\n\n");
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let mut data: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut data, &mut buf).await.expect("head");
        let body = read_response_body(&mut data, &mut buf, &head, MAX_BODY_BYTES)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), b"hello");
        assert_eq!(buf.as_ref(), b"EXTRA");
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let mut data: &[u8] = b"HTTP/1.1 200 OK\r\n\
            Transfer-Encoding: chunked\r\n\
            \r\n\
            5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut data, &mut buf).await.expect("head");
        let body = read_response_body(&mut data, &mut buf, &head, MAX_BODY_BYTES)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn truncated_chunked_body_errors() {
        let mut data: &[u8] = b"HTTP/1.1 200 OK\r\n\
            Transfer-Encoding: chunked\r\n\
            \r\n\
            5\r\nhel";
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut data, &mut buf).await.expect("head");
        assert!(matches!(
            read_response_body(&mut data, &mut buf, &head, MAX_BODY_BYTES).await,
            Err(ParseError::Truncated)
        ));
    }

    #[tokio::test]
    async fn body_without_framing_runs_to_eof() {
        let mut data: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nuntil-close";
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut data, &mut buf).await.expect("head");
        let body = read_response_body(&mut data, &mut buf, &head, MAX_BODY_BYTES)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), b"until-close");
    }

    #[test]
    fn serialized_response_carries_framing_headers() {
        let resp = Response::json(200, "{\"ok\":true}").with_header("X-Cache", "HIT");
        let bytes = serialize_response(&resp, Version::Http11, true);
        let text = String::from_utf8(bytes).expect("utf8");

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: NTONIX/0.1.0\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("X-Cache: HIT\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("{\"ok\":true}"));
    }

    #[test]
    fn serialized_request_round_trips() {
        let bytes = serialize_request(
            "POST",
            "/v1/chat/completions",
            &[
                ("Host".to_string(), "b1:9001".to_string()),
                ("Content-Length".to_string(), "2".to_string()),
            ],
            b"{}",
        );
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.starts_with("POST /v1/chat/completions HTTP/1.1\r\n"));
        assert!(text.contains("Host: b1:9001\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn error_json_shape() {
        let resp = Response::error_json(503, "No healthy backends available");
        assert_eq!(
            resp.body.as_ref(),
            br#"{"error":"No healthy backends available"}"#
        );
    }
}
