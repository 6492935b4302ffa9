// Minimal HTTP/1.1 codec for the control socket.
//
// The control plane needs exactly one exchange shape: a small request with
// an optional JSON body, answered by a JSON response on a connection that
// then closes. Parsing is restricted to that shape. The server side is
// async (tokio streams); the client side is sync because clients are
// short-lived blocking processes.

use std::io::{BufRead, Read, Write};

use anyhow::{bail, Context};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request body cap. Exceeding it aborts the request with a 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Cap on a single request or header line.
const MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("connection closed before a complete request")]
    Closed,
    #[error("request body of {length} bytes exceeds the 1 MiB cap")]
    TooLarge { length: usize },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("i/o error reading request: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed request: method, decoded path, decoded query pairs, raw body.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn query_get(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Boolean query flags use `"1"` as true.
    pub fn query_flag(&self, key: &str) -> bool {
        self.query_get(key) == Some("1")
    }
}

/// Read one request from the stream. The body length comes from
/// `Content-Length`; chunked encoding is not supported.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Request, RequestError> {
    let mut line = String::new();
    let n = read_line_capped(reader, &mut line).await?;
    if n == 0 {
        return Err(RequestError::Closed);
    }

    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("empty request line".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("missing request target".into()))?;
    let (path, query) = match target.split_once('?') {
        Some((path, raw)) => (percent_decode(path), parse_query(raw)),
        None => (percent_decode(target), Vec::new()),
    };

    let mut content_length = 0usize;
    loop {
        line.clear();
        let n = read_line_capped(reader, &mut line).await?;
        if n == 0 {
            return Err(RequestError::Closed);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| RequestError::Malformed("invalid Content-Length".into()))?;
            }
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::TooLarge {
            length: content_length,
        });
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    Ok(Request {
        method,
        path,
        query,
        body,
    })
}

/// `read_line` with a hard ceiling, so an endless unterminated line can
/// never grow the buffer without bound.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut String,
) -> Result<usize, RequestError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }
        let (chunk, found_newline) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..=pos], true),
            None => (available, false),
        };
        let consumed = chunk.len();
        line.push_str(&String::from_utf8_lossy(chunk));
        reader.consume(consumed);
        total += consumed;
        if line.len() > MAX_LINE_BYTES {
            return Err(RequestError::Malformed("line too long".into()));
        }
        if found_newline {
            return Ok(total);
        }
    }
}

/// Write a JSON response and flush it. Every response closes the
/// connection afterwards.
pub async fn write_json_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    body: &[u8],
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason(status),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Perform one blocking exchange over an already-connected stream and
/// return the status code and response body. Used by clients and by the
/// runner's stale-socket probe.
pub fn request_sync<S: Read + Write>(
    mut stream: S,
    method: &str,
    target: &str,
    body: Option<&[u8]>,
) -> anyhow::Result<(u16, Vec<u8>)> {
    let mut head = format!("{method} {target} HTTP/1.1\r\nHost: tap\r\nConnection: close\r\n");
    if let Some(body) = body {
        head.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    head.push_str("\r\n");
    stream
        .write_all(head.as_bytes())
        .context("failed to send request")?;
    if let Some(body) = body {
        stream.write_all(body).context("failed to send request body")?;
    }
    stream.flush().context("failed to flush request")?;

    let mut reader = std::io::BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read response status")?;
    if line.is_empty() {
        bail!("connection closed before a response arrived");
    }
    let status: u16 = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("malformed status line: {}", line.trim()))?;

    let mut content_length: Option<usize> = None;
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .context("failed to read response headers")?;
        if n == 0 {
            bail!("connection closed mid-headers");
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let body = match content_length {
        Some(length) => {
            let mut body = vec![0u8; length];
            reader
                .read_exact(&mut body)
                .context("failed to read response body")?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader
                .read_to_end(&mut body)
                .context("failed to read response body")?;
            body
        }
    };
    Ok((status, body))
}

/// Parse `k=v&k2=v2` pairs, percent-decoding both sides.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
