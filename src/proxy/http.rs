/*!
HTTP/1.1 wire helpers for the rewriting proxy: request-head parsing, request-body readers
(Content-Length and chunked), path-prefix stripping, hop-by-hop filtering and response writers.

Heads are tolerant to CRLFCRLF and LFLF terminators and capped at 64 KiB. Header names keep
their original case and order; lookups are case-insensitive.
*/

use std::io::{self, BufRead, BufReader, Cursor, Read, Write};

use crate::errors::RewriteError;

pub(crate) const HEAD_CAP: usize = 64 * 1024;

/// Headers meaningful only to one connection; never relayed in either direction.
pub const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path plus optional `?query`, as sent by the client.
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
pub(crate) enum HeadError {
    /// Peer closed before sending anything.
    Closed,
    TooLarge,
    Malformed(String),
    Io(io::Error),
}

impl From<io::Error> for HeadError {
    fn from(e: io::Error) -> Self {
        HeadError::Io(e)
    }
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn has_body(&self) -> bool {
        self.is_chunked() || self.content_length().unwrap_or(0) > 0
    }

    /// `application/json`, `application/vnd.x+json; charset=utf-8`, ...
    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .map(|v| {
                let mime = v.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
                mime == "application/json" || mime.ends_with("+json")
            })
            .unwrap_or(false)
    }

    /// Headers to relay upstream: hop-by-hop ones removed, including any named by `Connection`.
    pub fn forwardable_headers(&self) -> Vec<(String, String)> {
        let named: Vec<String> = self
            .header("connection")
            .map(|v| {
                v.split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        self.headers
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k) && !named.iter().any(|n| k.eq_ignore_ascii_case(n)))
            .cloned()
            .collect()
    }
}

/// Position just past the header terminator (CRLFCRLF or LFLF).
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// Read one request head. Returns the head and any body bytes already read past it.
pub(crate) fn read_request_head<R: Read>(
    reader: &mut R,
) -> Result<(RequestHead, Vec<u8>), HeadError> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() >= HEAD_CAP {
            return Err(HeadError::TooLarge);
        }
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            if buf.is_empty() {
                return Err(HeadError::Closed);
            }
            return Err(HeadError::Malformed("connection closed inside request head".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    if end > HEAD_CAP {
        return Err(HeadError::TooLarge);
    }
    let leftover = buf[end..].to_vec();
    let head = parse_head(&buf[..end])?;
    Ok((head, leftover))
}

fn parse_head(bytes: &[u8]) -> Result<RequestHead, HeadError> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));
    let request_line = lines.next().unwrap_or_default().trim();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::Malformed(format!(
            "bad request line: {request_line:?}"
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HeadError::Malformed(format!("unsupported version {version}")));
    }
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    Ok(RequestHead {
        method: method.to_ascii_uppercase(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Decoder for a `Transfer-Encoding: chunked` body. Trailers are consumed and dropped.
pub(crate) struct ChunkedReader<R> {
    inner: R,
    remaining: usize,
    done: bool,
}

const CHUNK_LINE_CAP: u64 = 4096;

impl<R: BufRead> ChunkedReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        ChunkedReader {
            inner,
            remaining: 0,
            done: false,
        }
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let n = (&mut self.inner).take(CHUNK_LINE_CAP).read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunked body ended early",
            ));
        }
        Ok(line)
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            let line = self.read_line()?;
            let size_hex = line.trim().split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_hex, 16).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad chunk size {size_hex:?}"),
                )
            })?;
            if size == 0 {
                loop {
                    match self.read_line() {
                        Ok(l) if !l.trim().is_empty() => continue,
                        _ => break,
                    }
                }
                self.done = true;
                return Ok(0);
            }
            self.remaining = size;
        }
        let want = buf.len().min(self.remaining);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunked body ended early",
            ));
        }
        self.remaining -= n;
        if self.remaining == 0 {
            // CRLF after the payload
            self.read_line()?;
        }
        Ok(n)
    }
}

/// Reader for the request body framed by `head`, starting with bytes already buffered.
pub(crate) fn body_reader<S>(
    head: &RequestHead,
    leftover: Vec<u8>,
    stream: S,
) -> Box<dyn Read + Send>
where
    S: Read + Send + 'static,
{
    let joined = Cursor::new(leftover).chain(stream);
    if head.is_chunked() {
        Box::new(ChunkedReader::new(BufReader::new(joined)))
    } else {
        Box::new(joined.take(head.content_length().unwrap_or(0)))
    }
}

/// Buffer a body of at most `cap` bytes. A declared Content-Length above the cap fails before
/// anything is read.
pub(crate) fn read_body_capped<R: Read>(
    head: &RequestHead,
    body: R,
    cap: usize,
) -> Result<Vec<u8>, BodyReadError> {
    if let Some(n) = head.content_length() {
        if n > cap as u64 {
            return Err(BodyReadError::Rewrite(RewriteError::BodyTooLarge { limit: cap }));
        }
    }
    let mut out = Vec::new();
    body.take(cap as u64 + 1).read_to_end(&mut out)?;
    if out.len() > cap {
        return Err(BodyReadError::Rewrite(RewriteError::BodyTooLarge { limit: cap }));
    }
    Ok(out)
}

#[derive(Debug)]
pub(crate) enum BodyReadError {
    Rewrite(RewriteError),
    Io(io::Error),
}

impl From<io::Error> for BodyReadError {
    fn from(e: io::Error) -> Self {
        BodyReadError::Io(e)
    }
}

/// Remove `prefix` from the path of `target` only on a full segment boundary, collapsing the
/// resulting leading slashes to one. The query string is preserved.
pub fn strip_path_prefix(target: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return target.to_string();
    }
    let (path, query) = match target.find('?') {
        Some(i) => (&target[..i], &target[i..]),
        None => (target, ""),
    };
    match path.strip_prefix(prefix) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            format!("/{}{query}", rest.trim_start_matches('/'))
        }
        _ => target.to_string(),
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

pub(crate) fn write_response_head<W: Write>(
    w: &mut W,
    status: u16,
    headers: &[(String, String)],
    framing: Framing,
) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    for (k, v) in headers {
        head.push_str(k);
        head.push_str(": ");
        head.push_str(v);
        head.push_str("\r\n");
    }
    match framing {
        Framing::Length(n) => head.push_str(&format!("Content-Length: {n}\r\n")),
        Framing::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
        Framing::None => {}
    }
    head.push_str("Connection: close\r\n\r\n");
    w.write_all(head.as_bytes())?;
    w.flush()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Length(u64),
    Chunked,
    /// Status codes that never carry a body.
    None,
}

pub(crate) fn write_chunk<W: Write>(w: &mut W, chunk: &[u8]) -> io::Result<()> {
    if !chunk.is_empty() {
        write!(w, "{:X}\r\n", chunk.len())?;
        w.write_all(chunk)?;
        w.write_all(b"\r\n")?;
        w.flush()?;
    }
    Ok(())
}

pub(crate) fn finish_chunked<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(b"0\r\n\r\n")?;
    w.flush()
}

/// Complete JSON response; write errors are ignored (the peer may already be gone).
pub(crate) fn respond_json<W: Write>(w: &mut W, status: u16, body: &serde_json::Value) {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let headers = vec![(
        "Content-Type".to_string(),
        "application/json".to_string(),
    )];
    if write_response_head(w, status, &headers, Framing::Length(bytes.len() as u64)).is_ok() {
        let _ = w.write_all(&bytes);
        let _ = w.flush();
    }
}

/// Error body shape shared by every locally generated failure.
pub(crate) fn error_body(kind: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "error": { "type": kind, "message": message }
    })
}
