//! One rewriting-proxy stage: an ephemeral loopback listener that buffers and rewrites eligible
//! JSON bodies and streams everything else through verbatim.
//!
//! Lifecycle: Stopped -> (start) Listening -> (stop) Stopped. `stop()` closes the listener and
//! returns; connections already accepted finish on their own threads.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use reqwest::blocking::Body;
use serde_json::Value;

use super::forward::{ForwardError, Forwarder};
use super::http::{
    self, body_reader, error_body, read_body_capped, read_request_head, respond_json,
    strip_path_prefix, BodyReadError, Framing, HeadError, RequestHead,
};
use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::errors::RewriteError;

/// Outcome of inspecting one JSON body.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// Forward the original bytes.
    Unchanged,
    /// Forward this body instead.
    Replace(Value),
}

/// Pluggable body transformation for one stage.
pub trait RequestRewriter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether eligible JSON bodies are buffered and passed to `rewrite`. Tunnels return false.
    fn inspects_bodies(&self) -> bool {
        true
    }

    /// `path` is the upstream path after prefix stripping.
    fn rewrite(&self, path: &str, body: &Value) -> Rewrite;

    /// `GET` path answered locally with `introspect()`, never forwarded.
    fn introspection_path(&self) -> Option<&str> {
        None
    }

    fn introspect(&self) -> Value {
        Value::Null
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub upstream: String,
    pub strip_path_prefix: Option<String>,
    pub max_body_bytes: usize,
    pub timeout: Duration,
}

impl ProxyOptions {
    pub fn new(upstream: &str) -> Self {
        ProxyOptions {
            upstream: upstream.to_string(),
            strip_path_prefix: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            timeout: Duration::from_secs(600),
        }
    }
}

struct Shared {
    rewriter: Arc<dyn RequestRewriter>,
    forwarder: Forwarder,
    opts: ProxyOptions,
}

struct Listening {
    port: u16,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub struct RewritingProxy {
    shared: Arc<Shared>,
    state: Option<Listening>,
}

impl RewritingProxy {
    pub fn new(rewriter: Arc<dyn RequestRewriter>, opts: ProxyOptions) -> io::Result<Self> {
        let forwarder = Forwarder::new(&opts.upstream, opts.timeout)?;
        Ok(RewritingProxy {
            shared: Arc::new(Shared {
                rewriter,
                forwarder,
                opts,
            }),
            state: None,
        })
    }

    pub fn name(&self) -> &str {
        self.shared.rewriter.name()
    }

    pub fn upstream(&self) -> &str {
        &self.shared.opts.upstream
    }

    /// Bind an ephemeral loopback port and start accepting. Returns the port; a second call
    /// while listening returns the same port.
    pub fn start(&mut self) -> io::Result<u16> {
        if let Some(l) = &self.state {
            return Ok(l.port);
        }
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        let running = Arc::new(AtomicBool::new(true));
        let running_cl = running.clone();
        let shared = self.shared.clone();
        let name = shared.rewriter.name().to_string();
        let handle = std::thread::Builder::new()
            .name(format!("ccs-proxy-{name}"))
            .spawn(move || accept_loop(listener, shared, running_cl))?;
        tracing::info!(
            stage = %name,
            port,
            upstream = %self.shared.opts.upstream,
            "proxy stage listening"
        );
        self.state = Some(Listening {
            port,
            running,
            handle: Some(handle),
        });
        Ok(port)
    }

    pub fn port(&self) -> Option<u16> {
        self.state.as_ref().map(|l| l.port)
    }

    pub fn url(&self) -> Option<String> {
        self.port().map(|p| format!("http://127.0.0.1:{p}"))
    }

    pub fn is_listening(&self) -> bool {
        self.state.is_some()
    }

    /// Close the listener. In-flight requests are not drained.
    pub fn stop(&mut self) {
        let Some(mut l) = self.state.take() else {
            return;
        };
        l.running.store(false, Ordering::SeqCst);
        if let Some(h) = l.handle.take() {
            let _ = h.join();
        }
        tracing::info!(stage = %self.name(), port = l.port, "proxy stage stopped");
    }
}

impl Drop for RewritingProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let (stream, _addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::debug!("accept error: {e}");
                }
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_read_timeout(Some(shared.opts.timeout));
        let _ = stream.set_write_timeout(None);
        let sh = shared.clone();
        std::thread::spawn(move || {
            let mut s = stream;
            handle_connection(&sh, &mut s);
        });
    }
}

fn abort(stream: &TcpStream) {
    let _ = stream.shutdown(Shutdown::Both);
}

fn is_rewrite_method(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

fn handle_connection(shared: &Shared, stream: &mut TcpStream) {
    let stage = shared.rewriter.name();
    let (head, leftover) = match read_request_head(stream) {
        Ok(v) => v,
        Err(HeadError::Closed) => return,
        Err(HeadError::TooLarge) => {
            respond_json(
                stream,
                431,
                &error_body("invalid_request_error", "request header too large"),
            );
            return;
        }
        Err(HeadError::Malformed(m)) => {
            respond_json(stream, 400, &error_body("invalid_request_error", &m));
            return;
        }
        Err(HeadError::Io(e)) => {
            tracing::debug!(stage, "request read failed: {e}");
            return;
        }
    };

    let target = match shared.opts.strip_path_prefix.as_deref() {
        Some(prefix) => strip_path_prefix(&head.target, prefix),
        None => head.target.clone(),
    };

    if head.method == "GET" {
        if let Some(ip) = shared.rewriter.introspection_path() {
            let upstream_path = target.split('?').next().unwrap_or(&target);
            if head.path() == ip || upstream_path == ip {
                respond_json(stream, 200, &shared.rewriter.introspect());
                return;
            }
        }
    }

    let eligible =
        shared.rewriter.inspects_bodies() && is_rewrite_method(&head.method) && head.is_json();
    let body = if eligible {
        match buffered_body(shared, &head, leftover, stream, &target) {
            Some(b) => Some(b),
            None => return,
        }
    } else {
        match streaming_body(&head, leftover, || stream.try_clone()) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(stage, "socket clone failed: {e}");
                abort(stream);
                return;
            }
        }
    };

    tracing::debug!(stage, method = %head.method, path = %target, eligible, "forwarding");
    let resp = match shared
        .forwarder
        .send(&head.method, &target, &head.forwardable_headers(), body)
    {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(stage, path = %target, "{e}");
            let kind = match e {
                ForwardError::Timeout(_) => "upstream_timeout",
                _ => "upstream_error",
            };
            respond_json(stream, 502, &error_body(kind, &e.to_string()));
            return;
        }
    };
    if let Err(e) = relay_response(&head, resp, stream) {
        tracing::debug!(stage, path = %target, "response relay aborted: {e}");
        abort(stream);
    }
}

/// Buffer, parse and rewrite an eligible body. None means a response was already sent or the
/// connection was aborted.
fn buffered_body(
    shared: &Shared,
    head: &RequestHead,
    leftover: Vec<u8>,
    stream: &mut TcpStream,
    target: &str,
) -> Option<Body> {
    let stage = shared.rewriter.name();
    let cap = shared.opts.max_body_bytes;
    let reader = match stream.try_clone() {
        Ok(s) => body_reader(head, leftover, s),
        Err(e) => {
            tracing::debug!(stage, "socket clone failed: {e}");
            abort(stream);
            return None;
        }
    };
    let bytes = match read_body_capped(head, reader, cap) {
        Ok(b) => b,
        Err(BodyReadError::Rewrite(e)) => {
            tracing::warn!(stage, path = %target, "{e}; aborting connection");
            abort(stream);
            return None;
        }
        Err(BodyReadError::Io(e)) => {
            tracing::debug!(stage, "request body read failed: {e}");
            abort(stream);
            return None;
        }
    };
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            let err = RewriteError::InvalidJson(e.to_string());
            tracing::info!(stage, path = %target, "{err}");
            respond_json(
                stream,
                400,
                &error_body("invalid_request_error", &err.to_string()),
            );
            return None;
        }
    };
    match shared.rewriter.rewrite(target, &value) {
        Rewrite::Unchanged => Some(Body::from(bytes)),
        Rewrite::Replace(v) => match serde_json::to_vec(&v) {
            Ok(b) => Some(Body::from(b)),
            Err(_) => Some(Body::from(bytes)),
        },
    }
}

/// Pass-through body read straight off the client socket. `Ok(None)` means the request has
/// no body; an error means the socket could not be opened for reading.
fn streaming_body<S, F>(
    head: &RequestHead,
    leftover: Vec<u8>,
    open: F,
) -> io::Result<Option<Body>>
where
    S: Read + Send + 'static,
    F: FnOnce() -> io::Result<S>,
{
    if !head.has_body() {
        return Ok(None);
    }
    let reader = body_reader(head, leftover, open()?);
    Ok(Some(match head.content_length() {
        Some(n) if !head.is_chunked() => Body::sized(reader, n),
        _ => Body::new(reader),
    }))
}

fn relay_response<W: Write>(
    req: &RequestHead,
    mut resp: reqwest::blocking::Response,
    w: &mut W,
) -> io::Result<()> {
    let status = resp.status().as_u16();
    let mut headers = Vec::new();
    let mut length: Option<u64> = None;
    for (k, v) in resp.headers() {
        if k == reqwest::header::CONTENT_LENGTH {
            length = v.to_str().ok().and_then(|s| s.trim().parse().ok());
            continue;
        }
        if http::is_hop_by_hop(k.as_str()) {
            continue;
        }
        headers.push((
            k.as_str().to_string(),
            String::from_utf8_lossy(v.as_bytes()).to_string(),
        ));
    }
    let bodyless =
        req.method == "HEAD" || status == 204 || status == 304 || (100..200).contains(&status);
    let framing = match (bodyless, length) {
        (true, Some(n)) if req.method == "HEAD" => Framing::Length(n),
        (true, _) => Framing::None,
        (false, Some(n)) => Framing::Length(n),
        (false, None) => Framing::Chunked,
    };
    http::write_response_head(w, status, &headers, framing)?;
    match framing {
        Framing::None => Ok(()),
        Framing::Length(_) if req.method == "HEAD" => Ok(()),
        Framing::Length(_) => {
            io::copy(&mut resp, w)?;
            w.flush()
        }
        Framing::Chunked => {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = resp.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                http::write_chunk(w, &buf[..n])?;
            }
            http::finish_chunked(w)
        }
    }
}
