/*!
Test support helpers shared across integration tests.

- MockUpstream: scripted loopback HTTP/1.1 server recording every request it receives
- http_send_raw(port, bytes): raw TCP request returning the parsed response (status 0 when aborted)
- fake probes: FlagProbe (health from a shared flag), SeqProbe (scripted answers), owner probes
- dead_pid() and spawn_sleep(): PIDs for liveness tests

Nothing here touches ~/.ccs; callers isolate state with tempfile.
*/

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ccs_proxy::{HealthProbe, PortOwner, PortOwnerProbe};

#[allow(dead_code)]
/// One request as seen by the mock upstream.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[allow(dead_code)]
impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("upstream body is JSON")
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Written as one chunk each when `chunked`, else concatenated with Content-Length.
    pub parts: Vec<Vec<u8>>,
    pub chunked: bool,
}

#[allow(dead_code)]
impl MockResponse {
    pub fn json(status: u16, v: serde_json::Value) -> Self {
        MockResponse {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            parts: vec![serde_json::to_vec(&v).expect("json")],
            chunked: false,
        }
    }

    pub fn sse(events: &[&str]) -> Self {
        MockResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/event-stream".to_string())],
            parts: events.iter().map(|e| e.as_bytes().to_vec()).collect(),
            chunked: true,
        }
    }
}

type Responder = dyn Fn(&Recorded) -> MockResponse + Send + Sync;

#[allow(dead_code)]
pub struct MockUpstream {
    port: u16,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

#[allow(dead_code)]
impl MockUpstream {
    /// Answers every request with `{"ok":true}`.
    pub fn start() -> Self {
        MockUpstream::start_with(|_| MockResponse::json(200, serde_json::json!({"ok": true})))
    }

    pub fn start_with<F>(respond: F) -> Self
    where
        F: Fn(&Recorded) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind mock upstream");
        let port = listener.local_addr().expect("addr").port();
        listener.set_nonblocking(true).expect("nonblocking");
        let running = Arc::new(AtomicBool::new(true));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<Responder> = Arc::new(respond);
        let running_cl = running.clone();
        let requests_cl = requests.clone();
        let handle = std::thread::spawn(move || {
            while running_cl.load(Ordering::SeqCst) {
                let stream = match listener.accept() {
                    Ok((s, _)) => s,
                    Err(_) => {
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                };
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
                let reqs = requests_cl.clone();
                let respond = respond.clone();
                std::thread::spawn(move || serve_one(stream, &reqs, respond.as_ref()));
            }
        });
        MockUpstream {
            port,
            running,
            handle: Some(handle),
            requests,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().expect("lock").clone()
    }

    /// Wait briefly for in-flight handler threads to record.
    pub fn requests_after(&self, expected: usize) -> Vec<Recorded> {
        for _ in 0..100 {
            let r = self.requests();
            if r.len() >= expected {
                return r;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.requests()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn read_chunked<R: BufRead>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut line = String::new();
        r.read_line(&mut line)?;
        let size = usize::from_str_radix(line.trim().split(';').next().unwrap_or("0"), 16)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if size == 0 {
            loop {
                let mut t = String::new();
                if r.read_line(&mut t)? == 0 || t.trim().is_empty() {
                    break;
                }
            }
            return Ok(out);
        }
        let mut buf = vec![0u8; size];
        r.read_exact(&mut buf)?;
        out.extend_from_slice(&buf);
        let mut crlf = String::new();
        r.read_line(&mut crlf)?;
    }
}

fn read_request(stream: &TcpStream) -> io::Result<Recorded> {
    let mut r = BufReader::new(stream);
    let mut line = String::new();
    r.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    let mut headers = Vec::new();
    loop {
        let mut h = String::new();
        if r.read_line(&mut h)? == 0 {
            break;
        }
        let h = h.trim_end();
        if h.is_empty() {
            break;
        }
        if let Some((k, v)) = h.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    let mut rec = Recorded {
        method,
        target,
        headers,
        body: Vec::new(),
    };
    let chunked = rec
        .header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        rec.body = read_chunked(&mut r)?;
    } else if let Some(n) = rec.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        let mut body = vec![0u8; n];
        r.read_exact(&mut body)?;
        rec.body = body;
    }
    Ok(rec)
}

fn serve_one(mut stream: TcpStream, reqs: &Mutex<Vec<Recorded>>, respond: &Responder) {
    let rec = match read_request(&stream) {
        Ok(r) => r,
        Err(_) => return,
    };
    let resp = respond(&rec);
    reqs.lock().expect("lock").push(rec);
    let mut head = format!("HTTP/1.1 {} X\r\n", resp.status);
    for (k, v) in &resp.headers {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    if resp.chunked {
        head.push_str("Transfer-Encoding: chunked\r\n");
    } else {
        let len: usize = resp.parts.iter().map(|p| p.len()).sum();
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");
    let _ = stream.write_all(head.as_bytes());
    for p in &resp.parts {
        if resp.chunked {
            let _ = write!(stream, "{:X}\r\n", p.len());
            let _ = stream.write_all(p);
            let _ = stream.write_all(b"\r\n");
            let _ = stream.flush();
            std::thread::sleep(Duration::from_millis(20));
        } else {
            let _ = stream.write_all(p);
        }
    }
    if resp.chunked {
        let _ = stream.write_all(b"0\r\n\r\n");
    }
    let _ = stream.flush();
}

#[allow(dead_code)]
/// Parsed response from `http_send_raw`. `status == 0` means no response head arrived.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[allow(dead_code)]
impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }
}

/// Minimal raw HTTP sender over TCP. Write and read errors are tolerated so aborted
/// connections can be asserted on.
#[allow(dead_code)]
pub fn http_send_raw(port: u16, request: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect failed");
    let _ = stream.set_read_timeout(Some(Duration::from_secs(20)));
    let _ = stream.write_all(request);
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        match stream.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(_) => break,
        }
    }
    parse_response(&buf)
}

fn parse_response(buf: &[u8]) -> RawResponse {
    let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return RawResponse {
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
        };
    };
    let head = String::from_utf8_lossy(&buf[..pos]).to_string();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let raw_body = &buf[pos + 4..];
    let chunked = headers.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
    });
    let body = if chunked {
        read_chunked(&mut BufReader::new(raw_body)).unwrap_or_default()
    } else {
        raw_body.to_vec()
    };
    RawResponse {
        status,
        headers,
        body,
    }
}

/// JSON POST with Content-Length.
#[allow(dead_code)]
pub fn post_json(
    port: u16,
    path: &str,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> RawResponse {
    let mut req = format!(
        "POST {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (k, v) in extra_headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    req.push_str("\r\n");
    req.push_str(body);
    http_send_raw(port, req.as_bytes())
}

#[allow(dead_code)]
pub fn get(port: u16, path: &str, extra_headers: &[(&str, &str)]) -> RawResponse {
    let mut req = format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n");
    for (k, v) in extra_headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    req.push_str("\r\n");
    http_send_raw(port, req.as_bytes())
}

/// A loopback port with nothing listening on it (bound then released).
#[allow(dead_code)]
pub fn closed_port() -> u16 {
    let l = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    l.local_addr().expect("addr").port()
}

/// PID of a process that has already exited and been reaped.
#[allow(dead_code)]
pub fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    let _ = child.wait();
    pid
}

#[allow(dead_code)]
pub fn spawn_sleep(secs: u32) -> Child {
    Command::new("sleep")
        .arg(secs.to_string())
        .spawn()
        .expect("spawn sleep")
}

/// Reap `child` on a background thread so it does not linger as a zombie once killed.
#[allow(dead_code)]
pub fn reap_in_background(mut child: Child) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let _ = child.wait();
    })
}

/// Wait until `pid` is gone or the timeout expires.
#[allow(dead_code)]
pub fn wait_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if !ccs_proxy::pid_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    !ccs_proxy::pid_alive(pid)
}

#[allow(dead_code)]
/// Health from a shared flag.
#[derive(Clone, Default)]
pub struct FlagProbe(pub Arc<AtomicBool>);

#[allow(dead_code)]
impl FlagProbe {
    pub fn new(up: bool) -> Self {
        FlagProbe(Arc::new(AtomicBool::new(up)))
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

impl HealthProbe for FlagProbe {
    fn check(&self, _port: u16, _timeout: Duration) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[allow(dead_code)]
/// Scripted answers, one per call; the last answer repeats.
pub struct SeqProbe {
    answers: Vec<bool>,
    calls: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl SeqProbe {
    pub fn new(answers: &[bool]) -> Self {
        SeqProbe {
            answers: answers.to_vec(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl HealthProbe for SeqProbe {
    fn check(&self, _port: u16, _timeout: Duration) -> bool {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .get(i)
            .or_else(|| self.answers.last())
            .copied()
            .unwrap_or(false)
    }
}

#[allow(dead_code)]
/// Port-owner probe returning a fixed answer.
#[derive(Clone, Default)]
pub struct FixedOwner(pub Option<PortOwner>);

#[allow(dead_code)]
impl FixedOwner {
    pub fn none() -> Self {
        FixedOwner(None)
    }

    pub fn named(pid: u32, name: &str) -> Self {
        FixedOwner(Some(PortOwner {
            pid,
            process_name: name.to_string(),
        }))
    }
}

impl PortOwnerProbe for FixedOwner {
    fn owner(&self, _port: u16) -> Option<PortOwner> {
        self.0.clone()
    }
}
