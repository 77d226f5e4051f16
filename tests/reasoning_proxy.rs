mod support;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ccs_proxy::proxy::INTROSPECTION_PATH;
use ccs_proxy::{
    Config, EffortLevel, EffortMap, HealthProbe, HttpHealthProbe, ProxyOptions,
    ReasoningRewriter, RequestRewriter, RewritingProxy, StaticCatalog,
};
use support::{get, http_send_raw, post_json, MockResponse, MockUpstream};

fn start_stage(
    rewriter: Arc<ReasoningRewriter>,
    upstream: &str,
    tweak: impl FnOnce(&mut ProxyOptions),
) -> (RewritingProxy, u16) {
    let mut opts = ProxyOptions::new(upstream);
    opts.timeout = Duration::from_secs(10);
    tweak(&mut opts);
    let mut proxy =
        RewritingProxy::new(rewriter as Arc<dyn RequestRewriter>, opts).expect("proxy");
    let port = proxy.start().expect("start");
    (proxy, port)
}

/// One-shot upstream: reads a full request, writes `reply` verbatim, then keeps the socket
/// open for `hold` before dropping it.
fn scripted_upstream(reply: &'static [u8], hold: Duration) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handle = std::thread::spawn(move || {
        let Ok((mut s, _)) = listener.accept() else {
            return;
        };
        let _ = s.set_read_timeout(Some(Duration::from_secs(5)));
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .filter_map(|l| l.strip_prefix("content-length:"))
                    .find_map(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    break;
                }
            }
            match s.read(&mut tmp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
        let _ = s.write_all(reply);
        let _ = s.flush();
        std::thread::sleep(hold);
    });
    (port, handle)
}

fn codex(map: EffortMap) -> Arc<ReasoningRewriter> {
    Arc::new(ReasoningRewriter::new(
        "codex",
        map,
        Arc::new(StaticCatalog::builtin()),
    ))
}

#[test]
fn test_suffix_and_context_marker_are_rewritten_upstream() {
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |_| {});

    let resp = post_json(
        port,
        "/v1/messages",
        r#"{"model":"gpt-5.3-codex-high[1m]","messages":[],"reasoning":{"summary":"auto"}}"#,
        &[],
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.json()["ok"], true);

    let reqs = up.requests_after(1);
    assert_eq!(reqs.len(), 1);
    let body = reqs[0].json();
    assert_eq!(body["model"], "gpt-5.3-codex");
    assert_eq!(body["reasoning"]["effort"], "high");
    assert_eq!(body["reasoning"]["summary"], "auto");
    assert_eq!(body["messages"], serde_json::json!([]));
    assert_eq!(reqs[0].target, "/v1/messages");
}

#[test]
fn test_duplicate_tier_models_keep_lowest_effort() {
    let mut cfg = Config::default();
    cfg.reasoning.tiers.opus.model = Some("gpt-5.2-codex".to_string());
    let assignments = cfg.tier_assignments_with(|k| match k {
        "ANTHROPIC_MODEL" => Some("gpt-5.2-codex".to_string()),
        "ANTHROPIC_DEFAULT_HAIKU_MODEL" => Some("gpt-5.2-codex[1m]".to_string()),
        _ => None,
    });
    assert_eq!(assignments.len(), 3);
    let map = EffortMap::from_assignments(assignments);
    assert_eq!(map.get("gpt-5.2-codex"), Some(EffortLevel::Medium));

    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(map), &up.url(), |_| {});
    let resp = post_json(port, "/v1/messages", r#"{"model":"GPT-5.2-codex"}"#, &[]);
    assert_eq!(resp.status, 200);
    let body = up.requests_after(1)[0].json();
    assert_eq!(body["reasoning"]["effort"], "medium");
    assert_eq!(body["model"], "GPT-5.2-codex");
}

#[test]
fn test_catalog_ceiling_caps_requested_effort() {
    let rw = codex(EffortMap::new());
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(rw.clone(), &up.url(), |_| {});

    let resp = post_json(port, "/v1/messages", r#"{"model":"gpt-5-codex-xhigh"}"#, &[]);
    assert_eq!(resp.status, 200);
    let body = up.requests_after(1)[0].json();
    assert_eq!(body["model"], "gpt-5-codex");
    assert_eq!(body["reasoning"]["effort"], "high");
    let totals = rw.totals();
    assert_eq!(totals.capped, 1);
    assert_eq!(totals.suffix, 1);
}

#[test]
fn test_disable_effort_cleans_model_without_effort() {
    let rw = Arc::new(
        ReasoningRewriter::new("codex", EffortMap::new(), Arc::new(StaticCatalog::builtin()))
            .with_disable_effort(true)
            .with_default_effort(Some(EffortLevel::Low)),
    );
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(rw, &up.url(), |_| {});
    let resp = post_json(port, "/v1/messages", r#"{"model":"gpt-5.3-codex-high[1m]"}"#, &[]);
    assert_eq!(resp.status, 200);
    let body = up.requests_after(1)[0].json();
    assert_eq!(body["model"], "gpt-5.3-codex");
    assert!(body.get("reasoning").is_none());
}

#[test]
fn test_prefix_is_stripped_only_on_segment_boundary() {
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |o| {
        o.strip_path_prefix = Some("/api/provider/codex".to_string());
    });

    let r1 = post_json(
        port,
        "/api/provider/codex/v1/messages?beta=true",
        r#"{"model":"gpt-5-codex"}"#,
        &[],
    );
    assert_eq!(r1.status, 200);
    let r2 = post_json(
        port,
        "/api/provider/codexx/v1/messages",
        r#"{"model":"gpt-5-codex"}"#,
        &[],
    );
    assert_eq!(r2.status, 200);

    let reqs = up.requests_after(2);
    let mut targets: Vec<String> = reqs.iter().map(|r| r.target.clone()).collect();
    targets.sort();
    assert_eq!(
        targets,
        vec![
            "/api/provider/codexx/v1/messages".to_string(),
            "/v1/messages?beta=true".to_string(),
        ]
    );
}

#[test]
fn test_invalid_json_is_rejected_locally() {
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |_| {});
    let resp = post_json(port, "/v1/messages", r#"{"model": "gpt-5-codex""#, &[]);
    assert_eq!(resp.status, 400);
    let v = resp.json();
    assert_eq!(v["type"], "error");
    assert_eq!(v["error"]["type"], "invalid_request_error");
    std::thread::sleep(Duration::from_millis(100));
    assert!(up.requests().is_empty());
}

#[test]
fn test_body_over_cap_aborts_without_forwarding() {
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |o| {
        o.max_body_bytes = 1024;
    });
    let padding = "x".repeat(64 * 1024);
    let body = format!(r#"{{"model":"gpt-5-codex","pad":"{padding}"}}"#);
    let resp = post_json(port, "/v1/messages", &body, &[]);
    assert_eq!(resp.status, 0, "connection must be aborted, not answered");
    std::thread::sleep(Duration::from_millis(100));
    assert!(up.requests().is_empty());
}

#[test]
fn test_introspection_reports_rewrites_and_is_not_forwarded() {
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |o| {
        o.strip_path_prefix = Some("/api/provider/codex".to_string());
    });
    assert_eq!(
        post_json(port, "/v1/messages", r#"{"model":"gpt-5-codex-low"}"#, &[]).status,
        200
    );
    assert_eq!(
        post_json(port, "/v1/messages", r#"{"messages":[]}"#, &[]).status,
        200
    );
    up.requests_after(2);

    let resp = get(port, &format!("/api/provider/codex{INTROSPECTION_PATH}"), &[]);
    assert_eq!(resp.status, 200);
    let v = resp.json();
    assert_eq!(v["provider"], "codex");
    assert_eq!(v["disableEffort"], false);
    assert_eq!(v["totals"]["requests"], 2);
    assert_eq!(v["totals"]["rewritten"], 1);
    assert_eq!(v["totals"]["passthrough"], 1);
    assert_eq!(v["recent"][0]["originalModel"], "gpt-5-codex-low");
    assert_eq!(v["recent"][0]["upstreamModel"], "gpt-5-codex");
    assert_eq!(v["recent"][0]["effort"], "low");

    let direct = get(port, INTROSPECTION_PATH, &[]);
    assert_eq!(direct.status, 200);
    assert_eq!(up.requests().len(), 2);
}

#[test]
fn test_get_passthrough_strips_hop_by_hop_headers() {
    let up = MockUpstream::start_with(|_| {
        let mut r = MockResponse::json(200, serde_json::json!({"data": []}));
        r.headers.push(("Keep-Alive".to_string(), "timeout=5".to_string()));
        r.headers.push(("X-Upstream".to_string(), "1".to_string()));
        r
    });
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |_| {});
    let resp = get(
        port,
        "/v1/models?limit=5",
        &[
            ("Connection", "keep-alive, X-Drop-Me"),
            ("X-Drop-Me", "1"),
            ("Keep-Alive", "timeout=5"),
            ("Proxy-Authorization", "Basic abc"),
            ("X-Api-Key", "secret"),
        ],
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("x-upstream"), Some("1"));
    assert!(resp.header("keep-alive").is_none());
    assert_eq!(resp.header("connection"), Some("close"));
    assert_eq!(resp.json()["data"], serde_json::json!([]));

    let reqs = up.requests_after(1);
    let r = &reqs[0];
    assert_eq!(r.method, "GET");
    assert_eq!(r.target, "/v1/models?limit=5");
    assert_eq!(r.header("x-api-key"), Some("secret"));
    assert!(r.header("x-drop-me").is_none());
    assert!(r.header("keep-alive").is_none());
    assert!(r.header("proxy-authorization").is_none());
}

#[test]
fn test_dead_upstream_yields_502() {
    let dead = support::closed_port();
    let (_proxy, port) = start_stage(
        codex(EffortMap::new()),
        &format!("http://127.0.0.1:{dead}"),
        |_| {},
    );
    let resp = post_json(port, "/v1/messages", r#"{"model":"gpt-5-codex-high"}"#, &[]);
    assert_eq!(resp.status, 502);
    let v = resp.json();
    assert_eq!(v["type"], "error");
    assert!(v["error"]["type"]
        .as_str()
        .map(|s| s.starts_with("upstream_"))
        .unwrap_or(false));
}

#[test]
fn test_silent_upstream_times_out_with_502() {
    let (up, handle) = scripted_upstream(b"", Duration::from_secs(3));
    let (_proxy, port) = start_stage(
        codex(EffortMap::new()),
        &format!("http://127.0.0.1:{up}"),
        |o| o.timeout = Duration::from_secs(1),
    );
    let started = Instant::now();
    let resp = post_json(port, "/v1/messages", r#"{"model":"gpt-5-codex-high"}"#, &[]);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(resp.status, 502);
    assert_eq!(resp.json()["error"]["type"], "upstream_timeout");
    let _ = handle.join();
}

#[test]
fn test_upstream_stall_after_head_closes_client_connection() {
    const REPLY: &[u8] = concat!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n",
        "{\"partial\":"
    )
    .as_bytes();
    let (up, handle) = scripted_upstream(REPLY, Duration::from_secs(3));
    let (_proxy, port) = start_stage(
        codex(EffortMap::new()),
        &format!("http://127.0.0.1:{up}"),
        |o| o.timeout = Duration::from_secs(1),
    );
    let started = Instant::now();
    let resp = post_json(port, "/v1/messages", r#"{"model":"gpt-5-codex-high"}"#, &[]);
    // The head was already relayed: no 502 can follow, only a cut connection.
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-length"), Some("100"));
    assert!(resp.body.len() < 100);
    assert!(resp.body.starts_with(b"{\"partial\""));
    let _ = handle.join();
}

#[test]
fn test_upstream_drop_mid_body_closes_client_connection() {
    const REPLY: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 64\r\n\r\ncut";
    let (up, handle) = scripted_upstream(REPLY, Duration::ZERO);
    let (_proxy, port) = start_stage(
        codex(EffortMap::new()),
        &format!("http://127.0.0.1:{up}"),
        |_| {},
    );
    let resp = get(port, "/v1/models", &[]);
    assert_eq!(resp.status, 200);
    assert!(resp.body.len() < 64);
    let _ = handle.join();
}

#[test]
fn test_forward_timeout_is_independent_of_health_checks() {
    let up = MockUpstream::start_with(|r| {
        if r.method == "POST" {
            std::thread::sleep(Duration::from_secs(2));
        }
        MockResponse::json(200, serde_json::json!({"ok": true}))
    });
    let health = HttpHealthProbe::new("/healthz");
    assert!(health.check(up.port(), Duration::from_millis(500)));

    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |o| {
        o.timeout = Duration::from_secs(1);
    });
    let resp = post_json(port, "/v1/messages", r#"{"model":"gpt-5-codex-high"}"#, &[]);
    assert_eq!(resp.status, 502);
    assert_eq!(resp.json()["error"]["type"], "upstream_timeout");

    // The slow POST is still in flight upstream; health stays quick and green.
    let started = Instant::now();
    assert!(health.check(up.port(), Duration::from_millis(500)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_streaming_response_is_relayed_in_order() {
    let events = [
        "event: message_start\ndata: {}\n\n",
        "event: content_block_delta\ndata: {\"text\":\"hi\"}\n\n",
        "event: message_stop\ndata: {}\n\n",
    ];
    let up = MockUpstream::start_with(move |_| MockResponse::sse(&events));
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |_| {});
    let resp = post_json(
        port,
        "/v1/messages",
        r#"{"model":"gpt-5-codex","stream":true}"#,
        &[],
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("text/event-stream"));
    assert!(resp
        .header("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false));
    assert_eq!(String::from_utf8_lossy(&resp.body), events.concat());
}

#[test]
fn test_chunked_json_request_is_rewritten() {
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |_| {});
    let part1 = r#"{"model":"gpt-5.1-"#;
    let part2 = r#"codex-medium","max_tokens":16}"#;
    let req = format!(
        "POST /v1/messages HTTP/1.1\r\nHost: x\r\nContent-Type: application/json; charset=utf-8\r\nTransfer-Encoding: chunked\r\n\r\n{:X}\r\n{part1}\r\n{:X}\r\n{part2}\r\n0\r\n\r\n",
        part1.len(),
        part2.len()
    );
    let resp = http_send_raw(port, req.as_bytes());
    assert_eq!(resp.status, 200);
    let body = up.requests_after(1)[0].json();
    assert_eq!(body["model"], "gpt-5.1-codex");
    assert_eq!(body["reasoning"]["effort"], "medium");
    assert_eq!(body["max_tokens"], 16);
}

#[test]
fn test_non_json_post_is_forwarded_verbatim() {
    let up = MockUpstream::start();
    let (_proxy, port) = start_stage(codex(EffortMap::new()), &up.url(), |_| {});
    let payload = "model=gpt-5-codex-high[1m]";
    let req = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{payload}",
        payload.len()
    );
    let resp = http_send_raw(port, req.as_bytes());
    assert_eq!(resp.status, 200);
    let reqs = up.requests_after(1);
    assert_eq!(reqs[0].body, payload.as_bytes());
    assert_eq!(reqs[0].header("content-type"), Some("text/plain"));
}
