//! Proxy detector: arbitrates HTTP health, the session lock and the port owner into one status.
//!
//! Cascade, most reliable first:
//! 1. HTTP health (verified). PID from the lock, else from the port owner.
//! 2. Session lock present: running but unverified (may still be starting).
//! 3. Port owner: free port; our backend by name (retry HTTP once); or an unrecognized
//!    name (one more HTTP probe, else blocked by a foreign process).
//!
//! Step 3's name match is a portability shim, not an ownership proof: process names are
//! truncated or opaque on some platforms, so an unrecognized owner still gets one HTTP chance.

use std::ops::ControlFlow;
use std::time::Duration;

use serde::Serialize;

use crate::config::{Config, DEFAULT_BACKEND_BINARY_NAME, DEFAULT_PORT};
use crate::health::{self, HealthProbe, HttpHealthProbe};
use crate::process::{PortOwner, PortOwnerProbe, SystemPortOwnerProbe};
use crate::session::SessionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectMethod {
    Http,
    SessionLock,
    PortProcess,
    HttpRetry,
}

impl DetectMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectMethod::Http => "http",
            DetectMethod::SessionLock => "session-lock",
            DetectMethod::PortProcess => "port-process",
            DetectMethod::HttpRetry => "http-retry",
        }
    }
}

/// Derived, never persisted. `verified` is true only when a health probe succeeded in this call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub port: u16,
    pub running: bool,
    pub verified: bool,
    pub method: DetectMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocker: Option<PortOwner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_count: Option<usize>,
}

impl ProxyStatus {
    fn new(port: u16, method: DetectMethod) -> Self {
        ProxyStatus {
            port,
            running: false,
            verified: false,
            method,
            pid: None,
            blocked: false,
            blocker: None,
            session_count: None,
        }
    }

    /// Healthy and answering: safe to join.
    pub fn is_verified_healthy(&self) -> bool {
        self.running && self.verified
    }
}

/// Replace missing or out-of-range ports with `default`.
pub fn sanitize_port(raw: Option<i64>, default: u16) -> u16 {
    match raw {
        Some(p) if p > 0 && p <= u16::MAX as i64 => p as u16,
        _ => default,
    }
}

/// Parse a user-supplied port string. Non-numeric input (including "NaN") yields None.
pub fn parse_port_arg(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

/// Match a reported process name against the backend binary name, tolerating `.exe`,
/// case differences and kernel/lsof name truncation (15 chars on Linux).
pub fn process_name_matches(reported: &str, backend: &str) -> bool {
    let norm = |s: &str| {
        let s = s.trim().to_ascii_lowercase();
        s.strip_suffix(".exe").map(str::to_string).unwrap_or(s)
    };
    let r = norm(reported);
    let b = norm(backend);
    if r.is_empty() || b.is_empty() {
        return false;
    }
    r == b || r.starts_with(&b) || (r.len() >= 8 && b.starts_with(&r))
}

pub struct ProxyDetector {
    health: Box<dyn HealthProbe>,
    owner: Box<dyn PortOwnerProbe>,
    tracker: SessionTracker,
    backend_name: String,
    probe_timeout: Duration,
    default_port: u16,
}

impl ProxyDetector {
    pub fn new(
        tracker: SessionTracker,
        health: Box<dyn HealthProbe>,
        owner: Box<dyn PortOwnerProbe>,
    ) -> Self {
        let default_port = tracker.default_port();
        ProxyDetector {
            health,
            owner,
            tracker,
            backend_name: DEFAULT_BACKEND_BINARY_NAME.to_string(),
            probe_timeout: Duration::from_secs(1),
            default_port,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        ProxyDetector::new(
            SessionTracker::from_config(cfg),
            Box::new(HttpHealthProbe::new(&cfg.backend.health_path)),
            Box::new(SystemPortOwnerProbe),
        )
        .with_backend_name(&cfg.backend.binary_name)
        .with_probe_timeout(cfg.timeouts.probe())
        .with_default_port(cfg.port)
    }

    pub fn with_backend_name(mut self, name: &str) -> Self {
        self.backend_name = name.to_string();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Port used when `detect` receives an invalid port. Defaults to the tracker's default port.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = if port == 0 { DEFAULT_PORT } else { port };
        self
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    fn probe(&self, port: u16) -> bool {
        self.health.check(port, self.probe_timeout)
    }

    /// Run the detection cascade. Never fails; invalid ports fall back to the default port.
    pub fn detect(&self, port: Option<i64>, verbose: bool) -> ProxyStatus {
        let port = sanitize_port(port, self.default_port);
        let say = |msg: &str| {
            tracing::debug!(port, "{msg}");
            if verbose {
                eprintln!("ccs-proxy: detect[{port}]: {msg}");
            }
        };

        // 1) HTTP health
        if self.probe(port) {
            let mut st = ProxyStatus::new(port, DetectMethod::Http);
            st.running = true;
            st.verified = true;
            if let Some(lock) = self.tracker.get_existing_proxy(port) {
                st.pid = Some(lock.pid);
                st.session_count = Some(lock.sessions.len());
            } else if let Some(owner) = self.owner.owner(port) {
                // Healthy but untracked: orphan from a crashed tracker or an external start.
                st.pid = Some(owner.pid);
            }
            say("healthy via http");
            return st;
        }

        // 2) Session lock
        if let Some(lock) = self.tracker.get_existing_proxy(port) {
            let mut st = ProxyStatus::new(port, DetectMethod::SessionLock);
            st.running = true;
            st.pid = Some(lock.pid);
            st.session_count = Some(lock.sessions.len());
            say("session lock present but http unhealthy (starting?)");
            return st;
        }

        // 3) Port owner
        let Some(owner) = self.owner.owner(port) else {
            say("port free");
            return ProxyStatus::new(port, DetectMethod::PortProcess);
        };

        if process_name_matches(&owner.process_name, &self.backend_name) {
            if self.probe(port) {
                let mut st = ProxyStatus::new(port, DetectMethod::HttpRetry);
                st.running = true;
                st.verified = true;
                st.pid = Some(owner.pid);
                say("backend process owns port; healthy on retry");
                return st;
            }
            let mut st = ProxyStatus::new(port, DetectMethod::PortProcess);
            st.running = true;
            st.pid = Some(owner.pid);
            say("backend process owns port but is not healthy (starting or stuck)");
            return st;
        }

        if self.probe(port) {
            let mut st = ProxyStatus::new(port, DetectMethod::HttpRetry);
            st.running = true;
            st.verified = true;
            st.pid = Some(owner.pid);
            say(&format!(
                "unrecognized owner '{}' answers health; reclaiming",
                owner.process_name
            ));
            return st;
        }

        say(&format!("port blocked by {owner}"));
        let mut st = ProxyStatus::new(port, DetectMethod::PortProcess);
        st.blocked = true;
        st.blocker = Some(owner);
        st
    }

    /// Poll health until healthy or `timeout`. Never fails.
    pub fn wait_until_healthy(&self, port: u16, timeout: Duration, poll: Duration) -> bool {
        health::wait_until_healthy(self.health.as_ref(), port, timeout, poll)
    }

    /// Like `wait_until_healthy`, reporting elapsed time after each failed attempt; `Break` stops.
    pub fn wait_until_healthy_with<F>(
        &self,
        port: u16,
        timeout: Duration,
        poll: Duration,
        on_attempt: F,
    ) -> bool
    where
        F: FnMut(Duration) -> ControlFlow<()>,
    {
        health::wait_until_healthy_with(self.health.as_ref(), port, timeout, poll, on_attempt)
    }

    /// Register a session against a detected but untracked backend PID.
    pub fn reclaim_orphan(&self, port: u16, pid: u32) -> Option<String> {
        match self.tracker.register_session(port, pid) {
            Ok(id) => {
                tracing::info!(port, pid, session = %id, "reclaimed untracked backend");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(port, pid, "failed to reclaim untracked backend: {e}");
                None
            }
        }
    }
}
