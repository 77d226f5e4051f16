//! Health prober: one-shot and polling HTTP checks against the shared backend.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

/// One-shot health check against `127.0.0.1:<port>`.
/// Never panics, never errors: unhealthy is `false`.
pub trait HealthProbe: Send + Sync {
    fn check(&self, port: u16, timeout: Duration) -> bool;
}

/// `GET http://127.0.0.1:<port><path>`; any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    path: String,
    client: Option<reqwest::blocking::Client>,
}

impl HttpHealthProbe {
    pub fn new(path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        // Loopback only; never route health checks through an ambient HTTP(S)_PROXY.
        let client = reqwest::blocking::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| tracing::warn!("health client init failed: {e}"))
            .ok();
        HttpHealthProbe { path, client }
    }

    pub fn url_for(&self, port: u16) -> String {
        format!("http://127.0.0.1:{port}{}", self.path)
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        HttpHealthProbe::new("/")
    }
}

impl HealthProbe for HttpHealthProbe {
    fn check(&self, port: u16, timeout: Duration) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        match client.get(self.url_for(port)).timeout(timeout).send() {
            Ok(resp) => {
                let ok = resp.status().is_success();
                tracing::trace!(port, status = resp.status().as_u16(), "health probe");
                ok
            }
            Err(e) => {
                tracing::trace!(port, "health probe failed: {e}");
                false
            }
        }
    }
}

/// Poll `probe` every `poll` until healthy or `timeout` elapses. Never errors.
pub fn wait_until_healthy(
    probe: &dyn HealthProbe,
    port: u16,
    timeout: Duration,
    poll: Duration,
) -> bool {
    wait_until_healthy_with(probe, port, timeout, poll, |_| ControlFlow::Continue(()))
}

/// Like [`wait_until_healthy`], calling `on_attempt(elapsed)` after each failed attempt.
/// `ControlFlow::Break` gives up early and reports unhealthy.
pub fn wait_until_healthy_with<F>(
    probe: &dyn HealthProbe,
    port: u16,
    timeout: Duration,
    poll: Duration,
    mut on_attempt: F,
) -> bool
where
    F: FnMut(Duration) -> ControlFlow<()>,
{
    let start = Instant::now();
    let per_try = poll.max(Duration::from_millis(200)).min(Duration::from_secs(1));
    loop {
        if probe.check(port, per_try) {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        if on_attempt(elapsed).is_break() {
            return false;
        }
        std::thread::sleep(poll.min(timeout - elapsed));
    }
}
