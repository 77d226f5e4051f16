//! Ordered composition of proxy stages. Specs are listed outermost first; each stage's upstream
//! is the next-inner stage's listen URL and the innermost one targets the backend. Clients only
//! ever see `client_url()`, the outermost address.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::server::{ProxyOptions, RequestRewriter, Rewrite, RewritingProxy};
use crate::config::DEFAULT_MAX_BODY_BYTES;

/// Rewrites nothing and never buffers bodies. Used to bridge a plain-HTTP client to an
/// `https://` upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl RequestRewriter for Passthrough {
    fn name(&self) -> &str {
        "tunnel"
    }

    fn inspects_bodies(&self) -> bool {
        false
    }

    fn rewrite(&self, _path: &str, _body: &Value) -> Rewrite {
        Rewrite::Unchanged
    }
}

#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub rewriter: Arc<dyn RequestRewriter>,
    pub strip_path_prefix: Option<String>,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl StageSpec {
    pub fn new(rewriter: Arc<dyn RequestRewriter>) -> Self {
        StageSpec {
            name: rewriter.name().to_string(),
            rewriter,
            strip_path_prefix: None,
            timeout: Duration::from_secs(600),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn strip_path_prefix(mut self, prefix: Option<String>) -> Self {
        self.strip_path_prefix = prefix.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_body_bytes(mut self, cap: usize) -> Self {
        self.max_body_bytes = cap;
        self
    }
}

pub struct ProxyChain {
    /// Outermost first.
    stages: Vec<RewritingProxy>,
    terminal: String,
}

impl ProxyChain {
    /// Start stages innermost first. A failure stops whatever already started.
    pub fn start(specs: Vec<StageSpec>, backend_base_url: &str) -> io::Result<ProxyChain> {
        let mut upstream = backend_base_url.trim_end_matches('/').to_string();
        let mut started: Vec<RewritingProxy> = Vec::with_capacity(specs.len());
        for spec in specs.into_iter().rev() {
            let opts = ProxyOptions {
                upstream: upstream.clone(),
                strip_path_prefix: spec.strip_path_prefix.clone(),
                max_body_bytes: spec.max_body_bytes,
                timeout: spec.timeout,
            };
            let mut stage = RewritingProxy::new(spec.rewriter.clone(), opts)?;
            stage.start()?;
            tracing::debug!(
                stage = %spec.name,
                url = ?stage.url(),
                upstream = %upstream,
                "chain stage wired"
            );
            if let Some(url) = stage.url() {
                upstream = url;
            }
            started.push(stage);
        }
        started.reverse();
        Ok(ProxyChain {
            stages: started,
            terminal: backend_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Empty chain: the client talks to the backend directly.
    pub fn direct(backend_base_url: &str) -> ProxyChain {
        ProxyChain {
            stages: Vec::new(),
            terminal: backend_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The only address handed to the client.
    pub fn client_url(&self) -> String {
        self.stages
            .first()
            .and_then(|s| s.url())
            .unwrap_or_else(|| self.terminal.clone())
    }

    pub fn stage_urls(&self) -> Vec<String> {
        self.stages.iter().filter_map(|s| s.url()).collect()
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stop every stage, outermost first. Idempotent.
    pub fn stop(&mut self) {
        for s in self.stages.iter_mut() {
            s.stop();
        }
    }
}

impl Drop for ProxyChain {
    fn drop(&mut self) {
        self.stop();
    }
}
