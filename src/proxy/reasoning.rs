//! Reasoning-effort rewriter: resolves an effort for the request's model and injects it as
//! `reasoning.effort`, stripping client-only decorations from the model id.
//!
//! Resolution order: context marker (`[1m]`) removed; a trailing `-<effort>` suffix wins; else the
//! Effort Map; else the configured default. The result is capped by the catalog's ceiling.
//! With `disable_effort` the model id is still cleaned but no effort is injected.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::effort::{parse_effort_suffix, strip_context_marker, EffortLevel, EffortMap};
use super::server::{RequestRewriter, Rewrite};
use super::trace::TraceSink;
use crate::catalog::ModelCatalog;
use crate::config::Config;

pub const INTROSPECTION_PATH: &str = "/__ccs/reasoning";
pub const RECENT_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortSource {
    Suffix,
    Map,
    Default,
    None,
}

/// Outcome of resolving one client model id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub upstream_model: String,
    pub effort: Option<EffortLevel>,
    pub source: EffortSource,
    pub capped: bool,
}

/// One rewritten request. Never holds request or response content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub at: String,
    pub original_model: String,
    pub upstream_model: String,
    pub effort: Option<EffortLevel>,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub requests: u64,
    pub rewritten: u64,
    pub suffix: u64,
    pub map: u64,
    pub default: u64,
    pub capped: u64,
    pub passthrough: u64,
}

#[derive(Debug, Default)]
struct Stats {
    totals: Totals,
    recent: VecDeque<RequestRecord>,
}

pub struct ReasoningRewriter {
    provider: String,
    disable_effort: bool,
    default_effort: Option<EffortLevel>,
    map: EffortMap,
    catalog: Arc<dyn ModelCatalog>,
    trace: TraceSink,
    stats: Mutex<Stats>,
}

impl ReasoningRewriter {
    pub fn new(provider: &str, map: EffortMap, catalog: Arc<dyn ModelCatalog>) -> Self {
        ReasoningRewriter {
            provider: provider.to_string(),
            disable_effort: false,
            default_effort: None,
            map,
            catalog,
            trace: TraceSink::disabled(),
            stats: Mutex::new(Stats::default()),
        }
    }

    pub fn from_config(cfg: &Config, catalog: Arc<dyn ModelCatalog>) -> Self {
        let map = EffortMap::from_assignments(cfg.tier_assignments());
        tracing::debug!(models = map.len(), "effort map built");
        ReasoningRewriter::new(&cfg.reasoning.provider, map, catalog)
            .with_default_effort(cfg.reasoning.default_effort)
            .with_disable_effort(cfg.reasoning.disable_effort)
            .with_trace(TraceSink::from_config(&cfg.reasoning.trace, &cfg.config_dir))
    }

    pub fn with_default_effort(mut self, effort: Option<EffortLevel>) -> Self {
        self.default_effort = effort;
        self
    }

    pub fn with_disable_effort(mut self, disable: bool) -> Self {
        self.disable_effort = disable;
        self
    }

    pub fn with_trace(mut self, trace: TraceSink) -> Self {
        self.trace = trace;
        self
    }

    pub fn resolve(&self, model: &str) -> Resolution {
        let clean = strip_context_marker(model);
        let (upstream, effort, source) = match parse_effort_suffix(clean) {
            Some((base, e)) => (base, Some(e), EffortSource::Suffix),
            None => match (self.map.get(clean), self.default_effort) {
                (Some(e), _) => (clean, Some(e), EffortSource::Map),
                (None, Some(e)) => (clean, Some(e), EffortSource::Default),
                (None, None) => (clean, None, EffortSource::None),
            },
        };
        if self.disable_effort {
            return Resolution {
                upstream_model: upstream.to_string(),
                effort: None,
                source: EffortSource::None,
                capped: false,
            };
        }
        let (effort, capped) = match effort {
            Some(e) => {
                let max = self.catalog.max_effort(&self.provider, upstream);
                let c = e.capped(max);
                (Some(c), c != e)
            }
            None => (None, false),
        };
        Resolution {
            upstream_model: upstream.to_string(),
            effort,
            source,
            capped,
        }
    }

    pub fn totals(&self) -> Totals {
        self.lock_stats().totals.clone()
    }

    pub fn recent(&self) -> Vec<RequestRecord> {
        self.lock_stats().recent.iter().cloned().collect()
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn count_passthrough(&self) {
        let mut st = self.lock_stats();
        st.totals.requests += 1;
        st.totals.passthrough += 1;
    }
}

/// `reasoning.effort` overwritten; sibling `reasoning` fields kept.
fn merge_effort(body: &mut Map<String, Value>, effort: EffortLevel) {
    match body.get_mut("reasoning") {
        Some(Value::Object(r)) => {
            r.insert("effort".to_string(), Value::String(effort.as_str().to_string()));
        }
        _ => {
            body.insert("reasoning".to_string(), json!({ "effort": effort.as_str() }));
        }
    }
}

impl RequestRewriter for ReasoningRewriter {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn rewrite(&self, path: &str, body: &Value) -> Rewrite {
        let Some(obj) = body.as_object() else {
            self.count_passthrough();
            return Rewrite::Unchanged;
        };
        let Some(model) = obj.get("model").and_then(Value::as_str) else {
            self.count_passthrough();
            return Rewrite::Unchanged;
        };
        let res = self.resolve(model);
        if res.effort.is_none() && res.upstream_model == model {
            self.count_passthrough();
            return Rewrite::Unchanged;
        }

        let mut out = obj.clone();
        out.insert("model".to_string(), Value::String(res.upstream_model.clone()));
        if let Some(e) = res.effort {
            merge_effort(&mut out, e);
        }

        let record = RequestRecord {
            at: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            original_model: model.to_string(),
            upstream_model: res.upstream_model.clone(),
            effort: res.effort,
            path: path.split('?').next().unwrap_or(path).to_string(),
        };
        tracing::debug!(
            model = %record.original_model,
            upstream = %record.upstream_model,
            effort = ?res.effort,
            source = ?res.source,
            capped = res.capped,
            "reasoning rewrite"
        );
        if self.trace.is_enabled() {
            self.trace.record(&json!({
                "at": record.at,
                "provider": self.provider,
                "path": record.path,
                "originalModel": record.original_model,
                "upstreamModel": record.upstream_model,
                "effort": record.effort,
                "source": res.source,
                "capped": res.capped,
            }));
        }
        {
            let mut st = self.lock_stats();
            st.totals.requests += 1;
            st.totals.rewritten += 1;
            match res.source {
                EffortSource::Suffix => st.totals.suffix += 1,
                EffortSource::Map => st.totals.map += 1,
                EffortSource::Default => st.totals.default += 1,
                EffortSource::None => {}
            }
            if res.capped {
                st.totals.capped += 1;
            }
            if st.recent.len() >= RECENT_CAP {
                st.recent.pop_front();
            }
            st.recent.push_back(record);
        }
        Rewrite::Replace(Value::Object(out))
    }

    fn introspection_path(&self) -> Option<&str> {
        Some(INTROSPECTION_PATH)
    }

    fn introspect(&self) -> Value {
        let st = self.lock_stats();
        json!({
            "provider": self.provider,
            "disableEffort": self.disable_effort,
            "totals": st.totals,
            "recent": st.recent,
        })
    }
}
