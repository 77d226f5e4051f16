//! Model catalog: per-(provider, model) reasoning-effort ceilings.

use std::collections::HashMap;

use crate::proxy::effort::EffortLevel;

pub trait ModelCatalog: Send + Sync {
    /// Highest effort the model accepts, or None when the catalog has no opinion.
    fn max_effort(&self, provider: &str, model: &str) -> Option<EffortLevel>;
}

/// In-memory catalog keyed by (provider, model), both lowercased.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: HashMap<(String, String), EffortLevel>,
}

impl StaticCatalog {
    pub fn empty() -> Self {
        StaticCatalog::default()
    }

    /// Built-in table for the providers the proxy rewrites today.
    pub fn builtin() -> Self {
        StaticCatalog::empty()
            .with("codex", "gpt-5.3-codex", EffortLevel::XHigh)
            .with("codex", "gpt-5.2-codex", EffortLevel::XHigh)
            .with("codex", "gpt-5.1-codex-max", EffortLevel::XHigh)
            .with("codex", "gpt-5.1-codex", EffortLevel::High)
            .with("codex", "gpt-5.1-codex-mini", EffortLevel::High)
            .with("codex", "gpt-5-codex", EffortLevel::High)
            .with("codex", "gpt-5-codex-mini", EffortLevel::High)
            .with("codex", "gpt-5.2", EffortLevel::XHigh)
            .with("codex", "gpt-5.1", EffortLevel::High)
            .with("codex", "gpt-5", EffortLevel::High)
    }

    pub fn with(mut self, provider: &str, model: &str, max: EffortLevel) -> Self {
        self.entries.insert(
            (provider.to_ascii_lowercase(), model.to_ascii_lowercase()),
            max,
        );
        self
    }
}

impl ModelCatalog for StaticCatalog {
    fn max_effort(&self, provider: &str, model: &str) -> Option<EffortLevel> {
        self.entries
            .get(&(provider.to_ascii_lowercase(), model.to_ascii_lowercase()))
            .copied()
    }
}
