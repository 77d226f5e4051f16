//! Reasoning effort levels, the model-id suffix grammar, and the per-instance Effort Map.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered lowest to highest; `Ord` is the rank used for "minimum wins" and catalog caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortLevel {
    Minimal,
    Low,
    Medium,
    High,
    XHigh,
}

impl EffortLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffortLevel::Minimal => "minimal",
            EffortLevel::Low => "low",
            EffortLevel::Medium => "medium",
            EffortLevel::High => "high",
            EffortLevel::XHigh => "xhigh",
        }
    }

    pub fn parse(s: &str) -> Option<EffortLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(EffortLevel::Minimal),
            "low" => Some(EffortLevel::Low),
            "medium" => Some(EffortLevel::Medium),
            "high" => Some(EffortLevel::High),
            "xhigh" => Some(EffortLevel::XHigh),
            _ => None,
        }
    }

    /// Never exceed `max` when the catalog declares one.
    pub fn capped(self, max: Option<EffortLevel>) -> EffortLevel {
        match max {
            Some(m) if self > m => m,
            _ => self,
        }
    }
}

impl fmt::Display for EffortLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EffortLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EffortLevel::parse(s).ok_or_else(|| format!("unknown reasoning effort '{s}'"))
    }
}

/// Remove a trailing context-window marker such as `[1m]` or `[200k]`.
pub fn strip_context_marker(model: &str) -> &str {
    let t = model.trim_end();
    let Some(open) = t.rfind('[') else {
        return t;
    };
    let Some(inner) = t[open + 1..].strip_suffix(']') else {
        return t;
    };
    let digits = inner.trim_end_matches(['k', 'K', 'm', 'M']);
    let unit_len = inner.len() - digits.len();
    if unit_len == 1 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        t[..open].trim_end()
    } else {
        t
    }
}

/// Split `<upstream-model>-<effort>` into its parts. The base must be non-empty.
pub fn parse_effort_suffix(model: &str) -> Option<(&str, EffortLevel)> {
    let (base, token) = model.rsplit_once('-')?;
    if base.is_empty() {
        return None;
    }
    EffortLevel::parse(token).map(|e| (base, e))
}

/// Key used for Effort Map lookups.
pub fn normalize_model(model: &str) -> String {
    strip_context_marker(model).trim().to_ascii_lowercase()
}

/// `model -> effort`, built once per proxy instance. Duplicate models keep the lowest effort.
#[derive(Debug, Clone, Default)]
pub struct EffortMap {
    entries: HashMap<String, EffortLevel>,
}

impl EffortMap {
    pub fn new() -> Self {
        EffortMap::default()
    }

    pub fn from_assignments<I, S>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (S, EffortLevel)>,
        S: AsRef<str>,
    {
        let mut map = EffortMap::new();
        for (model, effort) in assignments {
            map.insert(model.as_ref(), effort);
        }
        map
    }

    pub fn insert(&mut self, model: &str, effort: EffortLevel) {
        let key = normalize_model(model);
        if key.is_empty() {
            return;
        }
        self.entries
            .entry(key)
            .and_modify(|e| *e = (*e).min(effort))
            .or_insert(effort);
    }

    pub fn get(&self, model: &str) -> Option<EffortLevel> {
        self.entries.get(&normalize_model(model)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
