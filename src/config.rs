//! Configuration: `<config dir>/proxy.yaml` (optional) + `<config dir>/.env` + CCS_* env overrides.
//!
//! The config dir is `$CCS_HOME` or `~/.ccs`. Every field has a default so a missing file is fine.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::proxy::effort::EffortLevel;

/// Port the shared backend listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8317;
pub const DEFAULT_BACKEND_BINARY_NAME: &str = "cli-proxy-api";
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Return the tool's config directory ($CCS_HOME or ~/.ccs).
pub fn config_dir() -> PathBuf {
    if let Ok(v) = env::var("CCS_HOME") {
        let v = v.trim();
        if !v.is_empty() {
            return PathBuf::from(v);
        }
    }
    home::home_dir()
        .map(|h| h.join(".ccs"))
        .unwrap_or_else(|| env::temp_dir().join("ccs"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub backend: BackendConfig,
    pub timeouts: Timeouts,
    pub reasoning: ReasoningConfig,
    pub tunnel: TunnelConfig,
    pub client: ClientConfig,
    #[serde(skip)]
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub binary: Option<PathBuf>,
    pub binary_name: String,
    pub config: Option<PathBuf>,
    pub health_path: String,
    pub log: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub probe_ms: u64,
    pub ready_secs: u64,
    pub poll_ms: u64,
    pub forward_secs: u64,
    pub join_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub enabled: bool,
    pub provider: String,
    pub disable_effort: bool,
    pub default_effort: Option<EffortLevel>,
    pub strip_path_prefix: Option<String>,
    pub max_body_bytes: usize,
    pub tiers: TierConfig,
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub default: Tier,
    pub opus: Tier,
    pub sonnet: Tier,
    pub haiku: Tier,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Tier {
    pub model: Option<String>,
    pub effort: Option<EffortLevel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url_env: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            backend: BackendConfig::default(),
            timeouts: Timeouts::default(),
            reasoning: ReasoningConfig::default(),
            tunnel: TunnelConfig::default(),
            client: ClientConfig::default(),
            config_dir: config_dir(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            binary: None,
            binary_name: DEFAULT_BACKEND_BINARY_NAME.to_string(),
            config: None,
            health_path: "/".to_string(),
            log: None,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            probe_ms: 1000,
            ready_secs: 30,
            poll_ms: 250,
            forward_secs: 600,
            join_grace_secs: 5,
        }
    }
}

impl Timeouts {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms.max(1))
    }
    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_secs)
    }
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(10))
    }
    pub fn forward(&self) -> Duration {
        Duration::from_secs(self.forward_secs.max(1))
    }
    pub fn join_grace(&self) -> Duration {
        Duration::from_secs(self.join_grace_secs)
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        ReasoningConfig {
            enabled: true,
            provider: "codex".to_string(),
            disable_effort: false,
            default_effort: None,
            strip_path_prefix: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            tiers: TierConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url_env: "ANTHROPIC_BASE_URL".to_string(),
        }
    }
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    env_nonempty(key).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Accepts humantime strings ("90s", "10m") or bare seconds.
pub(crate) fn parse_duration_lenient(s: &str) -> Option<Duration> {
    let t = s.trim();
    if let Ok(secs) = t.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(t).ok()
}

impl Config {
    /// Load from the default config dir.
    pub fn load() -> io::Result<Config> {
        Config::load_from_dir(&config_dir())
    }

    /// Load from an explicit config dir (tests point this at a tempdir).
    pub fn load_from_dir(dir: &Path) -> io::Result<Config> {
        // .env never overrides variables already present in the environment.
        let _ = dotenvy::from_path(dir.join(".env"));

        let yaml_path = dir.join("proxy.yaml");
        let mut cfg = if yaml_path.is_file() {
            let text = fs::read_to_string(&yaml_path)?;
            Config::from_yaml_str(&text)
                .map_err(|e| invalid_data(format!("{}: {e}", yaml_path.display())))?
        } else {
            Config::default()
        };
        cfg.config_dir = dir.to_path_buf();
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn from_yaml_str(text: &str) -> Result<Config, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(text)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(p) = env_nonempty("CCS_PORT").and_then(|v| v.parse::<u16>().ok()) {
            if p > 0 {
                self.port = p;
            }
        }
        if let Some(b) = env_flag("CCS_DISABLE_EFFORT") {
            self.reasoning.disable_effort = b;
        }
        if let Some(b) = env_flag("CCS_REASONING_TRACE") {
            self.reasoning.trace.enabled = b;
        }
        if let Some(p) = env_nonempty("CCS_REASONING_TRACE_FILE") {
            self.reasoning.trace.path = Some(PathBuf::from(p));
        }
        if let Some(p) = env_nonempty("CCS_CLIPROXY_BINARY") {
            self.backend.binary = Some(PathBuf::from(p));
        }
        if let Some(d) =
            env_nonempty("CCS_FORWARD_TIMEOUT").and_then(|v| parse_duration_lenient(&v))
        {
            self.timeouts.forward_secs = d.as_secs().max(1);
        }
        if let Some(d) =
            env_nonempty("CCS_READY_TIMEOUT").and_then(|v| parse_duration_lenient(&v))
        {
            self.timeouts.ready_secs = d.as_secs();
        }
    }

    /// Directory holding per-port session lock files.
    pub fn sessions_dir(&self) -> PathBuf {
        self.config_dir.join("cliproxy")
    }

    pub fn backend_config_path(&self) -> PathBuf {
        self.backend
            .config
            .clone()
            .unwrap_or_else(|| self.sessions_dir().join("config.yaml"))
    }

    pub fn backend_log_path(&self) -> PathBuf {
        self.backend
            .log
            .clone()
            .unwrap_or_else(|| self.sessions_dir().join("backend.log"))
    }

    /// Tier model assignments paired with their effort, using the process environment
    /// for tiers without an explicit model.
    pub fn tier_assignments(&self) -> Vec<(String, EffortLevel)> {
        self.tier_assignments_with(|k| env_nonempty(k))
    }

    pub fn tier_assignments_with<F>(&self, lookup: F) -> Vec<(String, EffortLevel)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tiers = &self.reasoning.tiers;
        let table: [(&Tier, &str, EffortLevel); 4] = [
            (&tiers.default, "ANTHROPIC_MODEL", EffortLevel::High),
            (&tiers.opus, "ANTHROPIC_DEFAULT_OPUS_MODEL", EffortLevel::XHigh),
            (&tiers.sonnet, "ANTHROPIC_DEFAULT_SONNET_MODEL", EffortLevel::High),
            (&tiers.haiku, "ANTHROPIC_DEFAULT_HAIKU_MODEL", EffortLevel::Medium),
        ];
        let mut out = Vec::new();
        for (tier, env_key, fallback) in table {
            let model = tier
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .or_else(|| lookup(env_key));
            if let Some(m) = model {
                out.push((m.trim().to_string(), tier.effort.unwrap_or(fallback)));
            }
        }
        out
    }
}
