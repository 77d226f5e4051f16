//! Opt-in JSON-lines tracing of rewrite decisions. Failures are logged and swallowed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use crate::config::TraceConfig;

const DEFAULT_TRACE_FILE: &str = "ccs-reasoning-trace.jsonl";

#[derive(Debug, Default)]
pub struct TraceSink {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve(path: &Path) -> Option<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let abs = normalize(&abs);
    // Resolve symlinks in the parent so a link cannot escape the allow-list.
    let parent = abs.parent()?;
    let name = abs.file_name()?;
    let parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
    Some(parent.join(name))
}

/// Allowed trace roots: system temp dir, `/var/log`, and the tool's config dir.
pub fn trace_path_allowed(path: &Path, config_dir: &Path) -> bool {
    let Some(resolved) = resolve(path) else {
        return false;
    };
    let roots = [
        std::env::temp_dir(),
        PathBuf::from("/var/log"),
        config_dir.to_path_buf(),
    ];
    roots.iter().any(|root| {
        let root = normalize(root);
        let canon = root.canonicalize().unwrap_or_else(|_| root.clone());
        resolved.starts_with(&canon) || resolved.starts_with(&root)
    })
}

impl TraceSink {
    pub fn disabled() -> Self {
        TraceSink::default()
    }

    /// Enabled only when opted in and the path passes the allow-list check.
    pub fn from_config(cfg: &TraceConfig, config_dir: &Path) -> Self {
        if !cfg.enabled {
            return TraceSink::disabled();
        }
        let path = cfg
            .path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_TRACE_FILE));
        if !trace_path_allowed(&path, config_dir) {
            tracing::warn!(
                path = %path.display(),
                "reasoning trace path outside temp, /var/log and config dir; tracing disabled"
            );
            return TraceSink::disabled();
        }
        TraceSink {
            path: Some(path),
            lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, entry: &serde_json::Value) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let Ok(mut line) = serde_json::to_vec(entry) else {
            return;
        };
        line.push(b'\n');
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(&line));
        if let Err(e) = res {
            tracing::debug!(path = %path.display(), "reasoning trace write failed: {e}");
        }
    }
}
