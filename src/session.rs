//! Session tracker: one JSON lock file per port recording the backend PID and active sessions.
//!
//! All reads and writes of lock files go through this module. Every mutation is
//! read-full-file, modify, write-full-file (atomic rename). Invariant: the file exists
//! iff `sessions` is non-empty; an empty list is never written, the file is removed instead.
//!
//! Liveness is PID-only. A reused PID delays cleanup until that process also exits;
//! the next launch heals it. Two processes racing a read-modify-write can lose one
//! session id; the loser re-registers on its next call or its entry is healed by eviction.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::{Config, DEFAULT_PORT};
use crate::process::{pid_alive, terminate_pid};

const LOCK_FILE_DEFAULT: &str = "sessions.json";
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Persisted per-port lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    pub port: u16,
    pub pid: u32,
    pub sessions: Vec<String>,
    #[serde(rename = "startedAt")]
    pub started_at: String,
}

/// Tracker view of a port: `running` iff a lock with a live PID exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedStatus {
    pub running: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub session_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopResult {
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Repository over the per-port lock files in one directory.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    dir: PathBuf,
    default_port: u16,
}

/// Fresh opaque session id: `<pid>-<16 hex>`.
pub fn new_session_id() -> String {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        buf = (nanos as u64).to_le_bytes();
    }
    let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}-{hex}", std::process::id())
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

impl SessionTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SessionTracker {
            dir: dir.into(),
            default_port: DEFAULT_PORT,
        }
    }

    /// Tracker whose "default port" (fixed filename, unregister fallback) is `port`.
    pub fn with_default_port(dir: impl Into<PathBuf>, port: u16) -> Self {
        SessionTracker {
            dir: dir.into(),
            default_port: port,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        SessionTracker::new(cfg.sessions_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// Default port uses a fixed filename; other ports get a port-suffixed one.
    pub fn lock_path(&self, port: u16) -> PathBuf {
        if port == self.default_port {
            self.dir.join(LOCK_FILE_DEFAULT)
        } else {
            self.dir.join(format!("sessions-{port}.json"))
        }
    }

    /// Read the lock for `port` without liveness checks. Corrupt or mismatched files are removed.
    /// An empty `sessions` list violates the invariant and is treated as corrupt.
    fn read_lock(&self, port: u16) -> Option<SessionLock> {
        let path = self.lock_path(port);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to read session lock: {e}");
                return None;
            }
        };
        match serde_json::from_slice::<SessionLock>(&bytes) {
            Ok(lock) if lock.port == port && !lock.sessions.is_empty() => Some(lock),
            Ok(lock) if lock.port == port => {
                tracing::warn!(port, "session lock without sessions removed");
                self.remove_lock(port);
                None
            }
            Ok(lock) => {
                tracing::warn!(
                    port,
                    stored_port = lock.port,
                    "session lock port mismatch; treating as absent"
                );
                self.remove_lock(port);
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "corrupt session lock removed: {e}");
                self.remove_lock(port);
                None
            }
        }
    }

    /// Persist `lock`, or remove the file when no sessions remain.
    fn write_lock(&self, lock: &SessionLock) -> io::Result<()> {
        if lock.sessions.is_empty() {
            self.remove_lock(lock.port);
            return Ok(());
        }
        create_private_dir(&self.dir)?;
        let data = serde_json::to_vec_pretty(lock).map_err(io::Error::other)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(self.lock_path(lock.port))
            .map_err(|e| e.error)?;
        Ok(())
    }

    fn remove_lock(&self, port: u16) {
        let path = self.lock_path(port);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(port, "session lock removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), "failed to remove session lock: {e}"),
        }
    }

    /// Add a session for `port`. Creates the lock with `pid` if none exists; otherwise appends.
    pub fn register_session(&self, port: u16, pid: u32) -> io::Result<String> {
        let id = new_session_id();
        let lock = match self.get_existing_proxy(port) {
            Some(mut lock) => {
                lock.sessions.push(id.clone());
                lock
            }
            None => SessionLock {
                port,
                pid,
                sessions: vec![id.clone()],
                started_at: now_rfc3339(),
            },
        };
        self.write_lock(&lock)?;
        tracing::info!(
            port,
            pid = lock.pid,
            session = %id,
            sessions = lock.sessions.len(),
            "session registered"
        );
        Ok(id)
    }

    /// Remove `session_id`. Returns true when the caller must stop the backend: either the last
    /// session was removed, or there was nothing left to track. Unknown ids are no-ops.
    pub fn unregister_session(&self, session_id: &str, port: Option<u16>) -> bool {
        let port = port.unwrap_or(self.default_port);
        let Some(mut lock) = self.read_lock(port) else {
            tracing::debug!(port, session = %session_id, "no session lock; nothing to unregister");
            return true;
        };
        let before = lock.sessions.len();
        lock.sessions.retain(|s| s != session_id);
        if lock.sessions.len() == before {
            tracing::debug!(port, session = %session_id, "session id not tracked");
        }
        if lock.sessions.is_empty() {
            self.remove_lock(port);
            tracing::info!(port, session = %session_id, "last session unregistered");
            return true;
        }
        if lock.sessions.len() == before {
            return false;
        }
        if let Err(e) = self.write_lock(&lock) {
            tracing::warn!(port, "failed to persist session lock: {e}");
        }
        tracing::info!(
            port,
            session = %session_id,
            remaining = lock.sessions.len(),
            "session unregistered"
        );
        false
    }

    /// Current lock for `port` if its PID is alive. Stale locks are deleted.
    pub fn get_existing_proxy(&self, port: u16) -> Option<SessionLock> {
        let lock = self.read_lock(port)?;
        if !pid_alive(lock.pid) {
            tracing::info!(
                port,
                pid = lock.pid,
                sessions = lock.sessions.len(),
                "stale session lock (pid dead); removing"
            );
            self.remove_lock(port);
            return None;
        }
        Some(lock)
    }

    pub fn get_proxy_status(&self, port: u16) -> TrackedStatus {
        match self.get_existing_proxy(port) {
            Some(lock) => TrackedStatus {
                running: true,
                port,
                pid: Some(lock.pid),
                session_count: lock.sessions.len(),
                started_at: Some(lock.started_at),
            },
            None => TrackedStatus {
                running: false,
                port,
                pid: None,
                session_count: 0,
                started_at: None,
            },
        }
    }

    /// Terminate the tracked backend for `port` regardless of remaining sessions.
    pub fn stop_proxy(&self, port: u16) -> StopResult {
        let Some(lock) = self.read_lock(port) else {
            return StopResult {
                stopped: false,
                pid: None,
                error: Some("no active session".to_string()),
            };
        };
        if !pid_alive(lock.pid) {
            self.remove_lock(port);
            return StopResult {
                stopped: false,
                pid: Some(lock.pid),
                error: Some("not running".to_string()),
            };
        }
        match terminate_pid(lock.pid, STOP_GRACE) {
            Ok(_) => {
                self.remove_lock(port);
                tracing::info!(port, pid = lock.pid, "backend stopped");
                StopResult {
                    stopped: true,
                    pid: Some(lock.pid),
                    error: None,
                }
            }
            Err(e) => StopResult {
                stopped: false,
                pid: Some(lock.pid),
                error: Some(e.to_string()),
            },
        }
    }

    /// Startup sweep: evict a stale lock for `port`. Returns true if one was removed.
    pub fn cleanup_orphaned_sessions(&self, port: u16) -> bool {
        let existed = self.lock_path(port).exists();
        existed && self.get_existing_proxy(port).is_none()
    }
}
