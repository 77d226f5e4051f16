//! Lifecycle orchestration: join a healthy shared backend or spawn one, and guarantee exactly one
//! unregister per session when the client exits.
//!
//! The backend is terminated only by the participant whose unregister removed the last session.
//! Proxy stages live inside this process and are always stopped on release.

use std::fs::{self, OpenOptions};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::color;
use crate::config::Config;
use crate::detector::{ProxyDetector, ProxyStatus};
use crate::errors::LaunchError;
use crate::process::{terminate_child, terminate_pid};
use crate::provision::{BinaryProvider, PathBinaryProvider};
use crate::proxy::ProxyChain;
use crate::session::SessionTracker;

const BACKEND_STOP_GRACE: Duration = Duration::from_secs(3);

/// Result of `check_or_join_proxy`.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Set when this call registered a session against a verified backend.
    pub session_id: Option<String>,
    pub should_spawn: bool,
    pub status: ProxyStatus,
}

/// Detect; join (register) when verified healthy, otherwise tell the caller to spawn.
pub fn check_or_join_proxy(detector: &ProxyDetector, port: u16, verbose: bool) -> JoinOutcome {
    let status = detector.detect(Some(port as i64), verbose);
    if !status.is_verified_healthy() {
        return JoinOutcome {
            session_id: None,
            should_spawn: true,
            status,
        };
    }
    let tracker = detector.tracker();
    let session_id = match (tracker.get_existing_proxy(port), status.pid) {
        (Some(lock), _) => match tracker.register_session(port, lock.pid) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(port, "failed to register session: {e}");
                None
            }
        },
        (None, Some(pid)) => detector.reclaim_orphan(port, pid),
        (None, None) => {
            // Healthy but no PID to track: use it without claiming ownership.
            tracing::info!(port, "joining healthy backend with unknown pid; not tracked");
            None
        }
    };
    JoinOutcome {
        session_id,
        should_spawn: false,
        status,
    }
}

/// Backend config for `port`: the configured file for the configured port, else
/// `config-<port>.yaml` next to it. Missing files are created with just the port.
pub fn ensure_backend_config(cfg: &Config, port: u16) -> io::Result<PathBuf> {
    let base = cfg.backend_config_path();
    let path = if port == cfg.port {
        base.clone()
    } else {
        cfg.sessions_dir().join(format!("config-{port}.yaml"))
    };
    if path.is_file() {
        return Ok(path);
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    // Derive from the base config when there is one, so auth and provider settings carry over.
    let mut doc = match fs::read_to_string(&base) {
        Ok(text) => serde_yaml::from_str::<serde_yaml::Value>(&text).unwrap_or_else(|e| {
            tracing::warn!(
                path = %base.display(),
                "unreadable backend config; starting fresh: {e}"
            );
            serde_yaml::Value::Mapping(Default::default())
        }),
        Err(_) => serde_yaml::Value::Mapping(Default::default()),
    };
    if let serde_yaml::Value::Mapping(m) = &mut doc {
        m.insert(
            serde_yaml::Value::String("port".to_string()),
            serde_yaml::Value::Number(serde_yaml::Number::from(port as u64)),
        );
    }
    let text = serde_yaml::to_string(&doc).map_err(io::Error::other)?;
    fs::write(&path, text)?;
    tracing::info!(path = %path.display(), port, "backend config written");
    Ok(path)
}

/// Launch the backend detached: own process group, stdin null, output appended to `log_path`.
/// Does not wait for readiness.
pub fn spawn_proxy(
    binary: &Path,
    config_path: &Path,
    log_path: &Path,
    verbose: bool,
) -> io::Result<Child> {
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(log_path)?;
    let log_err = log.try_clone()?;
    let mut cmd = Command::new(binary);
    cmd.arg("--config")
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn()?;
    tracing::info!(
        pid = child.id(),
        binary = %binary.display(),
        config = %config_path.display(),
        "backend spawned"
    );
    if verbose {
        eprintln!(
            "ccs-proxy: spawned {} (pid {}), log: {}",
            binary.display(),
            child.id(),
            log_path.display()
        );
    }
    Ok(child)
}

/// Poll health until ready. Not becoming healthy is fatal for this invocation.
/// With `child`, polling stops as soon as that process exits.
pub fn wait_for_ready(
    detector: &ProxyDetector,
    port: u16,
    timeout: Duration,
    poll: Duration,
    verbose: bool,
    mut child: Option<&mut Child>,
) -> Result<(), LaunchError> {
    let use_err = color::color_enabled_stderr();
    let progress = verbose || atty::is(atty::Stream::Stderr);
    let mut next_report = Duration::from_secs(1);
    let ok = detector.wait_until_healthy_with(port, timeout, poll, |elapsed| {
        if let Some(c) = child.as_deref_mut() {
            if let Ok(Some(status)) = c.try_wait() {
                let pid = c.id();
                tracing::warn!(port, pid, %status, "backend exited before becoming healthy");
                return ControlFlow::Break(());
            }
        }
        tracing::debug!(port, elapsed_ms = elapsed.as_millis() as u64, "backend not ready yet");
        if progress && elapsed >= next_report {
            next_report = elapsed + Duration::from_secs(1);
            eprint!(
                "\r{}",
                color::paint(
                    use_err,
                    "\x1b[90m",
                    &format!(
                        "ccs-proxy: waiting for CLIProxy on port {port}... {:.0}s",
                        elapsed.as_secs_f64()
                    )
                )
            );
        }
        ControlFlow::Continue(())
    });
    if progress && next_report > Duration::from_secs(1) {
        eprintln!();
    }
    if ok {
        tracing::info!(port, "backend ready");
        Ok(())
    } else {
        Err(LaunchError::Readiness {
            port,
            waited_ms: timeout.as_millis() as u64,
        })
    }
}

/// Owner of one session's cleanup. Released exactly once, explicitly or on drop.
pub struct SessionGuard {
    tracker: SessionTracker,
    port: u16,
    session_id: Option<String>,
    child: Mutex<Option<Child>>,
    chain: Mutex<Option<ProxyChain>>,
    spawned: bool,
    released: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub should_kill: bool,
    /// Backend PID terminated by this release, if any.
    pub terminated: Option<u32>,
}

impl SessionGuard {
    fn new(
        tracker: SessionTracker,
        port: u16,
        session_id: Option<String>,
        child: Option<Child>,
    ) -> Self {
        let spawned = child.is_some();
        SessionGuard {
            tracker,
            port,
            session_id,
            child: Mutex::new(child),
            chain: Mutex::new(None),
            spawned,
            released: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when this session spawned the backend.
    pub fn spawned(&self) -> bool {
        self.spawned
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|c| c.id())
    }

    pub fn backend_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Hand a started chain to the guard so release stops it.
    pub fn attach_chain(&self, chain: ProxyChain) {
        *self.chain.lock().unwrap_or_else(|p| p.into_inner()) = Some(chain);
    }

    /// URL the client must use: the outermost stage, or the backend when no chain is attached.
    pub fn client_url(&self) -> String {
        self.chain
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|c| c.client_url())
            .unwrap_or_else(|| self.backend_url())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stop owned stages, unregister once, and terminate the backend only when this was the
    /// last session. Later calls return None.
    pub fn release(&self) -> Option<ReleaseOutcome> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        if let Some(mut chain) = self.chain.lock().unwrap_or_else(|p| p.into_inner()).take() {
            chain.stop();
        }
        let Some(id) = self.session_id.as_deref() else {
            tracing::debug!(port = self.port, "untracked session released");
            return Some(ReleaseOutcome {
                should_kill: false,
                terminated: None,
            });
        };
        // The lock disappears with the last session, so read the PID first.
        let lock_pid = self.tracker.get_proxy_status(self.port).pid;
        let should_kill = self.tracker.unregister_session(id, Some(self.port));
        if !should_kill {
            return Some(ReleaseOutcome {
                should_kill,
                terminated: None,
            });
        }
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner()).take();
        let child_pid = child.as_ref().map(|c| c.id());
        let mut terminated = None;
        if let Some(c) = child.as_mut() {
            let pid = c.id();
            match terminate_child(c, BACKEND_STOP_GRACE) {
                Ok(()) => terminated = Some(pid),
                Err(e) => tracing::warn!(pid, "failed to stop backend: {e}"),
            }
        }
        // The lock names whatever serves the port, which need not be our child.
        if let Some(pid) = lock_pid.filter(|p| Some(*p) != child_pid) {
            match terminate_pid(pid, BACKEND_STOP_GRACE) {
                Ok(_) => terminated = Some(pid),
                Err(e) => tracing::warn!(pid, "failed to stop backend: {e}"),
            }
        }
        tracing::info!(
            port = self.port,
            pid = ?terminated,
            "last session released; backend stopped"
        );
        Some(ReleaseOutcome {
            should_kill,
            terminated,
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Config, detector (with its tracker) and binary provider for the join-or-spawn flow.
pub struct Launcher {
    cfg: Config,
    detector: ProxyDetector,
    binary: Box<dyn BinaryProvider>,
    verbose: bool,
}

impl Launcher {
    pub fn new(cfg: Config, detector: ProxyDetector, binary: Box<dyn BinaryProvider>) -> Self {
        Launcher {
            cfg,
            detector,
            binary,
            verbose: false,
        }
    }

    pub fn from_config(cfg: Config) -> Self {
        let detector = ProxyDetector::from_config(&cfg);
        let binary = Box::new(PathBinaryProvider::from_config(&cfg));
        Launcher::new(cfg, detector, binary)
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn detector(&self) -> &ProxyDetector {
        &self.detector
    }

    pub fn tracker(&self) -> &SessionTracker {
        self.detector.tracker()
    }

    fn joined(&self, port: u16, out: JoinOutcome) -> SessionGuard {
        let use_err = color::color_enabled_stderr();
        let msg = match out.status.pid {
            Some(pid) => format!("ccs-proxy: joined shared CLIProxy on port {port} (pid {pid})"),
            None => format!("ccs-proxy: joined shared CLIProxy on port {port}"),
        };
        if self.verbose {
            color::log_ok_stderr(use_err, &msg);
        }
        tracing::info!(port, session = ?out.session_id, "joined shared backend");
        SessionGuard::new(self.tracker().clone(), port, out.session_id, None)
    }

    /// Our spawned backend is gone. The port may still be served by a backend another
    /// participant started concurrently; join that one rather than registering a dead PID.
    fn join_after_exit(
        &self,
        port: u16,
        pid: u32,
        status: ExitStatus,
        started: Instant,
    ) -> Result<SessionGuard, LaunchError> {
        tracing::warn!(port, pid, %status, "spawned backend exited; checking the port again");
        if self.verbose {
            color::log_warn_stderr(
                color::color_enabled_stderr(),
                &format!("ccs-proxy: CLIProxy (pid {pid}) exited early ({status})"),
            );
        }
        let timeouts = &self.cfg.timeouts;
        self.detector
            .wait_until_healthy(port, timeouts.join_grace(), timeouts.poll());
        let out = check_or_join_proxy(&self.detector, port, self.verbose);
        if !out.should_spawn {
            return Ok(self.joined(port, out));
        }
        Err(LaunchError::Readiness {
            port,
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Join a verified backend on `port` or become its owner by spawning one.
    pub fn acquire(&self, port: u16) -> Result<SessionGuard, LaunchError> {
        let tracker = self.tracker();
        if tracker.cleanup_orphaned_sessions(port) {
            tracing::info!(port, "evicted stale session lock");
        }

        let out = check_or_join_proxy(&self.detector, port, self.verbose);
        if !out.should_spawn {
            return Ok(self.joined(port, out));
        }
        if out.status.blocked {
            let blocker = out
                .status
                .blocker
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_else(|| "unknown process".to_string());
            return Err(LaunchError::PortBlocked { port, blocker });
        }
        if out.status.running {
            // Another session may still be bringing the backend up.
            let grace = self.cfg.timeouts.join_grace();
            tracing::info!(
                port,
                method = out.status.method.as_str(),
                "backend present but unverified; waiting"
            );
            if self
                .detector
                .wait_until_healthy(port, grace, self.cfg.timeouts.poll())
            {
                let again = check_or_join_proxy(&self.detector, port, self.verbose);
                if !again.should_spawn {
                    return Ok(self.joined(port, again));
                }
            }
            let who = out
                .status
                .pid
                .map(|p| format!(" (pid {p})"))
                .unwrap_or_default();
            return Err(LaunchError::Message(format!(
                "CLIProxy on port {port}{who} is not answering health checks; \
                 run `ccs-proxy stop --port {port}` and retry"
            )));
        }

        let binary = self
            .binary
            .ensure_binary()
            .map_err(|e| LaunchError::Binary(e.to_string()))?;
        let config_path = ensure_backend_config(&self.cfg, port)?;
        let use_err = color::color_enabled_stderr();
        if self.verbose {
            color::log_info_stderr(
                use_err,
                &format!("ccs-proxy: starting CLIProxy on port {port}..."),
            );
        }
        let mut child = spawn_proxy(
            &binary,
            &config_path,
            &self.cfg.backend_log_path(),
            self.verbose,
        )?;
        let started = Instant::now();
        let ready = wait_for_ready(
            &self.detector,
            port,
            self.cfg.timeouts.ready(),
            self.cfg.timeouts.poll(),
            self.verbose,
            Some(&mut child),
        );
        match child.try_wait() {
            Ok(Some(status)) => return self.join_after_exit(port, child.id(), status, started),
            Ok(None) => {}
            Err(e) => tracing::warn!(pid = child.id(), "cannot poll spawned backend: {e}"),
        }
        if let Err(e) = ready {
            if let Err(te) = terminate_child(&mut child, Duration::from_secs(2)) {
                tracing::warn!(pid = child.id(), "failed to stop unready backend: {te}");
            }
            return Err(e);
        }
        let id = tracker.register_session(port, child.id())?;
        if self.verbose {
            color::log_ok_stderr(
                use_err,
                &format!("ccs-proxy: CLIProxy ready on port {port} (pid {})", child.id()),
            );
        }
        Ok(SessionGuard::new(tracker.clone(), port, Some(id), Some(child)))
    }
}

#[cfg(unix)]
mod client_signals {
    use std::sync::atomic::{AtomicI32, Ordering};

    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    static PENDING: AtomicI32 = AtomicI32::new(0);

    extern "C" fn record(sig: i32) {
        PENDING.store(sig, Ordering::SeqCst);
    }

    const TRAPPED: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

    pub(super) fn install() {
        let act = SigAction::new(
            SigHandler::Handler(record),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for s in TRAPPED {
            unsafe {
                let _ = signal::sigaction(s, &act);
            }
        }
    }

    pub(super) fn restore() {
        let act = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for s in TRAPPED {
            unsafe {
                let _ = signal::sigaction(s, &act);
            }
        }
    }

    /// Last trapped signal since the previous call, if any.
    pub(super) fn take() -> Option<Signal> {
        match PENDING.swap(0, Ordering::SeqCst) {
            0 => None,
            n => Signal::try_from(n).ok(),
        }
    }
}

/// Run the client to completion and return its exit code (128+signal when killed).
pub fn run_client(program: &str, args: &[String], env: &[(String, String)]) -> io::Result<i32> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn()?;
    tracing::debug!(pid = child.id(), program, "client started");

    #[cfg(unix)]
    client_signals::install();

    let status = loop {
        use wait_timeout::ChildExt;
        match child.wait_timeout(Duration::from_millis(100)) {
            Ok(Some(st)) => break Ok(st),
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(e),
        }
        #[cfg(unix)]
        if let Some(sig) = client_signals::take() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            // SIGINT already reached the client through the terminal's process group.
            if sig != Signal::SIGINT {
                tracing::debug!(signal = ?sig, "forwarding signal to client");
                let _ = kill(Pid::from_raw(child.id() as i32), sig);
            }
        }
    };

    #[cfg(unix)]
    client_signals::restore();

    let status = status?;
    if let Some(code) = status.code() {
        return Ok(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Ok(128 + sig);
        }
    }
    Ok(1)
}
