//! Process helpers: PID liveness (signal 0), graceful termination, and the port-owner probe.

use std::io;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use wait_timeout::ChildExt;

/// Process that currently listens on a TCP port.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortOwner {
    pub pid: u32,
    pub process_name: String,
}

impl std::fmt::Display for PortOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (pid {})", self.process_name, self.pid)
    }
}

/// OS-level query: which process, if any, listens on TCP port `port`.
pub trait PortOwnerProbe: Send + Sync {
    fn owner(&self, port: u16) -> Option<PortOwner>;
}

fn to_pid(pid: u32) -> Option<Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(Pid::from_raw(pid as i32))
}

/// True if a process with this PID exists (EPERM counts as alive).
pub fn pid_alive(pid: u32) -> bool {
    let Some(p) = to_pid(pid) else {
        return false;
    };
    match kill(p, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns true if the process is gone.
pub fn terminate_pid(pid: u32, grace: Duration) -> io::Result<bool> {
    let Some(p) = to_pid(pid) else {
        return Ok(true);
    };
    match kill(p, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(true),
        Err(e) => return Err(io::Error::from(e)),
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::warn!(pid, "process ignored SIGTERM; sending SIGKILL");
    match kill(p, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(io::Error::from(e)),
    }
    std::thread::sleep(Duration::from_millis(50));
    Ok(!pid_alive(pid))
}

/// Terminate a child we spawned ourselves: SIGTERM, reap within `grace`, else SIGKILL and reap.
/// Reaping matters here: an unreaped zombie still answers signal 0.
pub fn terminate_child(child: &mut Child, grace: Duration) -> io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    if let Some(p) = to_pid(child.id()) {
        match kill(p, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(io::Error::from(e)),
        }
    }
    if child.wait_timeout(grace)?.is_some() {
        return Ok(());
    }
    tracing::warn!(pid = child.id(), "child ignored SIGTERM; killing");
    let _ = child.kill();
    child.wait().map(|_| ())
}

/// Port-owner probe backed by `lsof`, with an `ss` fallback on Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOwnerProbe;

impl PortOwnerProbe for SystemPortOwnerProbe {
    fn owner(&self, port: u16) -> Option<PortOwner> {
        if let Some(o) = lsof_owner(port) {
            return Some(o);
        }
        if cfg!(target_os = "linux") {
            return ss_owner(port);
        }
        None
    }
}

fn command_stdout(program: &str, args: &[String]) -> Option<String> {
    let path = which::which(program).ok()?;
    let out = Command::new(path)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    // lsof exits 1 when nothing matches; treat empty output as "no owner".
    let s = String::from_utf8_lossy(&out.stdout).to_string();
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn lsof_owner(port: u16) -> Option<PortOwner> {
    let args = vec![
        "-nP".to_string(),
        format!("-iTCP:{port}"),
        "-sTCP:LISTEN".to_string(),
        "-Fpc".to_string(),
    ];
    parse_lsof_fields(&command_stdout("lsof", &args)?)
}

fn ss_owner(port: u16) -> Option<PortOwner> {
    let args = vec![
        "-ltnpH".to_string(),
        format!("sport = :{port}"),
    ];
    parse_ss_users(&command_stdout("ss", &args)?)
}

/// Parse `lsof -F pc` output: lines prefixed with `p<pid>` and `c<command>`.
pub(crate) fn parse_lsof_fields(out: &str) -> Option<PortOwner> {
    let mut pid: Option<u32> = None;
    let mut name: Option<String> = None;
    for line in out.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('p') {
            if pid.is_some() {
                break;
            }
            pid = rest.parse().ok();
        } else if let Some(rest) = line.strip_prefix('c') {
            if name.is_none() {
                name = Some(rest.to_string());
            }
        }
    }
    Some(PortOwner {
        pid: pid?,
        process_name: name.unwrap_or_default(),
    })
}

/// Parse the `users:(("name",pid=123,fd=3))` column of `ss -p` output.
pub(crate) fn parse_ss_users(out: &str) -> Option<PortOwner> {
    let idx = out.find("users:((\"")?;
    let rest = &out[idx + "users:((\"".len()..];
    let (name, rest) = rest.split_once('"')?;
    let pid_idx = rest.find("pid=")?;
    let digits: String = rest[pid_idx + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some(PortOwner {
        pid: digits.parse().ok()?,
        process_name: name.to_string(),
    })
}
