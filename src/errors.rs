//! Error mapping guide:
//! - Map io::ErrorKind::NotFound to exit code 127; all others to 1.
//! - LaunchError is fatal to one invocation; RewriteError is reported to the immediate HTTP caller.
//! - Stale locks and duplicate unregisters are not errors at all; they are logged and healed.
use std::fmt;
use std::io;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (binary not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Failures of the join-or-spawn flow.
#[derive(Debug)]
pub enum LaunchError {
    Io(io::Error),
    /// Backend binary could not be provisioned.
    Binary(String),
    /// A foreign process owns the port and does not answer our health check.
    PortBlocked { port: u16, blocker: String },
    /// The spawned backend never became healthy.
    Readiness { port: u16, waited_ms: u64 },
    Message(String),
}

impl From<io::Error> for LaunchError {
    fn from(e: io::Error) -> Self {
        LaunchError::Io(e)
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&display_for_launch_error(self))
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Convert LaunchError to exit code (parity with io::Error mapping).
pub fn exit_code_for_launch_error(e: &LaunchError) -> u8 {
    match e {
        LaunchError::Io(ioe) => exit_code_for_io_error(ioe),
        LaunchError::Binary(_) => 127,
        LaunchError::PortBlocked { .. }
        | LaunchError::Readiness { .. }
        | LaunchError::Message(_) => 1,
    }
}

/// Render a user-facing one-liner for LaunchError.
pub fn display_for_launch_error(e: &LaunchError) -> String {
    match e {
        LaunchError::Io(ioe) => ioe.to_string(),
        LaunchError::Binary(s) => format!("CLIProxy binary unavailable: {s}"),
        LaunchError::PortBlocked { port, blocker } => format!(
            "port {port} is in use by another process ({blocker}); stop it or choose a different port"
        ),
        LaunchError::Readiness { port, waited_ms } => format!(
            "CLIProxy did not become healthy on port {port} within {:.1}s; the backend binary may be broken",
            *waited_ms as f64 / 1000.0
        ),
        LaunchError::Message(s) => s.clone(),
    }
}

/// Rewriting failures surfaced to the immediate HTTP caller; never forwarded upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    InvalidJson(String),
    BodyTooLarge { limit: usize },
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::InvalidJson(msg) => write!(f, "invalid JSON body: {msg}"),
            RewriteError::BodyTooLarge { limit } => {
                write!(f, "request body exceeds limit of {limit} bytes")
            }
        }
    }
}

impl std::error::Error for RewriteError {}
