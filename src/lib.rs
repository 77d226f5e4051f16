//! ccs-proxy: shared CLIProxy session coordination and the request-rewriting proxy chain.
//!
//! Many CLI invocations share one backend process per port. Coordination is file-and-PID based:
//! a per-port session lock records the backend PID and the active session ids, and the backend
//! is stopped only when its last session exits. Requests reach the backend through a chain of
//! loopback proxies that can rewrite JSON bodies (reasoning effort) or tunnel to HTTPS.

pub mod catalog;
pub mod color;
pub mod config;
pub mod detector;
pub mod errors;
pub mod health;
pub mod lifecycle;
pub mod process;
pub mod provision;
pub mod proxy;
pub mod session;
pub mod telemetry;

pub use catalog::{ModelCatalog, StaticCatalog};
pub use color::{
    color_enabled_stderr, log_error_stderr, log_info_stderr, log_ok_stderr, log_warn_stderr,
    paint, set_color_mode, ColorMode,
};
pub use config::{config_dir, Config, DEFAULT_PORT};
pub use detector::{parse_port_arg, sanitize_port, DetectMethod, ProxyDetector, ProxyStatus};
pub use errors::{
    display_for_launch_error, exit_code_for_io_error, exit_code_for_launch_error, LaunchError,
    RewriteError,
};
pub use health::{HealthProbe, HttpHealthProbe};
pub use lifecycle::{
    check_or_join_proxy, ensure_backend_config, run_client, spawn_proxy, wait_for_ready,
    JoinOutcome, Launcher, ReleaseOutcome, SessionGuard,
};
pub use process::{pid_alive, terminate_pid, PortOwner, PortOwnerProbe, SystemPortOwnerProbe};
pub use provision::{BinaryProvider, PathBinaryProvider};
pub use proxy::{
    EffortLevel, EffortMap, Passthrough, ProxyChain, ProxyOptions, ReasoningRewriter,
    RequestRewriter, Rewrite, RewritingProxy, StageSpec,
};
pub use session::{SessionLock, SessionTracker, StopResult, TrackedStatus};
pub use telemetry::{build_info_line, telemetry_init};
