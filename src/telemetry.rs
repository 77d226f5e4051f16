//! Structured logging bootstrap (tracing + tracing-subscriber fmt layer on stderr).
//!
//! Filter precedence: CCS_LOG, then RUST_LOG, then the default level ("warn", or
//! "ccs_proxy=debug" when verbose). Safe to call more than once.

use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

fn filter_directives(verbose: bool) -> String {
    for key in ["CCS_LOG", "RUST_LOG"] {
        if let Ok(v) = env::var(key) {
            let v = v.trim();
            if !v.is_empty() {
                return v.to_string();
            }
        }
    }
    if verbose {
        "warn,ccs_proxy=debug".to_string()
    } else {
        "warn".to_string()
    }
}

/// Install the global subscriber. Returns false when one was already installed.
pub fn telemetry_init(verbose: bool) -> bool {
    if INIT.get().is_some() {
        return false;
    }
    let filter = EnvFilter::try_new(filter_directives(verbose))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();
    let _ = INIT.set(());
    if !installed {
        eprintln!("ccs-proxy: logging init skipped (global subscriber already set)");
    }
    installed
}

/// One-line build banner for verbose runs.
pub fn build_info_line() -> String {
    format!(
        "ccs-proxy: build={} target={} profile={} rust={} ver={}",
        env!("CCS_BUILD_DATE"),
        env!("CCS_BUILD_TARGET"),
        env!("CCS_BUILD_PROFILE"),
        env!("CCS_BUILD_RUSTC"),
        env!("CARGO_PKG_VERSION")
    )
}
