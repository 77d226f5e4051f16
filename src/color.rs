#![allow(clippy::module_name_repetitions)]
//! Color mode configuration and stderr one-liner helpers for user-facing progress.
//!
//! Policy:
//! - Progress/status lines for humans go through log_*_stderr; diagnostics go through tracing.
//! - Compute `use_err` once per scope: `let use_err = ccs_proxy::color_enabled_stderr();`
//! - NO_COLOR always wins, then the CLI flag, then CCS_COLOR, then TTY detection.

use clap::ValueEnum;
use once_cell::sync::OnceCell;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

static COLOR_MODE: OnceCell<ColorMode> = OnceCell::new();

pub fn set_color_mode(mode: ColorMode) {
    let _ = COLOR_MODE.set(mode);
}

fn parse_color_mode(s: &str) -> Option<ColorMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(ColorMode::Auto),
        "always" | "on" | "1" | "true" => Some(ColorMode::Always),
        "never" | "off" | "0" | "false" => Some(ColorMode::Never),
        _ => None,
    }
}

fn effective_mode() -> ColorMode {
    if let Some(mode) = COLOR_MODE.get().copied() {
        return mode;
    }
    std::env::var("CCS_COLOR")
        .ok()
        .and_then(|v| parse_color_mode(&v))
        .unwrap_or(ColorMode::Auto)
}

pub fn color_enabled_stderr() -> bool {
    // https://no-color.org/
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    match effective_mode() {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => atty::is(atty::Stream::Stderr),
    }
}

/// Wrap string with ANSI color code when enabled; otherwise return unchanged.
pub fn paint(enabled: bool, code: &str, s: &str) -> String {
    if enabled {
        format!("{code}{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

pub fn log_info_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[36;1m", msg));
}

pub fn log_ok_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[32m", msg));
}

pub fn log_warn_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[33m", msg));
}

pub fn log_error_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[31;1m", msg));
}
