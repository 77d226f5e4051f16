use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

mod cli;
mod commands;

use crate::cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        ccs_proxy::set_color_mode(mode);
    }
    ccs_proxy::telemetry_init(cli.verbose);
    if cli.verbose {
        eprintln!("{}", ccs_proxy::build_info_line());
    }

    let cfg = match ccs_proxy::Config::load().with_context(|| {
        format!(
            "failed to load configuration from {}",
            ccs_proxy::config_dir().display()
        )
    }) {
        Ok(c) => c,
        Err(e) => {
            let use_err = ccs_proxy::color_enabled_stderr();
            ccs_proxy::log_error_stderr(use_err, &format!("ccs-proxy: {e:#}"));
            return ExitCode::from(1);
        }
    };

    match &cli.command {
        Command::Run {
            no_reasoning,
            disable_effort,
            client,
        } => commands::run_session(&cli, cfg, *no_reasoning, *disable_effort, client),
        Command::Status { json } => commands::run_status(&cli, &cfg, *json),
        Command::Stop => commands::run_stop(&cli, &cfg),
        Command::Cleanup => commands::run_cleanup(&cli, &cfg),
    }
}
