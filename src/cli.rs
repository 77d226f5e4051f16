use clap::{Parser, Subcommand};

/// Validate a port argument: 1..=65535
fn validate_port(s: &str) -> Result<u16, String> {
    match ccs_proxy::parse_port_arg(s) {
        Some(p) if (1..=65535).contains(&p) => Ok(p as u16),
        _ => Err("must be a TCP port between 1 and 65535".to_string()),
    }
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Join or start the shared CLIProxy, run a client against it, and clean up on exit
    Run {
        /// Disable the reasoning-effort rewriting stage
        #[arg(long = "no-reasoning")]
        no_reasoning: bool,

        /// Keep model-id cleanup but never inject reasoning.effort (same as CCS_DISABLE_EFFORT=1)
        #[arg(long = "disable-effort")]
        disable_effort: bool,

        /// Client program and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        client: Vec<String>,
    },
    /// Detect the shared CLIProxy on a port and print its status
    Status {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop the tracked CLIProxy on a port regardless of remaining sessions
    Stop,
    /// Remove a stale session lock (dead backend PID) for a port
    Cleanup,
}

#[derive(Parser, Debug)]
#[command(
    name = "ccs-proxy",
    version,
    about = "Share one CLIProxy backend across concurrent CLI sessions, with a request-rewriting proxy chain.",
    override_usage = "ccs-proxy [OPTIONS] <COMMAND> [-- <CLIENT> [CLIENT-OPTIONS]]",
    after_long_help = "Examples:\n  ccs-proxy run -- claude\n  ccs-proxy --port 8318 run --disable-effort -- claude --resume\n  ccs-proxy status --json\n  ccs-proxy stop --port 8318\n\n",
    after_help = "\n"
)]
pub(crate) struct Cli {
    /// Backend port (default: config `port`, CCS_PORT, or 8317)
    #[arg(long, global = true, value_parser = validate_port)]
    pub(crate) port: Option<u16>,

    /// Print detailed execution info
    #[arg(long, global = true)]
    pub(crate) verbose: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum, global = true)]
    pub(crate) color: Option<ccs_proxy::ColorMode>,

    #[command(subcommand)]
    pub(crate) command: Command,
}
