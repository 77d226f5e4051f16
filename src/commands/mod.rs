use std::process::ExitCode;
use std::sync::Arc;

use ccs_proxy::{
    color_enabled_stderr, display_for_launch_error, exit_code_for_io_error,
    exit_code_for_launch_error, log_error_stderr, log_info_stderr, log_ok_stderr, log_warn_stderr,
    run_client, Config, Launcher, Passthrough, ProxyChain, ProxyDetector, ReasoningRewriter,
    SessionTracker, StageSpec, StaticCatalog,
};

use crate::cli::Cli;

fn exit_from_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn build_stages(cfg: &Config, no_reasoning: bool, tunnel: bool) -> Vec<StageSpec> {
    let mut specs = Vec::new();
    if cfg.reasoning.enabled && !no_reasoning {
        let rewriter = ReasoningRewriter::from_config(cfg, Arc::new(StaticCatalog::builtin()));
        specs.push(
            StageSpec::new(Arc::new(rewriter))
                .strip_path_prefix(cfg.reasoning.strip_path_prefix.clone())
                .timeout(cfg.timeouts.forward())
                .max_body_bytes(cfg.reasoning.max_body_bytes),
        );
    }
    if tunnel {
        specs.push(StageSpec::new(Arc::new(Passthrough)).timeout(cfg.timeouts.forward()));
    }
    specs
}

pub(crate) fn run_session(
    cli: &Cli,
    mut cfg: Config,
    no_reasoning: bool,
    disable_effort: bool,
    client: &[String],
) -> ExitCode {
    let use_err = color_enabled_stderr();
    let port = cli.port.unwrap_or(cfg.port);
    if disable_effort {
        cfg.reasoning.disable_effort = true;
    }
    let Some((program, args)) = client.split_first() else {
        log_error_stderr(use_err, "ccs-proxy: no client command given");
        return ExitCode::from(2);
    };

    let remote = if cfg.tunnel.enabled {
        match cfg.tunnel.upstream.clone().filter(|u| !u.trim().is_empty()) {
            Some(u) => Some(u),
            None => {
                log_error_stderr(use_err, "ccs-proxy: tunnel.enabled requires tunnel.upstream");
                return ExitCode::from(1);
            }
        }
    } else {
        None
    };

    // A remote upstream needs no local backend session.
    let guard = if remote.is_none() {
        let launcher = Launcher::from_config(cfg.clone()).with_verbose(cli.verbose);
        match launcher.acquire(port) {
            Ok(g) => Some(g),
            Err(e) => {
                log_error_stderr(use_err, &format!("ccs-proxy: {}", display_for_launch_error(&e)));
                return ExitCode::from(exit_code_for_launch_error(&e));
            }
        }
    } else {
        None
    };
    let backend_url = match (&guard, &remote) {
        (Some(g), _) => g.backend_url(),
        (None, Some(u)) => u.clone(),
        (None, None) => format!("http://127.0.0.1:{port}"),
    };

    let specs = build_stages(&cfg, no_reasoning, remote.is_some());
    let chain = if specs.is_empty() {
        ProxyChain::direct(&backend_url)
    } else {
        match ProxyChain::start(specs, &backend_url) {
            Ok(c) => c,
            Err(e) => {
                log_error_stderr(use_err, &format!("ccs-proxy: failed to start proxy chain: {e}"));
                return ExitCode::from(exit_code_for_io_error(&e));
            }
        }
    };
    let client_url = chain.client_url();
    if cli.verbose {
        log_info_stderr(
            use_err,
            &format!(
                "ccs-proxy: {}={client_url} (stages: {})",
                cfg.client.base_url_env,
                chain.len()
            ),
        );
    }
    // The guard owns the chain so one release stops everything; remote mode keeps it here.
    let mut local_chain = None;
    match &guard {
        Some(g) => g.attach_chain(chain),
        None => local_chain = Some(chain),
    }

    let env = vec![(cfg.client.base_url_env.clone(), client_url)];
    let code = match run_client(program, args, &env) {
        Ok(c) => c,
        Err(e) => {
            log_error_stderr(use_err, &format!("ccs-proxy: failed to start {program}: {e}"));
            i32::from(exit_code_for_io_error(&e))
        }
    };

    if let Some(g) = &guard {
        if let Some(out) = g.release() {
            if cli.verbose {
                let msg = match out.terminated {
                    Some(pid) => format!(
                        "ccs-proxy: last session on port {port}; CLIProxy (pid {pid}) stopped"
                    ),
                    None if out.should_kill => {
                        format!("ccs-proxy: last session on port {port} released")
                    }
                    None => format!(
                        "ccs-proxy: session released; CLIProxy on port {port} stays up for other sessions"
                    ),
                };
                log_info_stderr(use_err, &msg);
            }
        }
    }
    if let Some(mut c) = local_chain {
        c.stop();
    }
    exit_from_code(code)
}

pub(crate) fn run_status(cli: &Cli, cfg: &Config, json: bool) -> ExitCode {
    let port = cli.port.unwrap_or(cfg.port);
    let detector = ProxyDetector::from_config(cfg);
    let st = detector.detect(Some(port as i64), cli.verbose);
    if json {
        match serde_json::to_string_pretty(&st) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("ccs-proxy: {e}");
                return ExitCode::from(1);
            }
        }
        return ExitCode::from(0);
    }
    let use_err = color_enabled_stderr();
    let pid = st.pid.map(|p| format!(", pid {p}")).unwrap_or_default();
    let sessions = st
        .session_count
        .map(|n| format!(", {n} session(s)"))
        .unwrap_or_default();
    if st.blocked {
        let who = st
            .blocker
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_else(|| "unknown process".to_string());
        log_warn_stderr(use_err, &format!("port {port}: blocked by {who}"));
    } else if st.running && st.verified {
        log_ok_stderr(
            use_err,
            &format!("port {port}: running, healthy (via {}){pid}{sessions}", st.method.as_str()),
        );
    } else if st.running {
        log_warn_stderr(
            use_err,
            &format!(
                "port {port}: running, not answering health (via {}){pid}{sessions}",
                st.method.as_str()
            ),
        );
    } else {
        log_info_stderr(use_err, &format!("port {port}: not running"));
    }
    ExitCode::from(0)
}

pub(crate) fn run_stop(cli: &Cli, cfg: &Config) -> ExitCode {
    let use_err = color_enabled_stderr();
    let port = cli.port.unwrap_or(cfg.port);
    let res = SessionTracker::from_config(cfg).stop_proxy(port);
    if res.stopped {
        let pid = res.pid.map(|p| format!(" (pid {p})")).unwrap_or_default();
        log_ok_stderr(use_err, &format!("ccs-proxy: stopped CLIProxy on port {port}{pid}"));
        ExitCode::from(0)
    } else {
        let why = res.error.unwrap_or_else(|| "unknown error".to_string());
        log_warn_stderr(use_err, &format!("ccs-proxy: nothing stopped on port {port}: {why}"));
        ExitCode::from(1)
    }
}

pub(crate) fn run_cleanup(cli: &Cli, cfg: &Config) -> ExitCode {
    let use_err = color_enabled_stderr();
    let port = cli.port.unwrap_or(cfg.port);
    if SessionTracker::from_config(cfg).cleanup_orphaned_sessions(port) {
        log_ok_stderr(use_err, &format!("ccs-proxy: removed stale session lock for port {port}"));
    } else {
        log_info_stderr(use_err, &format!("ccs-proxy: no stale session lock for port {port}"));
    }
    ExitCode::from(0)
}
