//! Telemetry agent daemon: runs a demo session against a beacon backend.
//!
//! Usage:
//!   openkit-agent -c /etc/openkit/agent.conf
//!   openkit-agent -c /etc/openkit/agent.conf --stderr --duration 60

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use openkit_agent::config::{self, AgentConfig};
use openkit_agent::OpenKit;

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "openkit-agent", about = "In-process telemetry agent (OpenKit beacon protocol)")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/openkit/agent.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration: Option<u64>,

    /// Client IP reported for the demo session.
    #[arg(long, default_value = "127.0.0.1")]
    client_ip: String,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("openkit-agent: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("openkit-agent: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog, cfg.verbose) {
        eprintln!("openkit-agent: logging: {e:#}");
        process::exit(1);
    }

    if let Err(e) = run(cli, cfg) {
        log::error!("{e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli, cfg: AgentConfig) -> anyhow::Result<()> {
    info!(
        "openkit-agent {} starting (application {})",
        env!("CARGO_PKG_VERSION"),
        cfg.application_id
    );

    // The blocking HTTP client must live outside the async runtime.
    let openkit = OpenKit::new(cfg).context("creating agent")?;
    openkit.initialize().context("starting agent threads")?;

    if openkit.wait_for_init_completion(Some(INIT_TIMEOUT)) {
        info!("backend configuration received");
    } else {
        warn!("backend not reachable within {INIT_TIMEOUT:?}, data is cached meanwhile");
    }

    let session = openkit
        .create_session(&cli.client_ip)
        .context("agent already shut down")?;
    let startup = session.enter_action("agent startup");
    startup
        .report_value_string("version", env!("CARGO_PKG_VERSION"))
        .report_value_int("pid", i64::from(process::id()))
        .report_event("initialized");
    startup.leave_action();

    wait_for_exit(cli.duration)?;

    session.end();
    if openkit.shutdown() {
        info!("openkit-agent stopped");
    } else {
        warn!("openkit-agent stopped, background threads did not finish in time");
    }
    Ok(())
}

/// Block until Ctrl-C or the optional duration elapsed.
fn wait_for_exit(duration: Option<u64>) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;

    rt.block_on(async {
        match duration {
            Some(secs) => tokio::select! {
                res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl-C")?,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("run time of {secs}s elapsed"),
            },
            None => tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?,
        }
        Ok::<(), anyhow::Error>(())
    })
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };

    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "openkit-agent".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(level)
            .init();
    }
    Ok(())
}
