//! Tether CLI: open files in a headless window and print what the language
//! servers report.
//!
//! ```text
//! tether [--config PATH] [--root DIR] [--settle-ms N] [--timeout-ms N] FILE...
//! ```
//!
//! The window starts every configured server matching the files, waits until
//! the servers are ready and have been quiet for the settle period, prints
//! the diagnostics and shuts everything down. The exit status is 1 when any
//! error-level diagnostic was reported.

use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, io};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tether_config::TetherConfig;
use tether_lsp::{Collaborators, ProcessLauncher, ServerState, WindowManager};
use tokio::fs::read_to_string;
use tokio::signal;
use tokio::time::{Instant, sleep_until};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_SETTLE_MS: &str = "1500";
const DEFAULT_TIMEOUT_MS: &str = "60000";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries the diagnostics; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Run language servers over files and print their diagnostics", long_about = None)]
struct Args {
    /// Files to check
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Config file to use instead of ~/.tether/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Workspace root (default: current directory)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Quiet period after which servers are considered settled
    #[arg(long = "settle-ms", value_name = "MS", default_value = DEFAULT_SETTLE_MS, value_parser = parse_millis)]
    settle: Duration,

    /// Give up waiting for servers after this long
    #[arg(long = "timeout-ms", value_name = "MS", default_value = DEFAULT_TIMEOUT_MS, value_parser = parse_millis)]
    timeout: Duration,
}

fn parse_millis(value: &str) -> Result<Duration, ParseIntError> {
    value.parse().map(Duration::from_millis)
}

fn load_config(path: Option<&Path>) -> Result<TetherConfig> {
    let loaded = match path {
        Some(path) => TetherConfig::load_from(path)?
            .with_context(|| format!("config file {} does not exist", path.display()))?,
        None => TetherConfig::load()?.unwrap_or_default(),
    };
    Ok(loaded)
}

/// Servers still working on their handshake.
fn any_starting(manager: &WindowManager) -> bool {
    manager
        .status()
        .iter()
        .any(|s| matches!(s.state, ServerState::Starting))
}

/// Handle events until every server has settled or the deadline passes.
async fn wait_for_diagnostics(manager: &mut WindowManager, settle: Duration, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut quiet_since = Instant::now();
    loop {
        if Instant::now() >= deadline {
            tracing::warn!("Timed out waiting for servers");
            return;
        }
        let quiet_until = (quiet_since + settle).min(deadline);
        tokio::select! {
            () = manager.wait_for_activity() => quiet_since = Instant::now(),
            () = sleep_until(quiet_until) => {
                if !any_starting(manager) {
                    return;
                }
                quiet_since = Instant::now();
            }
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let lsp = config.lsp_or_default();
    if !lsp.enabled || lsp.servers.is_empty() {
        bail!("no language servers configured; enable [lsp] in the config file");
    }

    let root = match args.root {
        Some(root) => root,
        None => env::current_dir().context("reading current directory")?,
    };
    let root = fs::canonicalize(&root).with_context(|| format!("resolving {}", root.display()))?;

    let mut manager = WindowManager::new(lsp, Arc::new(ProcessLauncher::new()), Collaborators::default());
    manager.set_folders(vec![root]);

    for file in &args.files {
        let path = fs::canonicalize(file).with_context(|| format!("resolving {}", file.display()))?;
        let text = read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        manager.open_view(path, None, text)?;
    }

    tokio::select! {
        () = wait_for_diagnostics(&mut manager, args.settle, args.timeout) => {}
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for Ctrl-C: {e}");
            }
            tracing::info!("Interrupted");
        }
    }

    for status in manager.status() {
        if let ServerState::Failed(reason) = &status.state {
            eprintln!("{}: failed: {reason}", status.name);
        }
    }

    let snapshot = manager.snapshot();
    for (path, diagnostics) in snapshot.files() {
        for diagnostic in diagnostics {
            println!("{}", diagnostic.display_with_path(path));
        }
    }
    eprintln!("{}", snapshot.status_string());

    manager.shutdown().await;

    Ok(if snapshot.error_count() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with status 2 from inside clap.
    let args = Args::parse();
    init_tracing();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}
