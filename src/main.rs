// netmuxd - per-device network multiplexing daemon.
// Multiplexes one kernel networking stack among logical networks and
// arbitrates which network each application may use.

// The control surface that drives the registry lives out of process, so
// many operations have no in-process caller.
#[allow(dead_code)]
mod daemon;
mod filter;
#[allow(dead_code)]
mod net;
#[allow(dead_code)]
mod utils;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use daemon::Controllers;
use utils::console::ConsoleLogger;

/// netmux - per-device network multiplexing daemon
#[derive(Parser, Debug)]
#[clap(author, version, about = "Network multiplexing daemon: fwmark policy and packet-filter chain topology")]
struct NetmuxCli {
    #[clap(subcommand)]
    command: Commands,

    /// Enable verbose (debug) logging
    #[clap(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = NetmuxCli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run => run_daemon().await,
    }
}

fn init_tracing(verbose: bool) {
    // RUST_LOG takes precedence; --verbose raises the floor to debug.
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_daemon() -> Result<(), Box<dyn std::error::Error>> {
    if unsafe { libc::geteuid() } != 0 {
        ConsoleLogger::error("netmuxd must run as root to manage routing and filter state");
        std::process::exit(1);
    }

    ConsoleLogger::info("starting netmuxd");
    let controllers = Arc::new(Controllers::new());
    daemon::install_global(controllers.clone());

    if let Err(e) = controllers.init() {
        ConsoleLogger::error(&format!("startup failed: {}", e));
        std::process::exit(e.exit_code());
    }
    ConsoleLogger::success("netmuxd up: chain topology, hooks and controllers installed");

    wait_for_shutdown().await?;
    ConsoleLogger::info("netmuxd shutting down");
    Ok(())
}

async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("received SIGINT");
        }
    }
    Ok(())
}
