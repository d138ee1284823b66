//! linkd server binary
//!
//! Usage:
//!   linkd [--addr :40545] [--lpath svclinker] [--res-addr /var/run/svcsymres.sock]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linkd::config::{Args, ServerConfig};
use linkd::handoff::WorkerHandoff;
use linkd::network::Server;
use linkd::protocol::TypeRegistry;

fn run(args: Args) -> Result<()> {
    let config = ServerConfig::from_args(&args)?;

    let registry = TypeRegistry::standard().context("invalid message type table")?;

    let handoff = WorkerHandoff::new(config.worker.clone());
    let mut server = Server::bind(config.listen_addr, Arc::new(registry), Arc::new(handoff))
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?
        .with_strict_frame_size(config.strict_frame_size);

    info!(
        worker = %config.worker.path.display(),
        resolver = %config.worker.resolver_addr,
        strict_frame_size = config.strict_frame_size,
        "Worker configuration"
    );

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received, exiting");
        shutdown.shutdown();
    })
    .context("failed to install signal handler")?;

    server.run().context("accept loop failed")?;
    server.stats().log_summary();

    Ok(())
}

fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run(args) {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
