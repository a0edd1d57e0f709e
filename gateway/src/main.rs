use std::sync::mpsc as std_mpsc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use gateway::config::{Cli, RouterConfig};
use gateway::lifecycle;
use utils::signals::{spawn_shutdown_listener, ShutdownSignal};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::logging::init(cli.log_level.as_str()).context("initializing logging")?;

    info!(version = gateway::build_info::VERSION_STRING.as_str(), "starting pg-gateway");

    let config = RouterConfig::try_from(cli).context("resolving configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = runtime.block_on(run(config));
    if let Err(e) = &result {
        error!(error = %e, "pg-gateway exiting with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: RouterConfig) -> anyhow::Result<()> {
    let handle = lifecycle::start(config).await.context("starting gateway")?;

    let (signal_tx, signal_rx) = std_mpsc::channel::<ShutdownSignal>();
    spawn_shutdown_listener(move |signal| {
        // A full channel (listener already shutting down) is fine to ignore.
        let _ = signal_tx.send(signal);
    })
    .context("installing signal listener")?;

    let signal = tokio::task::spawn_blocking(move || signal_rx.recv())
        .await
        .context("signal listener task panicked")?;

    match signal {
        Ok(signal) => info!(?signal, "received shutdown signal"),
        Err(_) => info!("signal channel closed, shutting down"),
    }

    handle.stop().await.context("stopping gateway")?;
    Ok(())
}
