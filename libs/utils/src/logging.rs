use anyhow::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// `default_level` is used when `RUST_LOG` is unset; any value it does hold
/// always wins. Color is disabled automatically when stdout isn't a tty, so
/// log files don't end up full of escape codes.
pub fn init(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("building the tracing EnvFilter")?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stdout));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("installing the global tracing subscriber")?;

    Ok(())
}
