use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

/// The shutdown-relevant signals a long-running process cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM: the normal "please stop" signal sent by process managers.
    Terminate,
    /// SIGINT: Ctrl-C from an interactive terminal.
    Interrupt,
    /// SIGQUIT: requests an immediate stop, skipping graceful drain.
    Quit,
}

/// Spawns a dedicated OS thread that blocks on SIGTERM/SIGINT/SIGQUIT and
/// invokes `on_signal` for each one it sees, forever. Mirrors the
/// signal-handling thread every neon compute binary starts up before
/// entering its async runtime, since `signal_hook`'s iterator API is
/// synchronous by design and doesn't mix with a tokio reactor directly.
pub fn spawn_shutdown_listener(
    on_signal: impl Fn(ShutdownSignal) + Send + 'static,
) -> anyhow::Result<()> {
    let mut signals =
        Signals::new([SIGTERM, SIGINT, SIGQUIT]).context("registering signal handlers")?;

    std::thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                let mapped = match signal {
                    SIGTERM => ShutdownSignal::Terminate,
                    SIGINT => ShutdownSignal::Interrupt,
                    SIGQUIT => ShutdownSignal::Quit,
                    _ => continue,
                };
                on_signal(mapped);
            }
        })
        .context("spawning signal-listener thread")?;

    Ok(())
}
