use std::sync::LazyLock;

use tern_common::{Signal, internal, logging, tracing};
use tern_tracing::traced;
use tokio::sync::broadcast;

use crate::{config::Config, mta::Mta};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    // The queues finish their in-flight entries in the meantime; a second
    // CTRL+C abandons them.
    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Run the MTA described by `config` until it is told to stop.
///
/// # Errors
///
/// Returns an error if the MTA cannot be assembled or its queues cannot be
/// loaded from the spool.
#[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
pub async fn run(config: Config) -> anyhow::Result<()> {
    logging::init();

    let mta = Mta::from_config(&config, None)?;
    mta.init().await?;

    internal!(
        level = INFO,
        hostname = %config.hostname,
        outbound = mta.outbound().pending(),
        notifications = mta.notifications().pending(),
        "Controller running"
    );

    let ret = tokio::select! {
        r = mta.serve(&SHUTDOWN_BROADCAST) => {
            r.map_err(anyhow::Error::from)
        }
        r = shutdown() => {
            r
        }
    };

    SHUTDOWN_BROADCAST.send(Signal::Finalised).ok();
    internal!("Shutting down...");

    ret
}
