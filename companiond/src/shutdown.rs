use tokio::sync::watch;
use tracing::info;

/// Listen for OS termination signals and flip the shutdown channel.
///
/// SIGTERM / SIGINT on Unix, Ctrl-C elsewhere. Runs until a signal arrives.
#[cfg(unix)]
pub async fn signal_listener(shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "failed to register SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
    }
    let _ = shutdown_tx.send(true);
}

#[cfg(not(unix))]
pub async fn signal_listener(shutdown_tx: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received ctrl-c, initiating graceful shutdown");
        let _ = shutdown_tx.send(true);
    }
}
