use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the given token when SIGTERM or SIGINT arrives.
///
/// The daemon's serve loop and the scheduler loops watch the token and
/// drain gracefully; running children are left alone and picked up by
/// recovery on the next start.
pub fn watch_signals(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
            }
        }

        token.cancel();
    });
}
