use tokio_util::sync::CancellationToken;

/// Cancels `shutdown` on the first SIGINT, SIGTERM or SIGHUP (Ctrl-C elsewhere).
#[cfg(unix)]
pub(crate) fn spawn_shutdown_handler(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGHUP handler");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT, stopping proxies"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping proxies"),
            _ = sighup.recv() => tracing::info!("received SIGHUP, stopping proxies"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}

#[cfg(not(unix))]
pub(crate) fn spawn_shutdown_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                    return;
                }
                tracing::info!("received Ctrl-C, stopping proxies");
            }
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}
