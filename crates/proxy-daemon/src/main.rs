mod cli;
mod config;
mod logging;
mod server;
mod shutdown;
#[cfg(test)]
mod test_utils;

use crate::cli::Args;
use crate::config::load_daemon_config;
use crate::logging::init_tracing;
use crate::server::{handle_connection, ServerContext};
use crate::shutdown::spawn_shutdown_handler;
use anyhow::Context;
use clap::Parser;
use profile_manager::{ProfileManager, HEALTH_INTERVAL};
use std::sync::Arc;
use system_utils::path::expand_tilde;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = expand_tilde(&args.config);
    let config = load_daemon_config(&config_path)?;
    let manager_config = config.manager_config(args.data_dir.as_deref())?;
    let _log_guard = init_tracing(&manager_config.log_dir(), args.log_to_stderr)?;

    // Bound before reconcile so a second daemon cannot kill the first one's proxies.
    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;

    let manager = Arc::new(
        ProfileManager::open(manager_config).context("failed to open profile state")?,
    );
    let terminated = manager
        .reconcile()
        .await
        .context("failed to reconcile previous sessions")?;
    if terminated > 0 {
        tracing::info!(terminated, "stopped wireproxy instances left by a previous run");
    }
    match manager.discover().await {
        Ok(found) if !found.is_empty() => {
            tracing::info!(count = found.len(), "registered profiles found on disk");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "profile discovery failed"),
    }

    let shutdown = CancellationToken::new();
    spawn_shutdown_handler(shutdown.clone());
    let health = {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.watch_health(HEALTH_INTERVAL, shutdown).await })
    };

    let context = Arc::new(ServerContext::new(Arc::clone(&manager), shutdown.clone()));
    tracing::info!(addr = %args.listen_addr, "wireproxy-daemon listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accept = listener.accept() => {
                let (stream, peer) = match accept {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "listener accept failed");
                        continue;
                    }
                };
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, context).await {
                        tracing::warn!(peer = %peer, error = %err, "failed to handle connection");
                    }
                });
            }
        }
    }

    let _ = health.await;
    manager.shutdown().await;
    tracing::info!("wireproxy-daemon stopped");
    Ok(())
}
