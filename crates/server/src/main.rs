//! Server entry point.

use std::sync::Arc;

use anyhow::Context;

use lasertag_server::config::Config;
use lasertag_server::registry::Server;
use lasertag_server::{acceptor, logging};

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .context("usage: lasertag-server <config.json>")?;
    let config = Config::load(&config_path)?;

    logging::init(&config.logger)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        "starting lasertag server"
    );

    let runtime = build_runtime(&config)?;
    runtime.block_on(run(Server::new(config)))?;

    tracing::info!("server shut down cleanly");
    Ok(())
}

/// Builds the runtime per `number_of_additional_threads`: `0` keeps all
/// work on the main thread, anything else adds that many workers.
fn build_runtime(config: &Config) -> anyhow::Result<tokio::runtime::Runtime> {
    let workers = config.worker_threads();
    let runtime = if workers == 0 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    } else {
        tracing::info!(workers, "starting worker threads");
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_all()
            .build()?
    };
    Ok(runtime)
}

async fn run(server: Arc<Server>) -> anyhow::Result<()> {
    tokio::select! {
        result = acceptor::run(Arc::clone(&server)) => {
            result.context("accept loop failed")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            server.shutdown();
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
