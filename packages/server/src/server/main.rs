// Main entry point for the provisioning controller

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::kernel::bmc::RedfishConnector;
use server_core::kernel::jobs::reconciler;
use server_core::kernel::jobs::WorkerPool;
use server_core::kernel::secrets::SecretCipher;
use server_core::kernel::store::Store;
use server_core::kernel::ServerDeps;
use server_core::server::build_app;
use server_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load();

    if let Err(e) = run(config).await {
        tracing::error!(error = %format!("{e:#}"), "controller failed to start");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!("starting provisioning controller");

    std::fs::create_dir_all(config.task_iso_dir())
        .with_context(|| format!("creating {}", config.task_iso_dir().display()))?;

    let secrets = SecretCipher::from_passphrase(config.secrets_passphrase.as_deref());
    let store = Arc::new(Store::open(&config.db_path, secrets).await?);
    tracing::info!(db = %config.db_path.display(), "store opened");

    // Rescue jobs a previous run left in provisioning before anything new
    // gets picked up.
    reconciler::requeue_orphans(&store).await?;

    let bmc = Arc::new(RedfishConnector::new(
        config.bmc_timeout(),
        config.bmc_retries,
    ));
    let http_addr = config.http_addr;
    let deps = ServerDeps::new(config, store, bmc);

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(&deps, &shutdown);

    let app = build_app(deps);
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding {http_addr}"))?;
    tracing::info!(addr = %http_addr, "listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        serve_shutdown.cancel();
    })
    .await
    .context("HTTP server error")?;

    // HTTP is down; stop the workers and wait for them to drain.
    shutdown.cancel();
    pool.join().await;

    tracing::info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
