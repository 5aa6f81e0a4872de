use anyhow::Context;
use tokio::sync::watch;

use hrms_api::app::{build_app, services};
use hrms_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hrms_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!(role = %config.role, addr = %config.bind_addr, "starting service");

    let runtime = services::build_runtime(&config)
        .await
        .context("failed to start service components")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = runtime.relay.map(|relay| tokio::spawn(relay.run(shutdown_rx.clone())));
    let sync = tokio::spawn(runtime.sync.run(runtime.consumer, shutdown_rx.clone()));

    let app = build_app(runtime.services);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let mut http_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = http_shutdown.wait_for(|stop| *stop).await;
    });

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await.context("http server failed")?;

    let report = sync.await.context("user sync task panicked")?;
    tracing::info!(reason = ?report.reason, stats = ?report.stats, "user sync finished");
    if let Some(relay) = relay {
        let stats = relay.await.context("outbox relay task panicked")?;
        tracing::info!(stats = ?stats, "outbox relay finished");
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
