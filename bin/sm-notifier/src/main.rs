//! Service Manager Notifier
//!
//! Listens on the PostgreSQL notification channel and distributes committed
//! resource changes to registered platforms. Also runs the periodic cleanup of
//! expired notifications and serves health, readiness, metrics and stats.
//!
//! Configuration is read by `sm-config` (`SM_CONFIG_FILE` plus `SM_*`
//! overrides). Log verbosity follows `RUST_LOG`.

mod api;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sm_config::{LogFormat, Settings};
use sm_notify::postgres::{PgConnectionFactory, PgNotificationStorage};
use sm_notify::{NotificationCleaner, Notificator};

use crate::api::{create_router, AppState};

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    init_logging(settings.log.format);

    info!("Starting Service Manager Notifier");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Storage
    let pool = PgPoolOptions::new()
        .max_connections(settings.storage.max_connections)
        .connect(&settings.storage.uri)
        .await
        .context("failed to connect to storage")?;

    let storage = Arc::new(PgNotificationStorage::new(
        pool.clone(),
        settings.notification.channel.clone(),
    ));
    storage.init_schema().await?;

    // Notificator
    let connection_factory = Arc::new(PgConnectionFactory::new(pool.clone(), &settings.notification));
    let notificator = Arc::new(Notificator::new(
        settings.notification.clone(),
        storage.clone(),
        connection_factory,
    ));
    notificator.start(shutdown_tx.subscribe()).await?;

    let cleaner_handle =
        NotificationCleaner::new(storage, &settings.notification).start(shutdown_tx.subscribe());

    // HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
    let app = create_router(AppState {
        notificator: notificator.clone(),
        prometheus,
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });
            if let Err(e) = server.await {
                error!("HTTP server error: {}", e);
            }
        })
    };

    info!("Service Manager Notifier started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = cleaner_handle.await;
        let _ = server_handle.await;
    })
    .await;

    pool.close().await;
    info!("Service Manager Notifier shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
