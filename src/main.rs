//! Veil - Entry Point
//!
//! Connects the anonymity network controller, initializes the egress pool and
//! serves the API until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use veil::api::{ApiServer, AppState};
use veil::config::{Config, LogConfig};
use veil::mediator::{AuditSink, HttpOutboundClient, RequestMediator};
use veil::pool::{HttpProbe, ProxyPoolManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting Veil");

    let controller = veil::anonymity::connect(&config.tor).await;
    info!(
        available = controller.is_available().await,
        "Anonymity network controller ready"
    );

    let probe = Arc::new(HttpProbe::new(
        config.pool.probe_url.clone(),
        config.pool.probe_timeout,
    ));
    let pool = Arc::new(ProxyPoolManager::new(config.pool.clone(), probe));
    pool.initialize().await;

    let mediator = Arc::new(RequestMediator::new(
        pool.clone(),
        controller.clone(),
        Arc::new(HttpOutboundClient::new(&config.mediator)),
        AuditSink::new(),
    ));

    let api_server = ApiServer::new(
        config.api.clone(),
        AppState::new(pool.clone(), controller.clone(), mediator),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(shutdown_rx).await {
            error!("API server error: {}", e);
        }
    });

    info!("API listening on {}", config.api.bind_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(e) = api_task.await {
        error!("API server task failed: {}", e);
    }

    pool.shutdown().await;
    controller.cleanup().await;

    info!("Veil stopped");
    Ok(())
}

/// Install the global subscriber; `RUST_LOG` wins over `LOG_LEVEL`
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("veil={},tower_http=info", log.level))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
