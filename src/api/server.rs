//! API server using Axum
//!
//! Exposes mediated requests, pool status, rotation and circuit details.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::anonymity::AnonymityController;
use crate::config::ApiServerConfig;
use crate::error::{Result, VeilError};
use crate::mediator::RequestMediator;
use crate::pool::ProxyPoolManager;

use super::middleware::cors_layer;
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ProxyPoolManager>,
    pub controller: Arc<dyn AnonymityController>,
    pub mediator: Arc<RequestMediator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        pool: Arc<ProxyPoolManager>,
        controller: Arc<dyn AnonymityController>,
        mediator: Arc<RequestMediator>,
    ) -> Self {
        Self {
            pool,
            controller,
            mediator,
            started_at: Instant::now(),
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        let cors = cors_layer(&self.config.cors_origins);

        routes::create_router(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self.config.bind_addr().parse().map_err(|e| {
            VeilError::InvalidConfig(format!(
                "invalid API address {}: {}",
                self.config.bind_addr(),
                e
            ))
        })?;

        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| VeilError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
