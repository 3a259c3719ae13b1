//! Anonymity-network controller
//!
//! A capability interface with two implementations, chosen once at startup:
//! a controller speaking the daemon's control protocol and a disabled stub.

pub mod control;
pub mod disabled;
pub mod tor;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::TorConfig;
use crate::models::CircuitInfo;

pub use disabled::DisabledController;
pub use tor::TorController;

/// Operations on the anonymity network daemon
///
/// None of these fail: an unreachable daemon yields `false` or an empty
/// result.
#[async_trait]
pub trait AnonymityController: Send + Sync {
    /// Traffic port reachable and control session authenticated
    async fn is_available(&self) -> bool;

    /// At least one circuit is built
    async fn is_circuit_established(&self) -> bool;

    /// Request clean circuits. Rate limited; `false` when skipped or failed.
    async fn new_identity(&self) -> bool;

    async fn get_circuit_info(&self) -> CircuitInfo;

    /// Close the control session. Idempotent.
    async fn cleanup(&self);
}

/// Build the controller for this configuration
pub async fn connect(config: &TorConfig) -> Arc<dyn AnonymityController> {
    if !config.enabled {
        info!("Anonymity network disabled by configuration");
        return Arc::new(DisabledController);
    }

    Arc::new(TorController::connect(config.clone()).await)
}
