//! Controller used when the anonymity network is switched off

use async_trait::async_trait;

use super::AnonymityController;
use crate::models::CircuitInfo;

/// No-op controller: always unavailable, never contacts anything
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledController;

#[async_trait]
impl AnonymityController for DisabledController {
    async fn is_available(&self) -> bool {
        false
    }

    async fn is_circuit_established(&self) -> bool {
        false
    }

    async fn new_identity(&self) -> bool {
        false
    }

    async fn get_circuit_info(&self) -> CircuitInfo {
        CircuitInfo::default()
    }

    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_controller_is_inert() {
        let controller = DisabledController;
        assert!(!controller.is_available().await);
        assert!(!controller.is_circuit_established().await);
        assert!(!controller.new_identity().await);
        assert!(controller.get_circuit_info().await.is_empty());
        controller.cleanup().await;
    }
}
