//! Periodic health checking for the proxy pool
//!
//! Each round runs in its own task and every probe within a round in its own
//! task too, so a panicking probe marks only its entry unhealthy and the loop
//! carries on with the next tick.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use super::manager::ProxyPoolManager;

/// Health checker for pool entries
pub struct HealthChecker {
    pool: Weak<ProxyPoolManager>,
    check_interval: Duration,
}

impl HealthChecker {
    pub fn new(pool: Arc<ProxyPoolManager>, check_interval: Duration) -> Self {
        Self {
            pool: Arc::downgrade(&pool),
            check_interval,
        }
    }

    /// Run the health checker (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health checker with {}s interval",
            self.check_interval.as_secs()
        );

        // initialize() has just probed everything; first round waits one period.
        let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(pool) = self.pool.upgrade() else {
                        debug!("Proxy pool dropped, stopping health checker");
                        break;
                    };

                    let round = tokio::spawn(async move { pool.check_all().await });
                    if let Err(e) = round.await {
                        error!("Health check round failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Guard for managing health checker lifecycle
pub struct HealthCheckerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthCheckerHandle {
    /// Spawn the checker loop
    pub fn spawn(checker: HealthChecker) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { checker.run(shutdown_rx).await });
        Self { shutdown_tx, task }
    }

    /// Signal the loop to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Health checker task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, StaticProxyConfig};
    use crate::models::ProxyKind;
    use crate::pool::probe::testing::ScriptedProbe;
    use crate::pool::probe::ProbeOutcome;

    fn pool_with(probe: Arc<ScriptedProbe>, interval: Duration) -> Arc<ProxyPoolManager> {
        let config = PoolConfig {
            health_check_interval: interval,
            static_proxies: vec![StaticProxyConfig {
                name: "vpn-a".to_string(),
                endpoint: "http://vpn-a.internal:3128".to_string(),
                kind: ProxyKind::Vpn,
                country: None,
            }],
            ..PoolConfig::default()
        };
        Arc::new(ProxyPoolManager::new(config, probe))
    }

    #[tokio::test]
    async fn test_rounds_run_every_interval_and_stop_on_shutdown() {
        let probe = Arc::new(ScriptedProbe::new());
        let pool = pool_with(probe.clone(), Duration::from_millis(50));
        pool.initialize().await;
        assert_eq!(probe.calls(), 1);

        probe.set("vpn-a", ProbeOutcome::unhealthy("connection reset"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(probe.calls() >= 2);
        assert!(!pool.get("vpn-a").unwrap().is_healthy);
        assert_eq!(pool.active_name(), "direct");

        pool.shutdown().await;
        let after_shutdown = probe.calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.calls(), after_shutdown);
    }

    #[tokio::test]
    async fn test_loop_stops_when_pool_dropped() {
        let probe = Arc::new(ScriptedProbe::new());
        let pool = pool_with(probe.clone(), Duration::from_millis(20));

        let handle = HealthCheckerHandle::spawn(HealthChecker::new(
            pool.clone(),
            Duration::from_millis(20),
        ));
        drop(pool);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.task.is_finished());
        assert_eq!(probe.calls(), 0);
        handle.shutdown().await;
    }
}
