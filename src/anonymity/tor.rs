//! Controller backed by a running anonymity-network daemon

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::control::ControlConnection;
use super::AnonymityController;
use crate::config::TorConfig;
use crate::error::{Result, VeilError};
use crate::models::CircuitInfo;
use crate::pool::probe::tcp_reachable;

/// Minimum wait between attempts to reopen a lost control session
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Controller speaking the daemon's control protocol
///
/// Degrades to "unavailable" instead of failing: every operation returns a
/// negative or empty result when the daemon cannot be reached. A session that
/// breaks or is left mid-exchange is discarded and reopened on a later call.
pub struct TorController {
    config: TorConfig,
    traffic_reachable: bool,
    session: AsyncMutex<Option<ControlConnection>>,
    reconnect_after: Mutex<Option<Instant>>,
    closed: AtomicBool,
    last_new_identity: Mutex<Option<Instant>>,
}

impl TorController {
    /// Probe the traffic port, then open and authenticate a control session
    #[instrument(skip(config), fields(socks = %config.socks_addr(), control = %config.control_addr()))]
    pub async fn connect(config: TorConfig) -> Self {
        let traffic_reachable = tcp_reachable(&config.socks_addr(), config.control_timeout).await;
        let mut reconnect_after = None;

        let session = if traffic_reachable {
            match Self::open_session(&config).await {
                Ok(conn) => {
                    info!("Anonymity network control session established");
                    Some(conn)
                }
                Err(e) => {
                    warn!("Anonymity network control unavailable: {}", e);
                    reconnect_after = Some(Instant::now() + RECONNECT_BACKOFF);
                    None
                }
            }
        } else {
            warn!(
                "Anonymity network traffic port {} unreachable, controller disabled",
                config.socks_addr()
            );
            None
        };

        Self {
            config,
            traffic_reachable,
            session: AsyncMutex::new(session),
            reconnect_after: Mutex::new(reconnect_after),
            closed: AtomicBool::new(false),
            last_new_identity: Mutex::new(None),
        }
    }

    async fn open_session(config: &TorConfig) -> Result<ControlConnection> {
        let mut conn =
            ControlConnection::connect(&config.control_addr(), config.control_timeout).await?;
        conn.authenticate(config.control_password.as_deref()).await?;
        Ok(conn)
    }

    fn may_reconnect(&self) -> bool {
        self.traffic_reachable
            && !self.closed.load(Ordering::Acquire)
            && self
                .reconnect_after
                .lock()
                .map_or(true, |at| Instant::now() >= at)
    }

    /// Lock the session, replacing one that is desynced or lost
    async fn session(&self) -> AsyncMutexGuard<'_, Option<ControlConnection>> {
        let mut session = self.session.lock().await;

        if session.as_ref().is_some_and(ControlConnection::is_desynced) {
            warn!("Discarding control session left mid-exchange");
            *session = None;
        }

        if session.is_none() && self.may_reconnect() {
            match Self::open_session(&self.config).await {
                Ok(conn) => {
                    info!("Anonymity network control session reopened");
                    *self.reconnect_after.lock() = None;
                    *session = Some(conn);
                }
                Err(e) => {
                    debug!("Control session reopen failed: {}", e);
                    *self.reconnect_after.lock() = Some(Instant::now() + RECONNECT_BACKOFF);
                }
            }
        }

        session
    }

    /// Reserve the rotation slot. Returns the previous timestamp for rollback,
    /// or `None` when the last rotation is too recent.
    fn reserve_rotation(&self) -> Option<Option<Instant>> {
        let mut last = self.last_new_identity.lock();

        if let Some(at) = *last {
            if at.elapsed() < self.config.min_identity_interval {
                return None;
            }
        }

        Some(last.replace(Instant::now()))
    }

    async fn send_newnym(&self) -> Result<()> {
        let mut session = self.session().await;
        let conn = session.as_mut().ok_or(VeilError::ControllerUnavailable)?;

        let result = conn.signal_newnym().await;
        discard_if_desynced(&mut session, &result);
        result
    }
}

/// Drop a session whose last command failed without a complete reply
fn discard_if_desynced<T>(session: &mut Option<ControlConnection>, result: &Result<T>) {
    let Err(e) = result else {
        return;
    };

    if session.as_ref().is_some_and(ControlConnection::is_desynced) {
        warn!("Control session lost: {}", e);
        *session = None;
    }
}

#[async_trait]
impl AnonymityController for TorController {
    async fn is_available(&self) -> bool {
        self.traffic_reachable && self.session().await.is_some()
    }

    async fn is_circuit_established(&self) -> bool {
        self.get_circuit_info().await.built > 0
    }

    #[instrument(skip(self))]
    async fn new_identity(&self) -> bool {
        let Some(previous) = self.reserve_rotation() else {
            debug!("Identity rotation rate limited");
            return false;
        };

        if !self.is_available().await {
            *self.last_new_identity.lock() = previous;
            return false;
        }

        match self.send_newnym().await {
            Ok(()) => {
                tokio::time::sleep(self.config.circuit_settle).await;
                *self.last_new_identity.lock() = Some(Instant::now());
                info!("Requested new anonymity network identity");
                true
            }
            Err(e) => {
                warn!("New identity request failed: {}", e);
                *self.last_new_identity.lock() = previous;
                false
            }
        }
    }

    async fn get_circuit_info(&self) -> CircuitInfo {
        if !self.traffic_reachable {
            return CircuitInfo::default();
        }

        let mut session = self.session().await;
        let Some(conn) = session.as_mut() else {
            return CircuitInfo::default();
        };

        let result = conn.circuit_status().await;
        discard_if_desynced(&mut session, &result);

        match result {
            Ok(circuits) => CircuitInfo::from_circuits(&circuits),
            Err(e) => {
                warn!("Circuit listing failed: {}", e);
                CircuitInfo::default()
            }
        }
    }

    async fn cleanup(&self) {
        self.closed.store(true, Ordering::Release);

        let session = self.session.lock().await.take();
        if let Some(conn) = session {
            if !conn.is_desynced() {
                conn.quit().await;
            }
            info!("Anonymity network control session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::anonymity::control::testing::{spawn_fake_daemon, spawn_slow_daemon, standard_reply};

    use tokio::net::TcpListener;

    fn split_addr(addr: &str) -> (String, u16) {
        let (host, port) = addr.rsplit_once(':').unwrap();
        (host.to_string(), port.parse().unwrap())
    }

    /// Config whose traffic port is `socks` and control port is `control`
    fn tor_config(socks: &str, control: &str) -> TorConfig {
        let (host, socks_port) = split_addr(socks);
        let (_, control_port) = split_addr(control);
        TorConfig {
            host,
            socks_port,
            control_port,
            control_password: Some("s3cret".to_string()),
            min_identity_interval: Duration::from_secs(10),
            circuit_settle: Duration::from_millis(10),
            control_timeout: Duration::from_secs(1),
            ..TorConfig::default()
        }
    }

    async fn reachable_traffic_port() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_unreachable_traffic_port_degrades() {
        let (listener, socks) = reachable_traffic_port().await;
        drop(listener);
        let (control, seen) = spawn_fake_daemon(standard_reply).await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;

        assert!(!controller.is_available().await);
        assert!(!controller.is_circuit_established().await);
        assert!(!controller.new_identity().await);
        assert!(controller.get_circuit_info().await.is_empty());
        controller.cleanup().await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_authentication_degrades() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, _seen) = spawn_fake_daemon(|line| {
            if line.starts_with("AUTHENTICATE") {
                "515 Authentication failed\r\n".to_string()
            } else {
                standard_reply(line)
            }
        })
        .await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;
        assert!(!controller.is_available().await);
        assert!(!controller.new_identity().await);
    }

    #[tokio::test]
    async fn test_available_with_built_circuit() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, _seen) = spawn_fake_daemon(standard_reply).await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;
        assert!(controller.is_available().await);
        assert!(controller.is_circuit_established().await);

        let info = controller.get_circuit_info().await;
        assert_eq!(info.built, 1);
        assert_eq!(info.building, 1);
        assert_eq!(info.failed, 1);
        assert_eq!(info.first_built.unwrap().path_length, 3);
    }

    #[tokio::test]
    async fn test_new_identity_rate_limited() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, seen) = spawn_fake_daemon(standard_reply).await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;
        assert!(controller.new_identity().await);
        assert!(!controller.new_identity().await);

        let signals = seen
            .lock()
            .iter()
            .filter(|l| l.as_str() == "SIGNAL NEWNYM")
            .count();
        assert_eq!(signals, 1);
    }

    #[tokio::test]
    async fn test_concurrent_new_identity_signals_once() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, seen) = spawn_fake_daemon(standard_reply).await;

        let controller =
            std::sync::Arc::new(TorController::connect(tor_config(&socks, &control)).await);

        let (a, b) = tokio::join!(
            {
                let c = controller.clone();
                async move { c.new_identity().await }
            },
            {
                let c = controller.clone();
                async move { c.new_identity().await }
            }
        );

        assert!(a ^ b);
        let signals = seen
            .lock()
            .iter()
            .filter(|l| l.as_str() == "SIGNAL NEWNYM")
            .count();
        assert_eq!(signals, 1);
    }

    #[tokio::test]
    async fn test_rejected_signal_releases_rate_limit() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, seen) = spawn_fake_daemon(|line| match line {
            "SIGNAL NEWNYM" => "552 Unrecognized signal\r\n".to_string(),
            other => standard_reply(other),
        })
        .await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;
        assert!(!controller.new_identity().await);
        assert!(!controller.new_identity().await);

        let signals = seen
            .lock()
            .iter()
            .filter(|l| l.as_str() == "SIGNAL NEWNYM")
            .count();
        assert_eq!(signals, 2);
        assert!(controller.is_available().await);
    }

    #[tokio::test]
    async fn test_late_signal_reply_is_not_read_as_circuit_listing() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, seen) = spawn_slow_daemon(|line| match line {
            "SIGNAL NEWNYM" => (Duration::from_millis(300), "250 OK\r\n".to_string()),
            other => (Duration::ZERO, standard_reply(other)),
        })
        .await;

        let mut config = tor_config(&socks, &control);
        config.control_timeout = Duration::from_millis(150);
        let controller = TorController::connect(config).await;

        assert!(!controller.new_identity().await);

        let info = controller.get_circuit_info().await;
        assert_eq!(info.built, 1);
        assert_eq!(info.building, 1);
        assert!(controller.is_available().await);

        let authentications = seen
            .lock()
            .iter()
            .filter(|l| l.starts_with("AUTHENTICATE"))
            .count();
        assert_eq!(authentications, 2);
    }

    #[tokio::test]
    async fn test_cancelled_call_does_not_leak_reply() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let slow_once = Arc::new(AtomicBool::new(true));
        let flag = slow_once.clone();
        let (control, _seen) = spawn_slow_daemon(move |line| match line {
            "GETINFO circuit-status" if flag.swap(false, Ordering::SeqCst) => {
                (Duration::from_millis(300), standard_reply(line))
            }
            other => (Duration::ZERO, standard_reply(other)),
        })
        .await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), controller.get_circuit_info()).await;
        assert!(cancelled.is_err());
        assert!(!slow_once.load(Ordering::SeqCst));

        assert!(controller.new_identity().await);
        let info = controller.get_circuit_info().await;
        assert_eq!(info.built, 1);
        assert_eq!(info.failed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_prevents_reopen() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, seen) = spawn_fake_daemon(standard_reply).await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;
        controller.cleanup().await;

        assert!(!controller.is_available().await);
        assert!(controller.get_circuit_info().await.is_empty());
        let authentications = seen
            .lock()
            .iter()
            .filter(|l| l.starts_with("AUTHENTICATE"))
            .count();
        assert_eq!(authentications, 1);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (_traffic, socks) = reachable_traffic_port().await;
        let (control, seen) = spawn_fake_daemon(standard_reply).await;

        let controller = TorController::connect(tor_config(&socks, &control)).await;
        controller.cleanup().await;
        controller.cleanup().await;

        assert!(!controller.is_available().await);
        let quits = seen.lock().iter().filter(|l| l.as_str() == "QUIT").count();
        assert_eq!(quits, 1);
    }
}
