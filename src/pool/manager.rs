//! Proxy pool manager
//!
//! Owns every egress path, applies probe results, and implements selection
//! and rotation. The `direct` entry is always present and always healthy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::health::{HealthChecker, HealthCheckerHandle};
use super::probe::{tcp_reachable, ConnectivityProbe, ProbeOutcome};
use super::selection::{choose_preferring_high, choose_random, healthy_candidates, seed_active};
use crate::config::PoolConfig;
use crate::error::{Result, VeilError};
use crate::models::{ProxyConfig, ProxyKind, ProxyPreference, DIRECT_PROXY_NAME};

/// Mutable pool state, always accessed under one lock
struct PoolState {
    proxies: HashMap<String, ProxyConfig>,
    active_name: String,
    request_count: u64,
    last_rotation: DateTime<Utc>,
}

impl PoolState {
    fn new() -> Self {
        let direct = ProxyConfig::direct();
        Self {
            active_name: direct.name.clone(),
            proxies: HashMap::from([(direct.name.clone(), direct)]),
            request_count: 0,
            last_rotation: Utc::now(),
        }
    }

    /// Entry by name, falling back to direct
    fn entry_or_direct(&mut self, name: &str) -> &mut ProxyConfig {
        let name = if self.proxies.contains_key(name) {
            name
        } else {
            DIRECT_PROXY_NAME
        };

        self.proxies
            .entry(name.to_string())
            .or_insert_with(ProxyConfig::direct)
    }

    fn rotate(&mut self, kind: Option<ProxyKind>) -> Option<String> {
        let candidates = healthy_candidates(&self.proxies, kind, Some(&self.active_name));
        let next = choose_random(&candidates)?;

        self.active_name = next.clone();
        self.last_rotation = Utc::now();
        Some(next)
    }

    fn apply(&mut self, name: &str, outcome: &ProbeOutcome) {
        let Some(proxy) = self.proxies.get_mut(name) else {
            return;
        };

        match outcome {
            ProbeOutcome::Healthy { latency } => proxy.record_success(*latency),
            ProbeOutcome::Unhealthy { reason } => proxy.record_failure(reason.clone()),
        }
    }

    fn reseed_if_unhealthy(&mut self) {
        let active_ok = self
            .proxies
            .get(&self.active_name)
            .is_some_and(|p| p.is_healthy);

        if !active_ok {
            let next = seed_active(&self.proxies);
            info!(from = %self.active_name, to = %next, "Active proxy reseeded");
            self.active_name = next;
        }
    }
}

/// Outcome counts of one health round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Pool of egress paths with health checking, selection and rotation
pub struct ProxyPoolManager {
    config: PoolConfig,
    probe: Arc<dyn ConnectivityProbe>,
    state: Mutex<PoolState>,
    health: Mutex<Option<HealthCheckerHandle>>,
}

impl ProxyPoolManager {
    pub fn new(config: PoolConfig, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            config,
            probe,
            state: Mutex::new(PoolState::new()),
            health: Mutex::new(None),
        }
    }

    /// Probe every configured path, seed the active selection and start the
    /// background health checks
    #[instrument(skip(self))]
    pub async fn initialize(self: &Arc<Self>) {
        let mut entries = Vec::new();

        if let Some(addr) = &self.config.tor_socks {
            if tcp_reachable(addr, self.config.probe_timeout).await {
                info!("Anonymity network traffic port {} is reachable", addr);
                entries.push(ProxyConfig::tor(addr));
            } else {
                warn!(
                    "Anonymity network traffic port {} is unreachable, continuing without it",
                    addr
                );
            }
        }

        for spec in &self.config.static_proxies {
            let mut proxy = ProxyConfig::new(
                spec.name.clone(),
                spec.endpoint.clone(),
                spec.kind,
                spec.kind.default_anonymity_level(),
            );
            if let Some(country) = &spec.country {
                proxy = proxy.with_country(country.clone());
            }
            entries.push(proxy);
        }

        let mut seen = HashSet::from([DIRECT_PROXY_NAME.to_string()]);
        entries.retain(|proxy| {
            let fresh = seen.insert(proxy.name.clone());
            if !fresh {
                warn!("Skipping duplicate proxy name {}", proxy.name);
            }
            fresh
        });

        let results = self.probe_entries(entries.clone()).await;

        {
            let mut state = self.state.lock();

            for proxy in entries {
                state.proxies.entry(proxy.name.clone()).or_insert(proxy);
            }

            for (name, outcome) in &results {
                state.apply(name, outcome);
            }

            state
                .proxies
                .entry(DIRECT_PROXY_NAME.to_string())
                .or_insert_with(ProxyConfig::direct);

            state.active_name = seed_active(&state.proxies);

            info!(
                total = state.proxies.len(),
                healthy = state.proxies.values().filter(|p| p.is_healthy).count(),
                active = %state.active_name,
                "Proxy pool initialized"
            );
        }

        self.start_health_checks();
    }

    /// Start the periodic health checks if they are not running yet
    fn start_health_checks(self: &Arc<Self>) {
        let mut slot = self.health.lock();
        if slot.is_some() {
            debug!("Health checker already running");
            return;
        }

        let checker = HealthChecker::new(self.clone(), self.config.health_check_interval);
        *slot = Some(HealthCheckerHandle::spawn(checker));
    }

    /// Stop the health checks and wait for the task to finish
    pub async fn shutdown(&self) {
        let handle = self.health.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!("Proxy pool health checker stopped");
        }
    }

    /// Probe entries with bounded concurrency. Each probe runs in its own task,
    /// so a panicking probe only marks its own entry unhealthy.
    async fn probe_entries(&self, entries: Vec<ProxyConfig>) -> Vec<(String, ProbeOutcome)> {
        let workers = self.config.health_workers.max(1);

        futures::stream::iter(entries.into_iter().filter(|p| !p.is_direct()))
            .map(|proxy| {
                let probe = self.probe.clone();
                let name = proxy.name.clone();
                async move {
                    let outcome = tokio::spawn(async move { probe.probe(&proxy).await })
                        .await
                        .unwrap_or_else(|e| {
                            error!(proxy = %name, "Probe task failed: {}", e);
                            ProbeOutcome::unhealthy(format!("probe task failed: {}", e))
                        });
                    (name, outcome)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await
    }

    /// Re-probe every non-direct entry and apply the results
    #[instrument(skip(self))]
    pub async fn check_all(&self) -> HealthSummary {
        let entries: Vec<ProxyConfig> = {
            let state = self.state.lock();
            state
                .proxies
                .values()
                .filter(|p| !p.is_direct())
                .cloned()
                .collect()
        };

        info!("Checking health of {} proxies", entries.len());
        let results = self.probe_entries(entries).await;

        let mut summary = HealthSummary::default();
        let mut state = self.state.lock();
        for (name, outcome) in &results {
            if outcome.is_healthy() {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
            }
            state.apply(name, outcome);
        }
        state.reseed_if_unhealthy();

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            summary.healthy, summary.unhealthy
        );
        summary
    }

    /// Select an egress path. Never fails: falls back to `direct`.
    pub fn get_proxy(&self, preferred: ProxyPreference) -> ProxyConfig {
        let mut state = self.state.lock();
        state.request_count += 1;

        if state.request_count % self.config.rotate_every.max(1) == 0 && self.rotation_due(&state)
        {
            if let Some(next) = state.rotate(None) {
                debug!(
                    request_count = state.request_count,
                    active = %next,
                    "Periodic rotation"
                );
            }
        }

        let selected = match preferred.kind() {
            None => {
                let candidates = healthy_candidates(&state.proxies, None, None);
                choose_preferring_high(&candidates)
            }
            Some(ProxyKind::Direct) => None,
            Some(kind) => {
                let candidates = healthy_candidates(&state.proxies, Some(kind), None);
                choose_random(&candidates)
            }
        }
        .unwrap_or_else(|| DIRECT_PROXY_NAME.to_string());

        let proxy = state.entry_or_direct(&selected);
        proxy.last_used = Some(Utc::now());
        let proxy = proxy.clone();
        state.active_name = proxy.name.clone();

        debug!(
            proxy = %proxy.name,
            preferred = ?preferred,
            "Selected egress path"
        );
        proxy
    }

    /// Switch the active path to a different healthy entry.
    ///
    /// Returns the new active name, or `None` when no other candidate exists.
    pub fn rotate_identity(&self, kind: Option<ProxyKind>) -> Option<String> {
        let mut state = self.state.lock();
        let previous = state.active_name.clone();

        match state.rotate(kind) {
            Some(next) => {
                info!(from = %previous, to = %next, "Rotated egress identity");
                Some(next)
            }
            None => {
                debug!(active = %previous, "No alternative proxy to rotate to");
                None
            }
        }
    }

    fn rotation_due(&self, state: &PoolState) -> bool {
        let cooldown = chrono::Duration::from_std(self.config.rotation_cooldown)
            .unwrap_or(chrono::Duration::MAX);
        Utc::now().signed_duration_since(state.last_rotation) >= cooldown
    }

    /// Mark an entry healthy (operator override)
    pub fn mark_healthy(&self, name: &str, latency: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let proxy = state
            .proxies
            .get_mut(name)
            .ok_or_else(|| VeilError::ProxyNotFound {
                name: name.to_string(),
            })?;
        proxy.record_success(latency);
        Ok(())
    }

    /// Mark an entry unhealthy. The direct entry refuses.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) -> Result<()> {
        if name == DIRECT_PROXY_NAME {
            return Err(VeilError::InvalidRequest(
                "the direct entry cannot be marked unhealthy".to_string(),
            ));
        }

        let mut state = self.state.lock();
        state
            .proxies
            .get_mut(name)
            .ok_or_else(|| VeilError::ProxyNotFound {
                name: name.to_string(),
            })?
            .record_failure(reason);
        state.reseed_if_unhealthy();
        Ok(())
    }

    /// Healthy entry names of one kind, sorted
    pub fn healthy_names(&self, kind: ProxyKind) -> Vec<String> {
        let state = self.state.lock();
        healthy_candidates(&state.proxies, Some(kind), None)
            .into_iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Healthy VPN entries
    pub fn vpn_pools(&self) -> Vec<String> {
        self.healthy_names(ProxyKind::Vpn)
    }

    /// Healthy HTTP and anonymity-network entries
    pub fn proxy_pools(&self) -> Vec<String> {
        let mut names = self.healthy_names(ProxyKind::Http);
        names.extend(self.healthy_names(ProxyKind::Tor));
        names.sort();
        names
    }

    pub fn active_name(&self) -> String {
        self.state.lock().active_name.clone()
    }

    /// Snapshot of the active entry
    pub fn active(&self) -> ProxyConfig {
        let mut state = self.state.lock();
        let name = state.active_name.clone();
        state.entry_or_direct(&name).clone()
    }

    pub fn get(&self, name: &str) -> Option<ProxyConfig> {
        self.state.lock().proxies.get(name).cloned()
    }

    /// Snapshot of every entry, sorted by name
    pub fn proxies(&self) -> Vec<ProxyConfig> {
        let state = self.state.lock();
        let mut all: Vec<ProxyConfig> = state.proxies.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn request_count(&self) -> u64 {
        self.state.lock().request_count
    }

    pub fn last_rotation(&self) -> DateTime<Utc> {
        self.state.lock().last_rotation
    }

    pub fn is_health_checking(&self) -> bool {
        self.health.lock().is_some()
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_rotation(&self, by: Duration) {
        let mut state = self.state.lock();
        state.last_rotation -= chrono::Duration::from_std(by).unwrap();
    }
}
