//! Connectivity probes for egress paths
//!
//! A probe is a bounded test request through one path. Failures are
//! reported as values, never raised.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::models::ProxyConfig;

/// Result of probing one egress path
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    Unhealthy { reason: String },
}

impl ProbeOutcome {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        ProbeOutcome::Unhealthy {
            reason: reason.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }
}

/// Tests whether an egress path is currently usable
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, proxy: &ProxyConfig) -> ProbeOutcome;
}

/// Probes a path by fetching an "echo my address" endpoint through it
pub struct HttpProbe {
    probe_url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(probe_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.into(),
            timeout,
        }
    }

    fn build_client(&self, proxy: &ProxyConfig) -> Result<Client, reqwest::Error> {
        let builder = Client::builder().timeout(self.timeout);

        let builder = if proxy.endpoint.is_empty() {
            builder.no_proxy()
        } else {
            builder.proxy(Proxy::all(proxy.endpoint.as_str())?)
        };

        builder.build()
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    #[instrument(skip(self, proxy), fields(proxy = %proxy.name, kind = %proxy.kind))]
    async fn probe(&self, proxy: &ProxyConfig) -> ProbeOutcome {
        let client = match self.build_client(proxy) {
            Ok(c) => c,
            Err(e) => {
                let reason = format!("invalid proxy endpoint: {}", e);
                warn!("Proxy {} is unhealthy: {}", proxy.name, reason);
                return ProbeOutcome::unhealthy(reason);
            }
        };

        let start = Instant::now();
        let outcome = match timeout(self.timeout, client.get(&self.probe_url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Healthy {
                latency: start.elapsed(),
            },
            Ok(Ok(response)) => {
                ProbeOutcome::unhealthy(format!("probe returned status {}", response.status()))
            }
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::unhealthy("probe timed out"),
            Ok(Err(e)) => ProbeOutcome::unhealthy(format!("probe failed: {}", e)),
            Err(_) => ProbeOutcome::unhealthy("probe timed out"),
        };

        match &outcome {
            ProbeOutcome::Healthy { latency } => {
                debug!("Proxy {} is healthy ({:?})", proxy.name, latency)
            }
            ProbeOutcome::Unhealthy { reason } => {
                warn!("Proxy {} is unhealthy: {}", proxy.name, reason)
            }
        }

        outcome
    }
}

/// Bounded TCP connect used to decide whether a daemon port is listening
pub async fn tcp_reachable(addr: &str, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("{} is not reachable: {}", addr, e);
            false
        }
        Err(_) => {
            debug!("{} did not answer within {:?}", addr, limit);
            false
        }
    }
}
