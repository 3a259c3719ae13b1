use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the always-present direct entry
pub const DIRECT_PROXY_NAME: &str = "direct";

/// Name of the anonymity network entry seeded when the traffic port is reachable
pub const TOR_PROXY_NAME: &str = "tor";

/// Weight of the newest probe outcome in the success-rate moving average
const SUCCESS_RATE_ALPHA: f64 = 0.2;

/// Egress path type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Anonymity network (Tor) SOCKS endpoint
    #[serde(alias = "anonymity-network")]
    Tor,
    Vpn,
    Http,
    Direct,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Tor => "tor",
            ProxyKind::Vpn => "vpn",
            ProxyKind::Http => "http",
            ProxyKind::Direct => "direct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tor" | "anonymity-network" | "anonymity_network" => Some(ProxyKind::Tor),
            "vpn" => Some(ProxyKind::Vpn),
            "http" => Some(ProxyKind::Http),
            "direct" => Some(ProxyKind::Direct),
            _ => None,
        }
    }

    /// Anonymity level assigned to statically configured paths of this kind
    pub fn default_anonymity_level(&self) -> AnonymityLevel {
        match self {
            ProxyKind::Tor => AnonymityLevel::High,
            ProxyKind::Vpn => AnonymityLevel::Medium,
            ProxyKind::Http => AnonymityLevel::Low,
            ProxyKind::Direct => AnonymityLevel::None,
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requested path type for a selection: a concrete kind, or "auto"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPreference {
    #[default]
    Auto,
    #[serde(alias = "anonymity-network")]
    Tor,
    Vpn,
    Http,
    Direct,
}

impl ProxyPreference {
    /// The concrete kind requested, `None` for auto
    pub fn kind(&self) -> Option<ProxyKind> {
        match self {
            ProxyPreference::Auto => None,
            ProxyPreference::Tor => Some(ProxyKind::Tor),
            ProxyPreference::Vpn => Some(ProxyKind::Vpn),
            ProxyPreference::Http => Some(ProxyKind::Http),
            ProxyPreference::Direct => Some(ProxyKind::Direct),
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Some(ProxyPreference::Auto);
        }
        ProxyKind::from_str(s).map(Self::from)
    }
}

impl From<ProxyKind> for ProxyPreference {
    fn from(kind: ProxyKind) -> Self {
        match kind {
            ProxyKind::Tor => ProxyPreference::Tor,
            ProxyKind::Vpn => ProxyPreference::Vpn,
            ProxyKind::Http => ProxyPreference::Http,
            ProxyKind::Direct => ProxyPreference::Direct,
        }
    }
}

/// How much an egress path obscures the caller's origin
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl AnonymityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymityLevel::None => "none",
            AnonymityLevel::Low => "low",
            AnonymityLevel::Medium => "medium",
            AnonymityLevel::High => "high",
        }
    }
}

impl std::fmt::Display for AnonymityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One egress path and its health/usage state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    /// Proxy URL, empty for a direct connection
    pub endpoint: String,
    pub anonymity_level: AnonymityLevel,
    pub kind: ProxyKind,
    pub country: Option<String>,
    /// Probe latency in seconds
    pub latency: Option<f64>,
    pub success_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub last_error: Option<String>,
    pub is_healthy: bool,
}

impl ProxyConfig {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        kind: ProxyKind,
        anonymity_level: AnonymityLevel,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            anonymity_level,
            kind,
            country: None,
            latency: None,
            success_rate: 1.0,
            last_used: None,
            last_check: None,
            last_error: None,
            is_healthy: true,
        }
    }

    /// The terminal fallback entry
    pub fn direct() -> Self {
        Self::new(DIRECT_PROXY_NAME, "", ProxyKind::Direct, AnonymityLevel::None)
    }

    /// Anonymity network entry pointing at a SOCKS traffic address (`host:port`)
    pub fn tor(socks_addr: &str) -> Self {
        Self::new(
            TOR_PROXY_NAME,
            format!("socks5h://{}", socks_addr),
            ProxyKind::Tor,
            AnonymityLevel::High,
        )
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ProxyKind::Direct
    }

    /// Record a successful probe
    pub fn record_success(&mut self, latency: Duration) {
        self.is_healthy = true;
        self.latency = Some(latency.as_secs_f64());
        self.last_check = Some(Utc::now());
        self.last_error = None;
        self.success_rate = blend(self.success_rate, 1.0);
    }

    /// Record a failed probe. The direct entry is never marked unhealthy.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.last_check = Some(Utc::now());
        self.last_error = Some(reason.into());
        self.success_rate = blend(self.success_rate, 0.0);
        if !self.is_direct() {
            self.is_healthy = false;
        }
    }
}

fn blend(current: f64, sample: f64) -> f64 {
    (1.0 - SUCCESS_RATE_ALPHA) * current + SUCCESS_RATE_ALPHA * sample
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_kind_from_str() {
        assert_eq!(ProxyKind::from_str("tor"), Some(ProxyKind::Tor));
        assert_eq!(
            ProxyKind::from_str("anonymity-network"),
            Some(ProxyKind::Tor)
        );
        assert_eq!(ProxyKind::from_str("VPN"), Some(ProxyKind::Vpn));
        assert_eq!(ProxyKind::from_str("socks4"), None);
    }

    #[test]
    fn test_preference_deserializes_aliases() {
        let pref: ProxyPreference = serde_json::from_str("\"anonymity-network\"").unwrap();
        assert_eq!(pref, ProxyPreference::Tor);
        let pref: ProxyPreference = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(pref.kind(), None);
        assert_eq!(ProxyPreference::from_str("Http"), Some(ProxyPreference::Http));
    }

    #[test]
    fn test_anonymity_level_ordering() {
        assert!(AnonymityLevel::High > AnonymityLevel::Medium);
        assert!(AnonymityLevel::Low > AnonymityLevel::None);
    }

    #[test]
    fn test_direct_entry_never_unhealthy() {
        let mut direct = ProxyConfig::direct();
        direct.record_failure("no route");
        assert!(direct.is_healthy);
        assert_eq!(direct.anonymity_level, AnonymityLevel::None);
        assert!(direct.endpoint.is_empty());
    }

    #[test]
    fn test_probe_outcomes_update_state() {
        let mut vpn = ProxyConfig::new(
            "vpn-1",
            "http://10.0.0.2:3128",
            ProxyKind::Vpn,
            AnonymityLevel::Medium,
        );
        vpn.record_failure("connection refused");
        assert!(!vpn.is_healthy);
        assert!(vpn.success_rate < 1.0);
        assert_eq!(vpn.last_error.as_deref(), Some("connection refused"));

        vpn.record_success(Duration::from_millis(250));
        assert!(vpn.is_healthy);
        assert_eq!(vpn.latency, Some(0.25));
        assert!(vpn.last_error.is_none());
    }

    #[test]
    fn test_last_error_not_serialized() {
        let mut http = ProxyConfig::new(
            "http-1",
            "http://proxy:8080",
            ProxyKind::Http,
            AnonymityLevel::Low,
        );
        http.record_failure("secret upstream detail");
        let json = serde_json::to_value(&http).unwrap();
        assert!(json.get("last_error").is_none());
        assert_eq!(json["kind"], "http");
    }
}
