use crate::error::{Result, VeilError};
use crate::models::ProxyKind;
use std::env;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiServerConfig,
    /// Anonymity network daemon configuration
    pub tor: TorConfig,
    /// Proxy pool configuration
    pub pool: PoolConfig,
    /// Request mediation configuration
    pub mediator: MediatorConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
}

impl ApiServerConfig {
    pub fn bind_addr(&self) -> String {
        format_tcp_addr(&self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct TorConfig {
    /// Whether the control-protocol integration is enabled at all
    pub enabled: bool,
    pub host: String,
    /// SOCKS traffic port (default: 9050)
    pub socks_port: u16,
    /// Control port (default: 9051)
    pub control_port: u16,
    pub control_password: Option<String>,
    /// Minimum time between two identity rotations
    pub min_identity_interval: Duration,
    /// Time given to the daemon to build fresh circuits after NEWNYM
    pub circuit_settle: Duration,
    /// Bound on connects and on every control command/reply exchange
    pub control_timeout: Duration,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            socks_port: 9050,
            control_port: 9051,
            control_password: None,
            min_identity_interval: Duration::from_secs(10),
            circuit_settle: Duration::from_secs(2),
            control_timeout: Duration::from_secs(10),
        }
    }
}

impl TorConfig {
    pub fn socks_addr(&self) -> String {
        format_tcp_addr(&self.host, self.socks_port)
    }

    pub fn control_addr(&self) -> String {
        format_tcp_addr(&self.host, self.control_port)
    }
}

/// A statically configured VPN or HTTP egress path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticProxyConfig {
    pub name: String,
    pub endpoint: String,
    pub kind: ProxyKind,
    pub country: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// "Echo my address" endpoint used for connectivity probes
    pub probe_url: String,
    pub probe_timeout: Duration,
    pub health_check_interval: Duration,
    /// Concurrent probes per health round
    pub health_workers: usize,
    /// Every Nth selection also attempts a rotation
    pub rotate_every: u64,
    /// Minimum time since the last rotation before a selection may rotate
    pub rotation_cooldown: Duration,
    /// Traffic address (`host:port`) of the anonymity network, `None` when disabled
    pub tor_socks: Option<String>,
    pub static_proxies: Vec<StaticProxyConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            probe_url: "https://httpbin.org/ip".to_string(),
            probe_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(300),
            health_workers: 4,
            rotate_every: 10,
            rotation_cooldown: Duration::from_secs(60),
            tor_socks: None,
            static_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Bound on one mediated outbound call
    pub request_timeout: Duration,
    pub max_redirects: usize,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let tor = TorConfig {
            enabled: parse_bool("TOR_ENABLED", true)?,
            host: get_env_or("TOR_HOST", "127.0.0.1"),
            socks_port: parse_port("TOR_SOCKS_PORT", "9050")?,
            control_port: parse_port("TOR_CONTROL_PORT", "9051")?,
            control_password: env::var("TOR_CONTROL_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
            min_identity_interval: Duration::from_secs(parse_num(
                "TOR_MIN_IDENTITY_INTERVAL",
                "10",
            )?),
            circuit_settle: Duration::from_millis(parse_num("TOR_CIRCUIT_SETTLE_MS", "2000")?),
            control_timeout: Duration::from_secs(parse_num("TOR_CONTROL_TIMEOUT", "10")?.max(1)),
        };

        let mut static_proxies = parse_proxy_list("POOL_VPN_PROXIES", ProxyKind::Vpn)?;
        static_proxies.extend(parse_proxy_list("POOL_HTTP_PROXIES", ProxyKind::Http)?);

        let pool = PoolConfig {
            probe_url: parse_probe_url()?,
            probe_timeout: Duration::from_secs(parse_num("POOL_PROBE_TIMEOUT", "10")?.max(1)),
            health_check_interval: Duration::from_secs(
                parse_num("POOL_HEALTH_CHECK_INTERVAL", "300")?.max(1),
            ),
            health_workers: parse_num("POOL_HEALTH_WORKERS", "4")?.max(1) as usize,
            rotate_every: parse_num("POOL_ROTATE_EVERY", "10")?.max(1),
            rotation_cooldown: Duration::from_secs(parse_num("POOL_ROTATION_COOLDOWN", "60")?),
            tor_socks: tor.enabled.then(|| tor.socks_addr()),
            static_proxies,
        };

        Ok(Config {
            api: ApiServerConfig {
                port: parse_port("API_PORT", "8001")?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            tor,
            pool,
            mediator: MediatorConfig {
                request_timeout: Duration::from_secs(parse_num("REQUEST_TIMEOUT", "30")?.max(1)),
                max_redirects: 10,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

/// Parse `name=url[|country]` entries separated by commas
fn parse_proxy_list(key: &str, kind: ProxyKind) -> Result<Vec<StaticProxyConfig>> {
    let raw = env::var(key).unwrap_or_default();

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_proxy_entry(key, entry, kind))
        .collect()
}

fn parse_proxy_entry(key: &str, entry: &str, kind: ProxyKind) -> Result<StaticProxyConfig> {
    let (name, rest) = entry.split_once('=').ok_or_else(|| {
        VeilError::InvalidConfig(format!("{} entry '{}' must be name=url", key, entry))
    })?;

    let (endpoint, country) = match rest.split_once('|') {
        Some((endpoint, country)) => (endpoint.trim(), Some(country.trim().to_uppercase())),
        None => (rest.trim(), None),
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(VeilError::InvalidConfig(format!(
            "{} entry '{}' has an empty name",
            key, entry
        )));
    }

    let url = Url::parse(endpoint).map_err(|e| {
        VeilError::InvalidConfig(format!("{} entry '{}' has an invalid URL: {}", key, name, e))
    })?;

    match url.scheme() {
        "http" | "https" | "socks5" | "socks5h" => {}
        other => {
            return Err(VeilError::InvalidConfig(format!(
                "{} entry '{}' has unsupported scheme: {}",
                key, name, other
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(VeilError::InvalidConfig(format!(
            "{} entry '{}' must include a host",
            key, name
        )));
    }

    Ok(StaticProxyConfig {
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        kind,
        country: country.filter(|c| !c.is_empty()),
    })
}

fn parse_probe_url() -> Result<String> {
    let raw = get_env_or("POOL_PROBE_URL", "https://httpbin.org/ip");
    let url = Url::parse(&raw).map_err(|e| {
        VeilError::InvalidConfig(format!("POOL_PROBE_URL must be a valid URL: {}", e))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(VeilError::InvalidConfig(
            "POOL_PROBE_URL must be an http(s) URL".into(),
        ));
    }

    Ok(raw)
}

fn parse_port(key: &str, default: &str) -> Result<u16> {
    get_env_or(key, default)
        .parse()
        .map_err(|_| VeilError::InvalidConfig(format!("{} must be a valid port number", key)))
}

fn parse_num(key: &str, default: &str) -> Result<u64> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| VeilError::InvalidConfig(format!("{} must be a valid number", key)))
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(VeilError::InvalidConfig(format!("{} must be a boolean", key))),
        },
    }
}

fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
