//! Request mediation
//!
//! Runs one outbound call end to end: optional identity rotation, egress
//! selection, header scrubbing, execution, response scrubbing and an
//! anonymized audit record.

pub mod audit;
pub mod client;
pub mod sanitize;

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::anonymity::AnonymityController;
use crate::error::{Result, VeilError};
use crate::models::{AnonymityLevel, AuditRecord, ProxyKind, ProxyPreference};
use crate::pool::ProxyPoolManager;

pub use audit::AuditSink;
pub use client::{HttpOutboundClient, OutboundBody, OutboundClient, OutboundRequest, OutboundResponse};

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

/// A call to run through the mediator
#[derive(Debug, Clone, Deserialize)]
pub struct MediatedRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// A string is sent verbatim, anything else as JSON
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub proxy_type: ProxyPreference,
    #[serde(default)]
    pub rotate_identity: bool,
    #[serde(default = "default_true")]
    pub sanitize_headers: bool,
}

/// Result of a mediated call
#[derive(Debug, Clone, Serialize)]
pub struct MediatedResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub content: String,
    pub proxy_used: String,
    pub request_id: Uuid,
    pub anonymity_level: AnonymityLevel,
}

/// Outcome of an explicit rotation
#[derive(Debug, Clone, Serialize)]
pub struct RotationOutcome {
    /// False when no alternative entry existed
    pub rotated: bool,
    pub active_proxy: String,
    pub new_identity: bool,
}

/// Per-call orchestration over the pool, the controller and the outbound client
pub struct RequestMediator {
    pool: Arc<ProxyPoolManager>,
    controller: Arc<dyn AnonymityController>,
    client: Arc<dyn OutboundClient>,
    audit: AuditSink,
}

impl RequestMediator {
    pub fn new(
        pool: Arc<ProxyPoolManager>,
        controller: Arc<dyn AnonymityController>,
        client: Arc<dyn OutboundClient>,
        audit: AuditSink,
    ) -> Self {
        Self {
            pool,
            controller,
            client,
            audit,
        }
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Rotate the pool and, when the daemon is reachable, request new circuits.
    /// Both halves are best effort.
    pub async fn rotate(&self, kind: Option<ProxyKind>) -> RotationOutcome {
        let rotated_to = self.pool.rotate_identity(kind);

        let new_identity = if self.controller.is_available().await {
            self.controller.new_identity().await
        } else {
            false
        };

        RotationOutcome {
            rotated: rotated_to.is_some(),
            active_proxy: self.pool.active_name(),
            new_identity,
        }
    }

    /// Run one call through the selected egress path.
    ///
    /// Outbound failures are returned as errors after being audited; they are
    /// never retried on another path.
    #[instrument(skip(self, request), fields(request_id))]
    pub async fn mediate(&self, request: MediatedRequest) -> Result<MediatedResponse> {
        let request_id = Uuid::new_v4();
        tracing::Span::current().record("request_id", tracing::field::display(request_id));

        let url = parse_target(&request.url)?;
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| VeilError::InvalidRequest(format!("invalid method: {}", request.method)))?;

        let headers = request.headers.unwrap_or_default();
        let headers = if request.sanitize_headers {
            sanitize::sanitize_request_headers(headers)
        } else {
            headers
        };
        client::to_header_map(&headers)?;

        if request.rotate_identity {
            let outcome = self.rotate(None).await;
            info!(
                rotated = outcome.rotated,
                active = %outcome.active_proxy,
                new_identity = outcome.new_identity,
                "Identity rotation before request"
            );
        }

        let proxy = self.pool.get_proxy(request.proxy_type);

        let body = request.data.map(|data| match data {
            serde_json::Value::String(text) => OutboundBody::Text(text),
            other => OutboundBody::Json(other),
        });

        let outbound = OutboundRequest {
            method: method.clone(),
            url,
            headers,
            body,
        };

        let result = self.client.execute(&proxy, outbound).await;

        let status_code = match &result {
            Ok(response) => response.status,
            Err(e) => e.status_code().as_u16(),
        };
        self.audit.emit(AuditRecord::new(
            request_id,
            &request.url,
            method.as_str(),
            status_code,
            proxy.name.clone(),
            proxy.anonymity_level,
        ));

        let response = result.map_err(|e| {
            warn!(proxy = %proxy.name, "Mediated request failed: {}", e);
            e
        })?;

        Ok(MediatedResponse {
            status_code: response.status,
            headers: sanitize::sanitize_response_headers(response.headers),
            content: response.body,
            proxy_used: proxy.name,
            request_id,
            anonymity_level: proxy.anonymity_level,
        })
    }
}

fn parse_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(VeilError::InvalidRequest(format!(
            "unsupported URL scheme: {}",
            scheme
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::client::testing::RecordingClient;
    use super::*;
    use crate::anonymity::DisabledController;
    use crate::config::{PoolConfig, StaticProxyConfig};
    use crate::pool::probe::testing::ScriptedProbe;

    async fn pool_with_vpn() -> Arc<ProxyPoolManager> {
        let config = PoolConfig {
            health_check_interval: Duration::from_secs(3600),
            static_proxies: vec![StaticProxyConfig {
                name: "vpn-a".to_string(),
                endpoint: "http://vpn-a.internal:3128".to_string(),
                kind: ProxyKind::Vpn,
                country: Some("NL".to_string()),
            }],
            ..PoolConfig::default()
        };
        let pool = Arc::new(ProxyPoolManager::new(config, Arc::new(ScriptedProbe::new())));
        pool.initialize().await;
        pool
    }

    fn mediator(pool: Arc<ProxyPoolManager>, client: Arc<RecordingClient>) -> RequestMediator {
        RequestMediator::new(pool, Arc::new(DisabledController), client, AuditSink::new())
    }

    fn request(url: &str) -> MediatedRequest {
        serde_json::from_value(serde_json::json!({ "url": url })).unwrap()
    }

    fn ok_response() -> OutboundResponse {
        OutboundResponse {
            status: 200,
            headers: HashMap::from([
                ("server".to_string(), "Apache/2.4".to_string()),
                ("x-powered-by".to_string(), "Express".to_string()),
                ("content-type".to_string(), "text/plain".to_string()),
            ]),
            body: "hello".to_string(),
        }
    }

    #[test]
    fn test_request_defaults() {
        let req = request("https://example.org");
        assert_eq!(req.method, "GET");
        assert_eq!(req.proxy_type, ProxyPreference::Auto);
        assert!(!req.rotate_identity);
        assert!(req.sanitize_headers);
    }

    #[tokio::test]
    async fn test_mediate_scrubs_headers_and_audits_domain_only() {
        let pool = pool_with_vpn().await;
        let client = Arc::new(RecordingClient::responding(ok_response()));
        let mediator = mediator(pool.clone(), client.clone());
        let mut audit = mediator.audit().subscribe();

        let mut req = request("https://api.example.org/v1/users?token=secret");
        req.proxy_type = ProxyPreference::Vpn;
        req.headers = Some(HashMap::from([
            ("X-Forwarded-For".to_string(), "198.51.100.4".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ]));

        let response = mediator.mediate(req).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.proxy_used, "vpn-a");
        assert_eq!(response.anonymity_level, AnonymityLevel::Medium);
        assert_eq!(response.content, "hello");
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.headers["content-type"], "text/plain");

        let seen = client.seen.lock();
        let (proxy_name, outbound) = &seen[0];
        assert_eq!(proxy_name, "vpn-a");
        assert!(!outbound.headers.contains_key("X-Forwarded-For"));
        assert_eq!(outbound.headers["Accept"], "*/*");
        assert!(outbound.headers.contains_key("User-Agent"));
        drop(seen);

        let record = audit.recv().await.unwrap();
        assert_eq!(record.request_id, response.request_id);
        assert_eq!(record.domain, "api.example.org");
        assert_eq!(record.method, "GET");
        assert_eq!(record.status_code, 200);
        assert_eq!(record.proxy_used, "vpn-a");
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("token"));
        assert!(!json.contains("/v1/users"));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_mediate_without_sanitizing_keeps_headers() {
        let pool = pool_with_vpn().await;
        let client = Arc::new(RecordingClient::responding(ok_response()));
        let mediator = mediator(pool.clone(), client.clone());

        let mut req = request("http://example.org/");
        req.sanitize_headers = false;
        req.headers = Some(HashMap::from([(
            "X-Real-IP".to_string(),
            "198.51.100.4".to_string(),
        )]));
        req.data = Some(serde_json::json!("raw body"));

        mediator.mediate(req).await.unwrap();

        let seen = client.seen.lock();
        let outbound = &seen[0].1;
        assert_eq!(outbound.headers.len(), 1);
        assert_eq!(outbound.headers["X-Real-IP"], "198.51.100.4");
        assert_eq!(outbound.body, Some(OutboundBody::Text("raw body".to_string())));
        drop(seen);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_upstream_failure_is_audited_and_surfaced() {
        let pool = pool_with_vpn().await;
        let client = Arc::new(RecordingClient::failing(VeilError::UpstreamRequest(
            "connection refused".to_string(),
        )));
        let mediator = mediator(pool.clone(), client);
        let mut audit = mediator.audit().subscribe();

        let err = mediator
            .mediate(request("https://down.example.net/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, VeilError::UpstreamRequest(ref r) if r == "connection refused"));
        assert!(err.is_server_error());

        let record = audit.recv().await.unwrap();
        assert_eq!(record.status_code, 502);
        assert_eq!(record.domain, "down.example.net");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_target_rejected_before_selection() {
        let pool = pool_with_vpn().await;
        let client = Arc::new(RecordingClient::responding(ok_response()));
        let mediator = mediator(pool.clone(), client.clone());

        let err = mediator.mediate(request("ftp://example.org/file")).await.unwrap_err();
        assert!(matches!(err, VeilError::InvalidRequest(_)));

        let mut req = request("https://example.org");
        req.method = "GE T".to_string();
        assert!(mediator.mediate(req).await.is_err());

        assert_eq!(pool.request_count(), 0);
        assert!(client.seen.lock().is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_headers_rejected_before_selection() {
        let pool = pool_with_vpn().await;
        let client = Arc::new(RecordingClient::responding(ok_response()));
        let mediator = mediator(pool.clone(), client.clone());
        let mut audit = mediator.audit().subscribe();

        let mut req = request("https://example.org");
        req.rotate_identity = true;
        req.headers = Some(HashMap::from([("Bad Header".to_string(), "x".to_string())]));
        let err = mediator.mediate(req).await.unwrap_err();
        assert!(matches!(err, VeilError::InvalidRequest(ref m) if m.contains("header name")));

        let mut req = request("https://example.org");
        req.headers = Some(HashMap::from([("X-Note".to_string(), "line\nbreak".to_string())]));
        let err = mediator.mediate(req).await.unwrap_err();
        assert!(matches!(err, VeilError::InvalidRequest(ref m) if m.contains("x-note")));

        assert_eq!(pool.request_count(), 0);
        assert_eq!(pool.active_name(), "vpn-a");
        assert!(client.seen.lock().is_empty());
        assert!(matches!(
            audit.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_requested_with_disabled_controller() {
        let pool = pool_with_vpn().await;
        let client = Arc::new(RecordingClient::responding(ok_response()));
        let mediator = mediator(pool.clone(), client);

        let before = pool.active_name();
        let mut req = request("https://example.org");
        req.rotate_identity = true;
        req.proxy_type = ProxyPreference::Direct;
        let response = mediator.mediate(req).await.unwrap();

        assert_eq!(response.proxy_used, "direct");
        assert_eq!(before, "vpn-a");

        let outcome = mediator.rotate(None).await;
        assert!(!outcome.new_identity);
        assert!(outcome.rotated);
        assert_eq!(outcome.active_proxy, "vpn-a");
        pool.shutdown().await;
    }
}
