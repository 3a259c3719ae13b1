//! Outbound HTTP execution through a selected egress path
//!
//! Each egress endpoint gets its own cached `reqwest::Client` for
//! connection reuse.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Proxy};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::config::MediatorConfig;
use crate::error::{Result, VeilError};
use crate::models::ProxyConfig;

/// Request body as sent by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
    Text(String),
    Json(serde_json::Value),
}

/// A fully prepared outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub body: Option<OutboundBody>,
}

/// What came back from the target
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Executes a request through one egress path
#[async_trait]
pub trait OutboundClient: Send + Sync {
    async fn execute(&self, proxy: &ProxyConfig, request: OutboundRequest)
        -> Result<OutboundResponse>;
}

/// `reqwest`-backed outbound client
pub struct HttpOutboundClient {
    timeout: Duration,
    max_redirects: usize,
    /// Cached clients keyed by proxy endpoint; the empty key is direct
    clients: RwLock<HashMap<String, Client>>,
}

impl HttpOutboundClient {
    pub fn new(config: &MediatorConfig) -> Self {
        Self {
            timeout: config.request_timeout,
            max_redirects: config.max_redirects,
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn client_for(&self, endpoint: &str) -> Result<Client> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(endpoint) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }

        let builder = Client::builder()
            .timeout(self.timeout)
            .redirect(Policy::limited(self.max_redirects));

        let builder = if endpoint.is_empty() {
            builder.no_proxy()
        } else {
            let proxy = Proxy::all(endpoint)
                .map_err(|e| VeilError::InvalidProxyAddress(e.without_url().to_string()))?;
            builder.proxy(proxy)
        };

        let client = builder
            .build()
            .map_err(|e| VeilError::Internal(format!("failed to build HTTP client: {}", e)))?;

        info!(direct = endpoint.is_empty(), "Created new outbound client");
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl OutboundClient for HttpOutboundClient {
    async fn execute(
        &self,
        proxy: &ProxyConfig,
        request: OutboundRequest,
    ) -> Result<OutboundResponse> {
        let client = self.client_for(&proxy.endpoint).await?;

        let mut builder = client
            .request(request.method, request.url)
            .headers(to_header_map(&request.headers)?);

        builder = match request.body {
            Some(OutboundBody::Text(text)) => builder.body(text),
            Some(OutboundBody::Json(value)) => builder.json(&value),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = from_header_map(response.headers());
        let body = response.text().await?;

        debug!(proxy = %proxy.name, status, "Outbound request completed");

        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }
}

pub(crate) fn to_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| VeilError::InvalidRequest(format!("invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| VeilError::InvalidRequest(format!("invalid value for header {}", name)))?;
        map.append(name, value);
    }

    Ok(map)
}

/// Flatten response headers, joining repeated names with ", "
fn from_header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();

    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    out
}
