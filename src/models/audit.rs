use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AnonymityLevel;

/// Anonymized record of one mediated outbound call
///
/// Carries the target domain only. The full URL, path, query string,
/// headers and body never enter an audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub method: String,
    pub status_code: u16,
    pub proxy_used: String,
    pub anonymity_level: AnonymityLevel,
}

impl AuditRecord {
    pub fn new(
        request_id: Uuid,
        target_url: &str,
        method: impl Into<String>,
        status_code: u16,
        proxy_used: impl Into<String>,
        anonymity_level: AnonymityLevel,
    ) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            domain: domain_of(target_url),
            method: method.into(),
            status_code,
            proxy_used: proxy_used.into(),
            anonymity_level,
        }
    }
}

/// Host part of a URL, or `"unknown"` when it cannot be parsed
pub fn domain_of(target_url: &str) -> String {
    url::Url::parse(target_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
