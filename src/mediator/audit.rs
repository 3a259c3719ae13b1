//! Audit trail of mediated calls
//!
//! Records are logged under the `veil::audit` target and broadcast to any
//! subscriber. Emitting never blocks the request path.

use tokio::sync::broadcast;
use tracing::info;

use crate::models::AuditRecord;

const AUDIT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AuditSink {
    sender: broadcast::Sender<AuditRecord>,
}

impl AuditSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(AUDIT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }

    pub fn emit(&self, record: AuditRecord) {
        info!(
            target: "veil::audit",
            request_id = %record.request_id,
            domain = %record.domain,
            method = %record.method,
            status_code = record.status_code,
            proxy_used = %record.proxy_used,
            anonymity_level = %record.anonymity_level,
            "Mediated request"
        );

        // No subscribers is fine
        let _ = self.sender.send(record);
    }
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::new()
    }
}
