//! Asynchronous audit emission.
//!
//! Events travel through a bounded channel to a background writer; emission
//! never blocks the request path, and a lost event never fails a request.

use crate::store::AuditStore;
use crate::types::AuditRecord;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub const AUDIT_QUEUE_DEPTH: usize = 1024;

#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditSink {
    /// Spawn the background writer and return the emit handle.
    pub fn spawn(store: Arc<dyn AuditStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(AUDIT_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = store.append(&record).await {
                    warn!(%err, action = %record.action, "audit append failed");
                }
            }
        });
        Self { tx }
    }

    /// Fire-and-forget; events are dropped with a warning under backpressure.
    pub fn emit(&self, record: AuditRecord) {
        if let Err(err) = self.tx.try_send(record) {
            warn!(%err, "audit queue saturated, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuditStore;
    use crate::types::ClientContext;
    use std::time::Duration;

    #[tokio::test]
    async fn emitted_events_reach_the_store() {
        let store = Arc::new(MemoryAuditStore::new());
        let sink = AuditSink::spawn(store.clone());

        let ctx = ClientContext {
            client_ip: Some("203.0.113.9".to_string()),
            user_agent: Some("test-agent".to_string()),
        };
        sink.emit(AuditRecord::auth(
            7,
            "AUTH_LOGIN_SUCCESS",
            &ctx,
            serde_json::json!({"username": "analyst"}),
        ));
        sink.emit(AuditRecord::anonymous_auth(
            "AUTH_LOGIN_FAILED",
            &ctx,
            serde_json::json!({"username": "ghost"}),
        ));

        // The writer runs on its own task; give it a moment to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, Some(7));
        assert_eq!(records[0].client_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(records[1].user_id, None);
        assert_eq!(records[1].action, "AUTH_LOGIN_FAILED");
    }
}
